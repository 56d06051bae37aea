//! Logging setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to the
//! binary so that tests and embedders can choose their own.

use tracing_subscriber::EnvFilter;

/// Install a console subscriber. `RUST_LOG` overrides `default_level`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mortar={},tower_http=info", default_level)));

    // try_init fails if a subscriber is already installed, which is fine
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
