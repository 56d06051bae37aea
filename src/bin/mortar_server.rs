//! HTTP Server Binary for Mortar
//!
//! Connects to PostgreSQL/TimescaleDB (waiting until it is reachable), migrates the
//! schema and serves the HTTP API until Ctrl-C.
//!
//! Usage:
//!   cargo run --bin mortar-server -- --http-port 5001 --db-host localhost --reasoner embedded

use clap::{Parser, ValueEnum};
use mortar::{
    config::Config,
    http::start_server,
    logging,
    reasoner::{EmbeddedReasoner, HttpReasoner, Reasoner},
    storage::{PostgresStore, Store},
    Engine,
};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReasonerKind {
    /// Remote reasoner at --reasoner-address
    Http,
    /// In-process oxigraph evaluation over the stored statements
    Embedded,
}

#[derive(Parser, Debug)]
#[command(name = "Mortar HTTP Server")]
#[command(about = "Metadata-aware time-series data platform", long_about = None)]
struct Args {
    #[arg(long, env = "MORTAR_HTTP_ADDRESS", default_value = "localhost")]
    http_address: String,

    #[arg(long, env = "MORTAR_HTTP_PORT", default_value = "5001")]
    http_port: String,

    #[arg(long, env = "MORTAR_DB_HOST", default_value = "localhost")]
    db_host: String,

    #[arg(long, env = "MORTAR_DB_DATABASE", default_value = "mortar")]
    db_database: String,

    #[arg(long, env = "MORTAR_DB_USER", default_value = "mortarchangeme")]
    db_user: String,

    #[arg(long, env = "MORTAR_DB_PASSWORD", default_value = "mortarpasswordchangeme", hide_env_values = true)]
    db_password: String,

    #[arg(long, env = "MORTAR_DB_PORT", default_value = "5434")]
    db_port: String,

    #[arg(long, env = "MORTAR_REASONER_ADDRESS", default_value = "localhost:3030")]
    reasoner_address: String,

    #[arg(long, value_enum, default_value = "http")]
    reasoner: ReasonerKind,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::insecure_defaults();
        config.http.listen_address = self.http_address;
        config.http.port = self.http_port;
        config.database.host = self.db_host;
        config.database.database = self.db_database;
        config.database.user = self.db_user;
        config.database.password = self.db_password;
        config.database.port = self.db_port;
        config.reasoner.address = self.reasoner_address;
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(&args.log_level);

    if let Err(e) = run(args).await {
        error!(error = %e, "Mortar server failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> mortar::Result<()> {
    let kind = args.reasoner;
    let config = args.into_config();
    config.check()?;

    let store = Arc::new(PostgresStore::connect(&config.database).await?);
    store.migrate().await?;

    let reasoner: Arc<dyn Reasoner> = match kind {
        ReasonerKind::Http => Arc::new(HttpReasoner::new(&config.reasoner)?),
        ReasonerKind::Embedded => {
            let embedded = EmbeddedReasoner::new();
            let loaded = embedded.refresh_from(store.as_ref()).await?;
            info!(statements = loaded, "Loaded embedded reasoner");
            Arc::new(embedded)
        }
    };

    let engine = Engine::new(store.clone(), reasoner)
        .with_timeouts(config.timeouts)
        .with_read_batch_rows(config.read_batch_rows);

    let served = start_server(&config.http_address(), engine, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for shutdown signal");
        }
        info!("Shutting down");
    })
    .await;

    store.close().await;
    served
}
