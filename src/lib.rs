//! # Mortar
//!
//! Mortar is a metadata-aware time-series data platform. Clients register named
//! timeseries ("streams") tagged with a Brick class and URI, push historical
//! readings and ontology statements, and read back time ranges of values selected
//! by explicit ids, by URI, or by a SPARQL query over the metadata graph, with
//! optional time-bucketed aggregation pushed down to the store.
//!
//! ## Features
//!
//! - Transactional bulk ingestion through staging tables with last-writer-wins merges
//! - Streaming CSV and RDF uploads with one element of lookahead
//! - Query resolution through a SPARQL reasoner
//! - Arrow IPC responses chunked to bound memory
//! - Batch qualification of SPARQL queries against every known graph
//!
//! ## Example
//!
//! ```rust
//! use mortar::{
//!     core::Stream, reasoner::EmbeddedReasoner, storage::MemoryStore, Context, Engine, Result,
//! };
//! use std::sync::Arc;
//!
//! async fn example() -> Result<()> {
//!     let engine = Engine::new(Arc::new(MemoryStore::new()), Arc::new(EmbeddedReasoner::new()));
//!     engine.register_stream(&Context::background(), &Stream::new("bldg1", "temp", "degF")).await
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unnecessary_map_or)]

/// Configuration structures and utilities
pub mod config;

/// Deadline-scoped execution contexts
pub mod context;

/// Core data structures and types
pub mod core;

/// Datasets feeding the bulk loader
pub mod dataset;

/// Arrow IPC response encoding
pub mod encoding;

/// The data engine and its five operations
pub mod engine;

pub mod error;

/// HTTP front-end
pub mod http;

pub mod logging;

/// SPARQL reasoner clients
pub mod reasoner;

/// Relational store abstraction and implementations
pub mod storage;

// Re-export commonly used types
pub use context::Context;
pub use engine::Engine;
pub use error::{MortarError, Result};
