//! HTTP API module for Mortar
//!
//! A thin axum front-end over [`crate::engine::Engine`]:
//! - stream registration and data/metadata ingestion (apikey required)
//! - Arrow IPC reads, SPARQL passthrough and query qualification

pub mod server;

pub use server::{create_server, start_server, ApiError, AppState, ErrorResponse, SuccessResponse};
