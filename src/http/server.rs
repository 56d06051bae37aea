//! HTTP API server for Mortar
//!
//! Write routes require a non-empty `apikey` query parameter. Read routes are open.

use crate::{
    context::Context,
    core::{Query, QualifyResult, Stream, TripleSource, UrlParams},
    dataset::{
        spawn_csv_parser, spawn_rdf_parser, ArrayDataset, StreamingDataset, StreamingTripleDataset,
    },
    encoding::ARROW_STREAM_CONTENT_TYPE,
    engine::{Engine, IngestSummary},
    error::MortarError,
};
use axum::{
    body::{Body, Bytes},
    extract::{RawQuery, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::{future::Future, io, sync::Arc};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

/// Size of the in-process pipe between the Arrow encoder and the response body
const RESPONSE_PIPE_BYTES: usize = 64 * 1024;

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Shared application state
pub struct AppState {
    pub engine: Engine,
}

/// Custom error type for API errors
#[derive(Debug)]
pub enum ApiError {
    Engine(MortarError),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Engine(e) => {
                let status = match &e {
                    MortarError::NotFound(_) => StatusCode::NOT_FOUND,
                    e if e.is_client_error() => StatusCode::BAD_REQUEST,
                    MortarError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        if status.is_client_error() {
            warn!(status = %status, error = %message, "Rejected request");
        } else {
            error!(status = %status, error = %message, "Request failed");
        }
        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<MortarError> for ApiError {
    fn from(err: MortarError) -> Self {
        ApiError::Engine(err)
    }
}

/// Create the HTTP server with all routes
pub fn create_server(engine: Engine) -> Router {
    let state = Arc::new(AppState { engine });

    // Configure CORS
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let protected: Router<Arc<AppState>> = Router::new()
        .route("/register_stream", post(register_stream))
        .route("/insert/data", post(insert_json_data))
        .route("/insert/csv", post(insert_csv_file))
        .route("/insert/metadata", post(insert_triples_from_file))
        .route("/query/model", get(read_model))
        .route_layer(middleware::from_fn(require_apikey));

    Router::new()
        .merge(protected)
        .route("/query", get(read_data_chunk))
        .route("/sparql", post(serve_sparql_query))
        .route("/qualify", post(handle_qualify))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(addr: &str, engine: Engine, shutdown: F) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_server(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Mortar HTTP API server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn require_apikey(RawQuery(raw): RawQuery, request: Request, next: Next) -> Response {
    let has_key = UrlParams::parse(raw.as_deref().unwrap_or_default())
        .map(|params| params.get_non_empty("apikey").is_some())
        .unwrap_or(false);
    if !has_key {
        return (StatusCode::UNAUTHORIZED, "Non-existent or invalid apikey").into_response();
    }
    next.run(request).await
}

fn params(raw: Option<String>) -> Result<UrlParams, ApiError> {
    UrlParams::parse(raw.as_deref().unwrap_or_default()).map_err(ApiError::from)
}

/// Adapt a request body for the blocking parsers. Must be called on the runtime.
fn body_reader(body: Body) -> SyncIoBridge<impl AsyncRead + Unpin + Send + 'static> {
    let chunks = body.into_data_stream().map_err(io::Error::other);
    SyncIoBridge::new(StreamReader::new(chunks))
}

async fn health_check() -> impl IntoResponse {
    Json(SuccessResponse { message: "Mortar HTTP API is running".to_string() })
}

/// POST /register_stream
async fn register_stream(
    State(state): State<Arc<AppState>>,
    Json(stream): Json<Stream>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.engine.register_stream(&Context::background(), &stream).await?;
    Ok(Json(SuccessResponse { message: format!("Registered {}", stream) }))
}

/// POST /insert/data - a JSON dataset
async fn insert_json_data(
    State(state): State<Arc<AppState>>,
    Json(mut dataset): Json<ArrayDataset>,
) -> Result<Json<IngestSummary>, ApiError> {
    info!(%dataset, "Inserting JSON dataset");
    let summary = state.engine.insert_historical_data(&Context::background(), &mut dataset).await?;
    Ok(Json(summary))
}

/// POST /insert/csv - registers the stream named by the URL, then loads `timestamp,value` rows
async fn insert_csv_file(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
    body: Body,
) -> Result<Json<IngestSummary>, ApiError> {
    let stream = Stream::from_params(&params(raw)?)
        .map_err(|e| ApiError::BadRequest(format!("Could not read source from params: {}", e)))?;

    let ctx = Context::background();
    state.engine.register_stream(&ctx, &stream).await?;

    let ingest = ctx.child();
    let (tx, mut dataset) = StreamingDataset::channel(&stream.source_name, &stream.name);
    let parser = spawn_csv_parser(body_reader(body), tx, ingest.clone());

    let result = state.engine.insert_historical_data(&ingest, &mut dataset).await;
    // unblocks the parser if the insert stopped early
    drop(dataset);
    let rows = parser
        .await
        .map_err(|e| MortarError::Internal(format!("CSV parser failed: {}", e)))?;
    let summary = result?;
    info!(rows, "Loaded CSV file");
    Ok(Json(summary))
}

/// POST /insert/metadata - an RDF document; `source`, `origin` and `format` come from the URL
async fn insert_triples_from_file(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
    body: Body,
) -> Result<Json<IngestSummary>, ApiError> {
    let source = TripleSource::from_params(&params(raw)?)
        .map_err(|e| ApiError::BadRequest(format!("Could not read source from params: {}", e)))?;

    let ingest = Context::background();
    let (tx, mut dataset) =
        StreamingTripleDataset::channel(&source.source, &source.origin, source.time);
    let parser = spawn_rdf_parser(body_reader(body), source.format, tx, ingest.clone());

    let result = state.engine.add_triples(&ingest, &mut dataset).await;
    drop(dataset);
    parser.await.map_err(|e| MortarError::Internal(format!("RDF parser failed: {}", e)))?;
    Ok(Json(result?))
}

/// GET /query - Arrow IPC metadata stream followed by the data stream
async fn read_data_chunk(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = Query::from_params(&params(raw)?)
        .map_err(|e| ApiError::BadRequest(format!("Could not read query from params: {}", e)))?;

    // failures up to here are still reported with a status code
    let ctx = Context::background();
    let ids = state.engine.resolve_query(&ctx, &query).await?;

    let (mut writer, reader) = tokio::io::duplex(RESPONSE_PIPE_BYTES);
    let engine = state.engine.clone();
    let encoder = tokio::spawn(async move {
        engine.write_resolved(&ctx, &query, &ids, &mut writer).await
    });

    // an encoding failure after the first byte can only abort the body
    let tail = stream::once(async move {
        match encoder.await {
            Ok(Ok(summary)) => {
                info!(streams = summary.streams, rows = summary.rows, batches = summary.batches, "Read data chunk");
                None
            }
            Ok(Err(err)) => {
                error!(error = %err, "Aborting read response");
                Some(Err::<Bytes, io::Error>(io::Error::other(err.to_string())))
            }
            Err(err) => Some(Err(io::Error::other(err.to_string()))),
        }
    })
    .filter_map(future::ready);

    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));
    Ok(([(header::CONTENT_TYPE, ARROW_STREAM_CONTENT_TYPE)], body).into_response())
}

/// POST /sparql - raw reasoner answer for `site`; the query is the `query` parameter or the body
async fn serve_sparql_query(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
    body: String,
) -> Result<Response, ApiError> {
    let params = params(raw)?;
    let site = params.get("site").unwrap_or_default().to_string();
    let query = match params.get_non_empty("query") {
        Some(query) => query.to_string(),
        None if !body.trim().is_empty() => body,
        None => return Err(ApiError::BadRequest("Bad SPARQL query: empty query".to_string())),
    };

    info!(%site, "Query SPARQL");
    let answer = state
        .engine
        .query_sparql_raw(&Context::background(), &site, &query)
        .await
        .map_err(|e| e.context("Bad SPARQL query"))?;
    Ok(([(header::CONTENT_TYPE, "application/sparql-results+json")], answer).into_response())
}

/// POST /qualify - JSON list of queries in, per-graph counts out
async fn handle_qualify(
    State(state): State<Arc<AppState>>,
    Json(queries): Json<Vec<String>>,
) -> Result<Json<QualifyResult>, ApiError> {
    let result = state
        .engine
        .qualify(&Context::background(), &queries)
        .await
        .map_err(|e| e.context("Could not qualify"))?;
    Ok(Json(result))
}

/// GET /query/model - stored statements as N-Triples, optionally for one `source`
async fn read_model(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let params = params(raw)?;
    let statements = state
        .engine
        .statements(&Context::background(), params.get_non_empty("source"))
        .await
        .map_err(|e| e.context("Could not write graph"))?;

    let mut body = String::new();
    for st in &statements {
        body.push_str(&format!("{} {} {} .\n", st.subject, st.predicate, st.object));
    }
    Ok(([(header::CONTENT_TYPE, "application/n-triples")], body).into_response())
}
