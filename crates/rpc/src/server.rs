use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use quill_executor::{LookupError, SubmitError, TxEngine};
use quill_mempool::MempoolError;
use quill_storage::Storage;
use quill_types::amount::amount_string;
use quill_types::{
    parse_tx_hash, Address, Amount, BlockHeader, Event, Receipt, Transaction, TxHash,
    TOPIC_TRANSACTION_RESULT,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TxEngine>,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: Arc<TxEngine>, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    version: &'static str,
    chain_id: u32,
    latest_height: u64,
    mempool_size: usize,
    uptime_secs: u64,
    req_total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub address: String,
    #[serde(with = "amount_string")]
    pub balance: Amount,
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawTransactionRequest {
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTransactionResponse {
    pub txhash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<Event>,
    /// Error carried by the transaction result event, if execution failed.
    #[serde(rename = "eventError", default, skip_serializing_if = "Option::is_none")]
    pub event_error: Option<String>,
}

impl EventsResponse {
    fn from_events(events: Vec<Event>) -> Self {
        let event_error = events
            .iter()
            .find(|event| event.topic == TOPIC_TRANSACTION_RESULT)
            .and_then(|event| event.error.clone());
        Self {
            events,
            event_error,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match &err {
            SubmitError::Pool(MempoolError::PoolFull { .. }) => {
                ApiError::service_unavailable(err.to_string())
            }
            SubmitError::Internal(_) => ApiError::internal(err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound => ApiError::not_found("transaction not found"),
            LookupError::Pending => ApiError::not_found("transaction not yet confirmed"),
            LookupError::Internal(err) => ApiError::internal(format!("lookup failed: {err}")),
        }
    }
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn start_server(state: AppState, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = bind_listener(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr().ok();
    info!(addr = ?local, "RPC server listening");
    let app = build_router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("RPC server terminated unexpectedly")
}

pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/account/:address", get(handle_get_account))
        .route("/tx", post(handle_submit_tx))
        .route("/tx/raw", post(handle_submit_raw_tx))
        .route("/tx/:hash", get(handle_get_transaction))
        .route("/tx/:hash/receipt", get(handle_get_receipt))
        .route("/tx/:hash/events", get(handle_get_events))
        .route("/block/latest", get(handle_latest_block))
        .route("/block/:height", get(handle_get_block))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let req_total = state.record_request();
    let latest_height = state
        .engine
        .storage()
        .get_latest_height()
        .map_err(|err| ApiError::internal(format!("failed to read chain height: {err}")))?;

    Ok(Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        chain_id: state.engine.chain_id(),
        latest_height,
        mempool_size: state.engine.mempool().size(),
        uptime_secs: state.uptime_seconds(),
        req_total,
    }))
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let req_total = state.record_request();
    let uptime = state.uptime_seconds();
    let mempool_size = state.engine.mempool().size();

    let mut metrics =
        "# HELP quill_http_requests_total Total number of RPC requests handled\n".to_string();
    metrics.push_str("# TYPE quill_http_requests_total counter\n");
    metrics.push_str(&format!("quill_http_requests_total {req_total}\n"));
    metrics.push_str("# HELP quill_uptime_seconds Uptime of the node in seconds\n");
    metrics.push_str("# TYPE quill_uptime_seconds gauge\n");
    metrics.push_str(&format!("quill_uptime_seconds {uptime}\n"));
    match &state.metrics {
        Some(handle) => metrics.push_str(&handle.render()),
        None => {
            metrics.push_str("# HELP quill_mempool_size Number of transactions in mempool\n");
            metrics.push_str("# TYPE quill_mempool_size gauge\n");
            metrics.push_str(&format!("quill_mempool_size {mempool_size}\n"));
        }
    }

    let mut response = Response::new(Body::from(metrics));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

async fn handle_get_account(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> Result<Json<AccountResponse>, ApiError> {
    state.record_request();
    let address = Address::from_str(&address)
        .map_err(|err| ApiError::bad_request(format!("invalid address: {err}")))?;
    let account = state
        .engine
        .account_state(&address)
        .map_err(|err| ApiError::internal(format!("failed to fetch account: {err}")))?;

    Ok(Json(AccountResponse {
        address: address.to_string(),
        balance: account.balance,
        nonce: account.nonce,
    }))
}

async fn handle_submit_tx(
    State(state): State<SharedState>,
    payload: Result<Json<Transaction>, JsonRejection>,
) -> Result<Json<SubmitTransactionResponse>, ApiError> {
    state.record_request();
    let Json(tx) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let hash = state.engine.submit(tx)?;
    debug!(tx = %hex::encode(hash), "transaction submitted");
    Ok(Json(SubmitTransactionResponse {
        txhash: hex::encode(hash),
    }))
}

async fn handle_submit_raw_tx(
    State(state): State<SharedState>,
    payload: Result<Json<RawTransactionRequest>, JsonRejection>,
) -> Result<Json<SubmitTransactionResponse>, ApiError> {
    state.record_request();
    let Json(request) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let hash = state.engine.submit_raw(&request.data)?;
    Ok(Json(SubmitTransactionResponse {
        txhash: hex::encode(hash),
    }))
}

async fn handle_get_transaction(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<Json<Transaction>, ApiError> {
    state.record_request();
    let hash = parse_hash(&hash)?;
    state
        .engine
        .transaction(&hash)
        .map_err(|err| ApiError::internal(format!("failed to fetch transaction: {err}")))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("transaction not found"))
}

async fn handle_get_receipt(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<Json<Receipt>, ApiError> {
    state.record_request();
    let hash = parse_hash(&hash)?;
    Ok(Json(state.engine.receipt(&hash)?))
}

async fn handle_get_events(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<Json<EventsResponse>, ApiError> {
    state.record_request();
    let hash = parse_hash(&hash)?;
    let events = state.engine.events(&hash)?;
    Ok(Json(EventsResponse::from_events(events)))
}

async fn handle_latest_block(
    State(state): State<SharedState>,
) -> Result<Json<BlockHeader>, ApiError> {
    state.record_request();
    state
        .engine
        .latest_block()
        .map_err(|err| ApiError::internal(format!("failed to fetch latest block: {err}")))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no blocks yet"))
}

async fn handle_get_block(
    State(state): State<SharedState>,
    Path(height): Path<String>,
) -> Result<Json<BlockHeader>, ApiError> {
    state.record_request();
    let height = height
        .parse::<u64>()
        .map_err(|_| ApiError::bad_request(format!("invalid block height: {height}")))?;
    state
        .engine
        .block(height)
        .map_err(|err| ApiError::internal(format!("failed to fetch block by height: {err}")))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("block not found"))
}

fn parse_hash(value: &str) -> Result<TxHash, ApiError> {
    parse_tx_hash(value).ok_or_else(|| {
        warn!(hash = value, "rejected malformed transaction hash");
        ApiError::bad_request("invalid transaction hash: expected 32-byte hex string")
    })
}

impl ApiError {
    fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn service_unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}
