//! HTTP surface of a single lock authority.
//!
//! Serves the three atomic primitives of a [`KeyStore`] so that coordinators
//! on other hosts can reach it through [`HttpAuthority`](crate::authority::HttpAuthority).

use std::{sync::Arc, time::{Duration, Instant}};

use axum::{
    extract::{Path, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    error::ApiError,
    metrics::{Metrics, Operation},
    models::{
        validate_key, validate_token, validate_ttl_ms, AcquireKeyRequest, ExtendKeyRequest, GrantResponse,
        KeyStatus, KeyStatusResponse, ReleaseKeyRequest,
    },
    store::KeyStore,
};

#[derive(Clone)]
pub struct NodeState {
    pub store: KeyStore,
    pub metrics: Arc<Metrics>,
}

impl NodeState {
    pub fn new(store: KeyStore) -> Self {
        Self {
            store,
            metrics: Arc::new(Metrics::default()),
        }
    }
}

pub fn router(state: NodeState) -> Router {
    Router::new()
        .route("/keys/:key/acquire", post(acquire_key))
        .route("/keys/:key/extend", post(extend_key))
        .route("/keys/:key/release", post(release_key))
        .route("/keys/:key", get(key_status))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn acquire_key(
    Path(key): Path<String>,
    State(state): State<NodeState>,
    Json(req): Json<AcquireKeyRequest>,
) -> Result<Json<GrantResponse>, ApiError> {
    let started = Instant::now();
    let outcome = validate_key(&key)
        .and_then(|_| validate_token(&req.token))
        .and_then(|_| validate_ttl_ms(req.ttl_ms))
        .map(|_| state.store.try_acquire(&key, &req.token, Duration::from_millis(req.ttl_ms)));
    finish(&state, Operation::Acquire, started, &key, outcome)
}

pub async fn extend_key(
    Path(key): Path<String>,
    State(state): State<NodeState>,
    Json(req): Json<ExtendKeyRequest>,
) -> Result<Json<GrantResponse>, ApiError> {
    let started = Instant::now();
    let outcome = validate_key(&key)
        .and_then(|_| validate_token(&req.token))
        .and_then(|_| validate_ttl_ms(req.ttl_ms))
        .map(|_| state.store.try_extend(&key, &req.token, Duration::from_millis(req.ttl_ms)));
    finish(&state, Operation::Extend, started, &key, outcome)
}

pub async fn release_key(
    Path(key): Path<String>,
    State(state): State<NodeState>,
    Json(req): Json<ReleaseKeyRequest>,
) -> Result<Json<GrantResponse>, ApiError> {
    let started = Instant::now();
    let outcome = validate_key(&key)
        .and_then(|_| validate_token(&req.token))
        .map(|_| state.store.release(&key, &req.token));
    finish(&state, Operation::Release, started, &key, outcome)
}

fn finish(
    state: &NodeState,
    operation: Operation,
    started: Instant,
    key: &str,
    outcome: Result<bool, ApiError>,
) -> Result<Json<GrantResponse>, ApiError> {
    let granted = matches!(outcome, Ok(true));
    state.metrics.record(operation, started, granted, outcome.is_err());
    let granted = outcome?;
    debug!("{:?} {} -> granted={}", operation, key, granted);
    Ok(Json(GrantResponse { granted }))
}

pub async fn key_status(
    Path(key): Path<String>,
    State(state): State<NodeState>,
) -> Result<Json<KeyStatusResponse>, ApiError> {
    let started = Instant::now();
    let result = validate_key(&key);
    state.metrics.record(Operation::Status, started, false, result.is_err());
    result?;

    let response = match state.store.status(&key) {
        Some(entry) => KeyStatusResponse {
            key,
            status: KeyStatus::Held,
            ttl_remaining_ms: Some(entry.ttl_remaining().as_millis() as u64),
        },
        None => KeyStatusResponse {
            key,
            status: KeyStatus::Free,
            ttl_remaining_ms: None,
        },
    };
    Ok(Json(response))
}

async fn metrics(State(state): State<NodeState>) -> Response {
    let mut response = Json(state.metrics.snapshot(state.store.len())).into_response();
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-store"));
    response
}

async fn health_check() -> &'static str {
    "OK"
}

/// Serve an authority node until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: NodeState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!("Authority node {} listening on {}", state.store.endpoint(), listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
