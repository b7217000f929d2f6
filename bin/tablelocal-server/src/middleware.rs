//! Router middleware: authorization, metrics, timeouts and the headers
//! every table service response carries.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tablelocal_api::handlers::DATA_SERVICE_VERSION;
use tablelocal_api::{ApiError, AppState, TableOperation, effective_method};
use tablelocal_common::Error;
use tracing::warn;
use uuid::Uuid;

/// Service version reported in `x-ms-version`
pub const SERVICE_VERSION: &str = "2019-02-02";

fn is_service_endpoint(path: &str) -> bool {
    path == "/health" || path == "/metrics"
}

/// Reject requests the configured auth mode does not accept
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if is_service_endpoint(request.uri().path()) {
        return next.run(request).await;
    }
    if let Err(e) =
        state
            .authenticator
            .authorize(request.method(), request.uri(), request.headers())
    {
        return ApiError(e).into_response();
    }
    next.run(request).await
}

/// Record per-operation request metrics
pub async fn metrics_layer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();

    let path = request.uri().path();
    if is_service_endpoint(path) {
        return next.run(request).await;
    }
    let x_http_method = request
        .headers()
        .get("x-http-method")
        .and_then(|v| v.to_str().ok());
    let method = effective_method(request.method(), x_http_method);
    let operation = TableOperation::classify(&method, path, &state.account);

    let request_bytes = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let response = next.run(request).await;

    if let Some(op) = operation {
        let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        state
            .metrics
            .record_operation(op, response.status().as_u16(), request_bytes, latency_us);
    }
    response
}

/// Bound the time a request may take
pub async fn timeout_layer(
    State(timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("Request to {} timed out after {:?}", path, timeout);
            ApiError(Error::Timeout).into_response()
        }
    }
}

/// Stamp the standard service headers onto every response
pub async fn service_headers(request: Request, next: Next) -> Response {
    let client_request_id = request.headers().get("x-ms-client-request-id").cloned();

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert("x-ms-request-id", value);
    }
    headers.insert("x-ms-version", HeaderValue::from_static(SERVICE_VERSION));
    if let Ok(value) =
        HeaderValue::from_str(&Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    {
        headers.insert(header::DATE, value);
    }
    headers.insert(
        "dataserviceversion",
        HeaderValue::from_static(DATA_SERVICE_VERSION),
    );
    if let Some(id) = client_request_id {
        headers.insert("x-ms-client-request-id", id);
    }
    response
}
