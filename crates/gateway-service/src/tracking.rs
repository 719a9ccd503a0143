//! Request tracking (C11): correlation-ID binding, `X-Request-ID` /
//! `X-Process-Time` response headers, and an access-log line per request.

use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use tracing::info_span;
use tracing::Instrument;

pub async fn track_request(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let client_ip = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!("request", request_id = %request_id, client_ip = %client_ip, method = %method, path = %path);

    async move {
        let start = Instant::now();
        let mut response = next.run(request).await;
        let elapsed = start.elapsed().as_secs_f64();

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{:.4}", elapsed)) {
            headers.insert("x-process-time", value);
        }
        tracing::info!(status = response.status().as_u16(), elapsed_sec = elapsed, "request handled");
        response
    }
    .instrument(span)
    .await
}
