//! Ambient error taxonomy → HTTP mapping (C14). `GatewayError` itself has no
//! `axum` dependency (it lives in the core crate); this module is the single
//! place, at the edge, that renders it as a response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kiro_gateway_core::config::DebugMode;
use kiro_gateway_core::error::GatewayError;
use serde_json::json;

/// Renders a `GatewayError` as the OpenAI-shaped `{error:{message,type,code}}`
/// body. `debug_mode` controls whether a generic-500 body leaks the
/// underlying cause or is replaced with a fixed string (§7).
pub fn render(err: &GatewayError, debug_mode: DebugMode) -> Response {
    let status = err.status_code();
    let message = if status == 500 && debug_mode == DebugMode::Off {
        "Internal server error".to_string()
    } else {
        err.to_string()
    };
    let body = json!({
        "error": {
            "message": message,
            "type": err.error_type(),
            "code": status,
        }
    });
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status_code, Json(body)).into_response()
}

/// 422 schema-validation rejection: the request body didn't even parse as
/// the expected shape. Carries the parse error plus a truncated echo of the
/// offending body, per §6.
pub fn unprocessable_entity(detail: impl Into<String>, raw_body: &[u8]) -> Response {
    let preview: String = String::from_utf8_lossy(raw_body).chars().take(500).collect();
    let body = json!({ "detail": detail.into(), "body": preview });
    (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
}
