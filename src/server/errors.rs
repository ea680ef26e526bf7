use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::GatewayError;

/// Wire dialect the failing endpoint speaks; error envelopes differ.
#[derive(Debug, Clone, Copy)]
pub enum ErrorDialect {
    OpenAi,
    Anthropic,
}

/// Map an engine failure to a client-facing response. Provider messages are
/// preserved; kinds map to conventional statuses.
pub fn to_response(error: &GatewayError, dialect: ErrorDialect) -> Response {
    let (status, error_type, message) = match error {
        GatewayError::Upstream(upstream) => (
            StatusCode::from_u16(upstream.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            kind_label(upstream.kind),
            upstream.message.clone(),
        ),
        GatewayError::NoKeyAvailable { provider, reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            format!("no credential available for {}: {}", provider, reason),
        ),
        GatewayError::DeadlineExceeded => (
            StatusCode::GATEWAY_TIMEOUT,
            "timeout_error",
            "request deadline exceeded".to_string(),
        ),
        GatewayError::Overloaded => (
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            "all credential slots busy".to_string(),
        ),
        GatewayError::NeedsReauth(id) => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            format!("credential {} requires re-authorization", id),
        ),
        GatewayError::UnknownProvider(provider) => (
            StatusCode::NOT_FOUND,
            "not_found_error",
            format!("unknown provider: {}", provider),
        ),
        GatewayError::InvalidRequest(message) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message.clone(),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            other.to_string(),
        ),
    };

    let body = match dialect {
        ErrorDialect::OpenAi => json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
            }
        }),
        ErrorDialect::Anthropic => json!({
            "type": "error",
            "error": {"type": error_type, "message": message},
        }),
    };
    (status, Json(body)).into_response()
}

fn kind_label(kind: crate::dispatch::classify::ErrorKind) -> &'static str {
    use crate::dispatch::classify::ErrorKind;
    match kind {
        ErrorKind::Authentication => "authentication_error",
        ErrorKind::RateLimit | ErrorKind::Quota | ErrorKind::TransientQuota => "rate_limit_error",
        ErrorKind::ContextLength => "invalid_request_error",
        ErrorKind::ContentFilter => "invalid_request_error",
        ErrorKind::NotFound => "not_found_error",
        ErrorKind::Timeout => "timeout_error",
        ErrorKind::ServerError | ErrorKind::Unknown => "api_error",
    }
}
