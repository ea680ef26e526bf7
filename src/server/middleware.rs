use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::engine::Engine;

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

/// Bearer / x-api-key check. An empty configured key disables client
/// authentication entirely (documented upstream behavior).
pub async fn auth_middleware(
    State(engine): State<Arc<Engine>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path();
    if path == "/health" || request.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let expected = engine.config.proxy.api_key.as_str();
    if expected.is_empty() {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        });

    match provided {
        Some(candidate) if constant_time_str_eq(candidate, expected) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::debug!("Rejected unauthenticated request to {}", path);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::constant_time_str_eq;

    #[test]
    fn comparison_handles_length_mismatch() {
        assert!(constant_time_str_eq("secret", "secret"));
        assert!(!constant_time_str_eq("secret", "secre"));
        assert!(!constant_time_str_eq("secret", "secrets"));
        assert!(!constant_time_str_eq("", "x"));
        assert!(constant_time_str_eq("", ""));
    }
}
