use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::ApiState;

/// Constant-time string comparison so response timing does not leak how much
/// of the token matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Admits only the allow-listed caller: `Authorization: Bearer <admin_token>`.
/// An empty admin_token disables the check.
pub async fn auth_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = &state.config.admin_token;
    if token.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    if let Some(bearer) = presented {
        if constant_time_eq(bearer, token) {
            return next.run(request).await;
        }
    }

    tracing::debug!(path = %request.uri().path(), "rejected API request with missing or invalid token");
    super::error_response(
        axum::http::StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "invalid or missing admin token",
    )
}
