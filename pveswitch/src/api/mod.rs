pub mod auth;
pub mod routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::switch::{SwitchController, SwitchError};

/// Shared state for all API handlers, passed via axum `State`.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<SwitchController>,
    pub config: Arc<ApiConfig>,
}

/// Response envelope for successful API responses.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(serde::Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    /// Extra context, e.g. the switch outcome when a switch failed part way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(serde::Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: ApiMeta::new(),
        }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
            meta: ApiMeta::new(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, axum::Json(ApiError::new(code, message))).into_response()
}

pub fn ok_response<T: serde::Serialize>(data: T) -> Response {
    (StatusCode::OK, axum::Json(ApiResponse::new(data))).into_response()
}

/// HTTP status for each failure kind.
pub fn status_for(error: &SwitchError) -> StatusCode {
    match error {
        SwitchError::Locked => StatusCode::LOCKED,
        SwitchError::SwitchInProgress | SwitchError::AmbiguousState { .. } => StatusCode::CONFLICT,
        SwitchError::ShutdownTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SwitchError::Upstream(_) => StatusCode::BAD_GATEWAY,
        SwitchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn switch_error_response(error: &SwitchError) -> Response {
    error_response(status_for(error), error.kind(), error.to_string())
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    let protected = routes::routes().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        auth::auth_middleware,
    ));

    Router::new()
        .merge(protected)
        .merge(routes::public_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the API listener and serve it as a background task.
pub async fn start_api(state: Arc<ApiState>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    if state.config.bind_addr != "127.0.0.1"
        && state.config.bind_addr != "::1"
        && state.config.admin_token.is_empty()
    {
        tracing::warn!(
            bind_addr = %state.config.bind_addr,
            "API bound to a non-loopback address with no admin_token set; anyone on the network can switch VMs"
        );
    }

    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API server listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    }))
}
