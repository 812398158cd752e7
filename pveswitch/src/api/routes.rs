use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;

use super::{error_response, ok_response, status_for, switch_error_response, ApiError, ApiState};
use crate::switch::SwitchOutcome;
use crate::vm::VmRole;

/// Routes behind the admin token.
pub fn routes() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/switch/{role}", post(switch_role))
        .route("/switch_linux", post(switch_linux))
        .route("/switch_windows", post(switch_windows))
        .route("/toggle", post(toggle))
        .route("/lock", post(lock))
        .route("/unlock", post(unlock))
}

/// Routes reachable without credentials.
pub fn public_routes() -> Router<Arc<ApiState>> {
    Router::new().route("/healthz", get(healthz))
}

#[derive(Serialize)]
struct LockInfo {
    locked: bool,
}

async fn index() -> Response {
    ok_response(serde_json::json!({
        "app": "pveswitch",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn healthz() -> Response {
    ok_response(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<Arc<ApiState>>) -> Response {
    ok_response(state.controller.status().await)
}

async fn switch_role(State(state): State<Arc<ApiState>>, Path(role): Path<String>) -> Response {
    match role.parse::<VmRole>() {
        Ok(role) => detached_switch(&state, Some(role)).await,
        Err(e) => error_response(StatusCode::NOT_FOUND, "UNKNOWN_ROLE", e),
    }
}

async fn switch_linux(State(state): State<Arc<ApiState>>) -> Response {
    detached_switch(&state, Some(VmRole::Linux)).await
}

async fn switch_windows(State(state): State<Arc<ApiState>>) -> Response {
    detached_switch(&state, Some(VmRole::Windows)).await
}

async fn toggle(State(state): State<Arc<ApiState>>) -> Response {
    detached_switch(&state, None).await
}

/// Run the switch on its own task. A client that disconnects or times out
/// drops this handler, but must not cancel a switch between stop and start.
async fn detached_switch(state: &ApiState, target: Option<VmRole>) -> Response {
    let controller = Arc::clone(&state.controller);
    let task = tokio::spawn(async move {
        match target {
            Some(role) => controller.switch_to(role).await,
            None => controller.toggle().await,
        }
    });
    match task.await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            format!("switch task failed: {}", e),
        ),
    }
}

async fn lock(State(state): State<Arc<ApiState>>) -> Response {
    set_lock(&state, true).await
}

async fn unlock(State(state): State<Arc<ApiState>>) -> Response {
    set_lock(&state, false).await
}

async fn set_lock(state: &ApiState, locked: bool) -> Response {
    let result = if locked {
        state.controller.lock().await
    } else {
        state.controller.unlock().await
    };
    match result {
        Ok(()) => ok_response(LockInfo { locked }),
        Err(e) => switch_error_response(&e),
    }
}

fn outcome_response(outcome: SwitchOutcome) -> Response {
    let Some(e) = outcome.error.clone() else {
        return ok_response(outcome);
    };
    let mut body = ApiError::new(e.kind(), e.to_string());
    if let Ok(details) = serde_json::to_value(&outcome) {
        body = body.with_details(details);
    }
    (status_for(&e), axum::Json(body)).into_response()
}
