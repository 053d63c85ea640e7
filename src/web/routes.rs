//! HTTP route handlers exposing the Scheduler API (spec §6).

use std::sync::Arc;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::fleet::FleetState;

fn err_response(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Build the API router with all endpoints.
pub fn api_router(fleet: Arc<FleetState>) -> Router {
    Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/instances/:id/time-until-next-vote", get(time_until_next_vote))
        .route("/instances/:id/restart", post(restart_instance))
        .route("/instances/:id/force-close-browser", post(force_close_browser))
        .route("/instances/:id/pause", post(pause_instance))
        .route("/instances/:id/resume", post(resume_instance))
        .route("/login-required", get(list_login_required))
        .route("/open-browsers", get(list_open_browsers))
        .route("/logs/dir", get(get_log_dir))
        .layer(middleware::from_fn(super::auth::basic_auth_middleware))
        .layer(Extension(fleet))
}

async fn get_snapshot(Extension(fleet): Extension<Arc<FleetState>>) -> impl IntoResponse {
    Json(fleet.snapshot())
}

async fn time_until_next_vote(
    Extension(fleet): Extension<Arc<FleetState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    match fleet.time_until_next_vote(id) {
        Some(info) => Json(info).into_response(),
        None => err_response(StatusCode::NOT_FOUND, "unknown instance id").into_response(),
    }
}

async fn restart_instance(
    Extension(fleet): Extension<Arc<FleetState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    info!(instance_id = id, "restart requested via web API");
    if fleet.restart(id).await {
        StatusCode::OK.into_response()
    } else {
        err_response(StatusCode::NOT_FOUND, "unknown instance id").into_response()
    }
}

async fn force_close_browser(
    Extension(fleet): Extension<Arc<FleetState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    info!(instance_id = id, "force-close requested via web API");
    if fleet.force_close_browser(id) {
        StatusCode::OK.into_response()
    } else {
        err_response(StatusCode::NOT_FOUND, "no open browser for that instance").into_response()
    }
}

async fn pause_instance(
    Extension(fleet): Extension<Arc<FleetState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    if fleet.set_paused(id, true) {
        StatusCode::OK.into_response()
    } else {
        err_response(StatusCode::NOT_FOUND, "unknown instance id").into_response()
    }
}

async fn resume_instance(
    Extension(fleet): Extension<Arc<FleetState>>,
    Path(id): Path<u32>,
) -> impl IntoResponse {
    if fleet.set_paused(id, false) {
        StatusCode::OK.into_response()
    } else {
        err_response(StatusCode::NOT_FOUND, "unknown instance id").into_response()
    }
}

async fn list_login_required(Extension(fleet): Extension<Arc<FleetState>>) -> impl IntoResponse {
    Json(fleet.list_login_required())
}

async fn list_open_browsers(Extension(fleet): Extension<Arc<FleetState>>) -> impl IntoResponse {
    Json(fleet.list_open_browsers())
}

async fn get_log_dir() -> impl IntoResponse {
    match crate::log_dir() {
        Some(p) => Json(serde_json::json!({ "path": p.to_string_lossy() })).into_response(),
        None => err_response(StatusCode::INTERNAL_SERVER_ERROR, "could not determine log directory").into_response(),
    }
}
