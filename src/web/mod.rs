//! External interface adapter: the only bridge between the fleet's single
//! concurrency domain and the outside world. An axum HTTP API exposing the
//! Scheduler API (snapshot, time_until_next_vote, restart, force-close,
//! login-required / open-browser queries) plus static file serving for an
//! optional dashboard build.

pub mod auth;
pub mod routes;

use std::sync::Arc;
use axum::Router;
use tower_http::cors::{CorsLayer, Any};
use tower_http::services::ServeDir;
use tracing::info;

use crate::fleet::FleetState;

/// Build the complete axum router with API routes and static file serving.
pub fn build_router(fleet: Arc<FleetState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = routes::api_router(fleet);

    Router::new()
        .nest("/api", api_routes)
        .fallback_service(ServeDir::new("dist").append_index_html_on_directories(true))
        .layer(cors)
}

/// Start the web server on the given port.
pub async fn start_server(fleet: Arc<FleetState>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(fleet);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
