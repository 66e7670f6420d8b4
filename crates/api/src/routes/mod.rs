//! HTTP routes

pub mod health;
pub mod rooms;

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{state::AppState, websocket::ws_handler};

/// Create all routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // WebSocket upgrade plus room administration
    let ws_routes = Router::new()
        .route("/", get(ws_handler))
        .route("/debug", get(rooms::debug_info))
        .route("/room", get(rooms::list_rooms).post(rooms::create_room))
        .route("/room/:id", put(rooms::update_room).delete(rooms::remove_room));

    Router::new()
        .merge(health_routes)
        .nest("/ws", ws_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
