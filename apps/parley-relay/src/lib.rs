pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use websocket::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ws/:room_id", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
