//! Router wiring for the control API

use super::handlers::{self, AppState};
use axum::{
    routing::{delete, get, post},
    Router,
};

/// Build the control API router
pub fn build_router(supervisor: AppState) -> Router {
    Router::new()
        .route("/commands/:command", post(handlers::run_command))
        .route("/status", get(handlers::status_all))
        .route("/status/:target", get(handlers::status_target))
        .route("/load", post(handlers::load_config))
        .route("/processes/:name", delete(handlers::remove_process))
        .route("/shutdown", post(handlers::shutdown))
        .with_state(supervisor)
}
