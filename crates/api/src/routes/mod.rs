//! HTTP routes

pub mod health;
pub mod quickbooks;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/quickbooks", post(webhooks::receive))
        .route("/quickbooks/connect", get(quickbooks::connect))
        .route("/quickbooks/callback", get(quickbooks::callback))
        .with_state(state)
}
