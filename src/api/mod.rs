//! HTTP surface: webhook receiver, health probe and deployment history

pub mod deployments;
pub mod health;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

pub use deployments::get_deployments;
pub use health::health;
pub use webhook::handle_webhook;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/webhook", routing::post(handle_webhook))
        .route("/health", routing::get(health))
        .route("/deployments", routing::get(get_deployments))
        .with_state(state)
}
