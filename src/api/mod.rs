//! API routes and handlers
//!
//! The HTTP surface is small: health probes and the billing provider's
//! webhook. Everything else is driven through the service layer.

use axum::{routing::get, Router};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::AppState;

mod health;
mod webhooks;

pub use health::*;
pub use webhooks::SIGNATURE_HEADER;

/// Public routes (no authentication; webhooks verify signatures instead)
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/detailed", get(health::health_check_detailed))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/webhooks", webhooks::routes())
}

/// Build the application router with request tracing
pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    public_routes().layer(trace_layer).with_state(state)
}
