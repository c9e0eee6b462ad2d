//! Billing provider webhook endpoint
//!
//! The request path only verifies and parses. Recognised events are queued
//! and handled by the task worker, which retries transient failures.

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::services::billing_gateway::verify_webhook_signature;
use crate::services::tasks::Task;
use crate::services::webhook_events::parse_event;
use crate::utils::{AppError, AppResult};
use crate::AppState;

/// Header carrying `t=<ts>,v1=<hex>`
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/billing", post(handle_billing_webhook))
}

async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let billing = &state.config.billing;
    if billing.webhook_secrets.is_empty() {
        debug!("No webhook secrets configured, accepting unsigned payload");
    } else {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        verify_webhook_signature(
            &body,
            signature,
            &billing.webhook_secrets,
            billing.webhook_tolerance_secs,
            Utc::now(),
        )
        .map_err(|e| {
            warn!(error = %e, "Rejected billing webhook");
            AppError::BadRequest(format!("Invalid webhook signature: {}", e))
        })?;
    }

    let event = parse_event(&body).map_err(|e| {
        warn!(error = %e, "Unparseable billing webhook");
        AppError::BadRequest(e.to_string())
    })?;

    match event {
        Some(event) => {
            info!(event_type = event.event_type(), object_id = event.object_id(), "Queued billing event");
            state.services.enqueue(Task::BillingEvent(Box::new(event)));
        }
        None => debug!("Ignoring unhandled billing event type"),
    }

    Ok(StatusCode::OK)
}
