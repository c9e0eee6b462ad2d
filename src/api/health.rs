//! Health endpoints
//!
//! `/health` and `/health/live` never touch dependencies. `/health/detailed`
//! probes the database and reports which outbound integrations are wired.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::config::AppConfig;
use crate::{db, AppState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: Status,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct DetailedHealthResponse {
    pub status: Status,
    pub version: &'static str,
    pub components: BTreeMap<&'static str, ComponentStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Unhealthy,
    /// Optional integration left unset; not a failure
    NotConfigured,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn new(status: Status) -> Self {
        Self { status, message: None }
    }

    fn with_message(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    fn configured(enabled: bool) -> Self {
        Self::new(if enabled { Status::Healthy } else { Status::NotConfigured })
    }

    fn is_ok(&self) -> bool {
        self.status != Status::Unhealthy
    }
}

/// Static configuration checks; no I/O
fn integration_status(config: &AppConfig) -> BTreeMap<&'static str, ComponentStatus> {
    let billing = if config.billing.secret_key.is_empty() {
        ComponentStatus::with_message(Status::NotConfigured, "no API key, gateway calls will be rejected")
    } else {
        ComponentStatus::new(Status::Healthy)
    };
    let webhooks = if config.billing.webhook_secrets.is_empty() {
        ComponentStatus::with_message(Status::NotConfigured, "accepting unsigned payloads")
    } else {
        ComponentStatus::with_message(
            Status::Healthy,
            format!("{} signing secret(s)", config.billing.webhook_secrets.len()),
        )
    };

    BTreeMap::from([
        ("billing", billing),
        ("webhooks", webhooks),
        ("email", ComponentStatus::configured(config.email.enabled)),
        ("invalidation", ComponentStatus::configured(config.invalidation.enabled)),
        ("roster_sync", ComponentStatus::configured(config.roster_sync.is_some())),
    ])
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: Status::Healthy,
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn health_check_detailed(State(state): State<AppState>) -> (StatusCode, Json<DetailedHealthResponse>) {
    let mut components = integration_status(&state.config);
    let database = match db::check_health(&state.db).await {
        Ok(()) => ComponentStatus::new(Status::Healthy),
        Err(e) => ComponentStatus::with_message(Status::Unhealthy, e.to_string()),
    };
    components.insert("database", database);

    let healthy = components.values().all(ComponentStatus::is_ok);
    let (code, status) = if healthy {
        (StatusCode::OK, Status::Healthy)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Status::Unhealthy)
    };

    (
        code,
        Json(DetailedHealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            components,
        }),
    )
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Ready once the database answers
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match db::check_health(&state.db).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
