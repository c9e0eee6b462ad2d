//! Downstream consumer applications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An application that mirrors users or organizations and must be told when
/// they change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientApp {
    pub id: Uuid,
    pub name: String,
    pub webhook_url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub require_consent: bool,
    pub created_at: DateTime<Utc>,
}
