//! Organization profile change requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProfileFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ChangeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestStatus::Pending => "pending",
            ChangeRequestStatus::Accepted => "accepted",
            ChangeRequestStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChangeRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ChangeRequestStatus::Pending),
            "accepted" => Ok(ChangeRequestStatus::Accepted),
            "rejected" => Ok(ChangeRequestStatus::Rejected),
            _ => Err(format!("Invalid change request status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileChangeRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: ChangeRequestStatus,
    pub requested: ProfileFields,
    /// Values on the organization at the time of the request
    pub previous: Option<ProfileFields>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
