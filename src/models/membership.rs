//! Membership and invitation models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Invitation to join an organization.
///
/// A request is raised by the user who wants to join; an invite is raised by
/// an admin and targets an email address until a user claims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: Option<String>,
    pub user_id: Option<Uuid>,
    pub request: bool,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn is_closed(&self) -> bool {
        self.accepted_at.is_some() || self.rejected_at.is_some()
    }

    pub fn is_pending_invite(&self) -> bool {
        !self.request && !self.is_closed()
    }
}

/// Who an invitation is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invitee {
    Email(String),
    User(Uuid),
}
