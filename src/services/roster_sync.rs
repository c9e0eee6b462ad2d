//! Third-party roster sync
//!
//! Some plans mirror their member list into an external roster. New
//! memberships queue a sync job per eligible (organization, plan) target.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::RosterSyncConfig;
use crate::db::{OrganizationRepository, PlanRepository, SubscriptionRepository};
use crate::models::{Plan, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterTarget {
    pub organization_id: Uuid,
    pub plan_id: Uuid,
}

async fn roster_plan(conn: &mut SqliteConnection, organization_id: Uuid) -> anyhow::Result<Option<Plan>> {
    let Some(subscription) = SubscriptionRepository::new(conn)
        .current_for_organization(organization_id)
        .await?
    else {
        return Ok(None);
    };
    let plan = PlanRepository::new(conn).get(subscription.plan_id).await?;
    Ok(plan.filter(|p| p.roster_sync))
}

/// Roster targets for a new member of `organization_id`.
///
/// The organization's own plan wins. Only when it has no roster plan are the
/// plans of the groups it belongs to considered.
pub async fn resolve_targets(conn: &mut SqliteConnection, organization_id: Uuid) -> anyhow::Result<Vec<RosterTarget>> {
    if let Some(plan) = roster_plan(conn, organization_id).await? {
        return Ok(vec![RosterTarget {
            organization_id,
            plan_id: plan.id,
        }]);
    }

    let groups = OrganizationRepository::new(conn).groups_of(organization_id).await?;
    let mut targets = Vec::new();
    for group in groups.iter().filter(|g| g.state.is_active()) {
        if let Some(plan) = roster_plan(conn, group.id).await? {
            targets.push(RosterTarget {
                organization_id: group.id,
                plan_id: plan.id,
            });
        }
    }
    Ok(targets)
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster service returned status {0}")]
    Status(u16),
    #[error("roster request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl RosterError {
    pub fn is_transient(&self) -> bool {
        match self {
            RosterError::Status(status) => *status == 429 || *status >= 500,
            RosterError::Request(_) => true,
        }
    }
}

#[async_trait]
pub trait RosterSync: Send + Sync {
    async fn sync_member(&self, target: &RosterTarget, user: &User) -> Result<(), RosterError>;
}

#[derive(Debug, Serialize)]
struct RosterMember<'a> {
    organization_id: Uuid,
    plan_id: Uuid,
    user_id: Uuid,
    name: &'a str,
    email: Option<&'a str>,
}

pub struct HttpRosterSync {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpRosterSync {
    pub fn new(config: &RosterSyncConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl RosterSync for HttpRosterSync {
    async fn sync_member(&self, target: &RosterTarget, user: &User) -> Result<(), RosterError> {
        let body = RosterMember {
            organization_id: target.organization_id,
            plan_id: target.plan_id,
            user_id: user.id,
            name: &user.name,
            email: user.email.as_deref(),
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(RosterError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Used when no roster endpoint is configured
pub struct NoopRosterSync;

#[async_trait]
impl RosterSync for NoopRosterSync {
    async fn sync_member(&self, target: &RosterTarget, user: &User) -> Result<(), RosterError> {
        debug!(
            organization_id = %target.organization_id,
            plan_id = %target.plan_id,
            user_id = %user.id,
            "Roster sync not configured, skipping"
        );
        Ok(())
    }
}
