//! Plan (pricing tier) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Organization;

/// Prefix of the billing-provider price id for each plan slug
pub const PLAN_PRICE_PREFIX: &str = "orgledger_plan_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub minimum_users: i64,
    /// Minor currency units
    pub base_price: i64,
    /// Minor currency units
    pub price_per_user: i64,
    pub public: bool,
    pub annual: bool,
    pub for_individuals: bool,
    pub for_groups: bool,
    /// Memberships in organizations on this plan are mirrored to a roster service
    pub roster_sync: bool,
    /// Plans sharing a family share one global subscription cap
    pub family: Option<String>,
    pub family_subscription_cap: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.base_price == 0 && self.price_per_user == 0
    }

    pub fn cost(&self, users: i64) -> i64 {
        self.base_price + (users - self.minimum_users).max(0) * self.price_per_user
    }

    pub fn price_id(&self) -> String {
        format!("{}{}", PLAN_PRICE_PREFIX, self.slug)
    }

    /// Whether this plan may be chosen by the organization.
    ///
    /// `granted` says whether the organization is on the plan's private allowlist.
    pub fn available_to(&self, organization: &Organization, granted: bool) -> bool {
        let kind_ok = if organization.individual {
            self.for_individuals
        } else {
            self.for_groups
        };
        kind_ok && (self.public || granted)
    }
}

/// Extract the plan slug from a billing-provider price id
pub fn slug_from_price_id(price_id: &str) -> Option<&str> {
    price_id.strip_prefix(PLAN_PRICE_PREFIX)
}
