//! Organization (tenant) model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Lifecycle state of an organization.
///
/// Merged organizations are kept for referential history but are inert;
/// query paths that should skip them match on this variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "target", rename_all = "snake_case")]
pub enum OrganizationState {
    Active,
    MergedInto(Uuid),
}

impl OrganizationState {
    pub fn is_active(&self) -> bool {
        matches!(self, OrganizationState::Active)
    }

    pub fn merged_into(&self) -> Option<Uuid> {
        match self {
            OrganizationState::Active => None,
            OrganizationState::MergedInto(target) => Some(*target),
        }
    }
}

/// Audit detail recorded alongside a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub merged_at: DateTime<Utc>,
    pub merged_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub individual: bool,
    pub private: bool,
    pub verified_journalist: bool,
    pub max_users: i64,
    pub payment_failed: bool,
    pub allow_auto_join: bool,
    pub city: String,
    pub state_province: String,
    pub country: String,
    pub parent_id: Option<Uuid>,
    pub state: OrganizationState,
    pub merge: Option<MergeRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn is_merged(&self) -> bool {
        !self.state.is_active()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub slug: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default = "default_max_users")]
    #[validate(range(min = 1))]
    pub max_users: i64,
    #[serde(default)]
    pub verified_journalist: bool,
}

fn default_max_users() -> i64 {
    5
}

/// Sensitive profile fields that only change through a reviewed request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
}

impl ProfileFields {
    pub fn of(org: &Organization) -> Self {
        Self {
            name: org.name.clone(),
            slug: org.slug.clone(),
            city: org.city.clone(),
            state: org.state_province.clone(),
            country: org.country.clone(),
        }
    }

    /// Copy every non-blank field onto the organization
    pub fn apply_to(&self, org: &mut Organization) {
        fn set(target: &mut String, value: &str) {
            if !value.trim().is_empty() {
                *target = value.to_string();
            }
        }
        set(&mut org.name, &self.name);
        set(&mut org.slug, &self.slug);
        set(&mut org.city, &self.city);
        set(&mut org.state_province, &self.state);
        set(&mut org.country, &self.country);
    }

    pub fn is_blank(&self) -> bool {
        [&self.name, &self.slug, &self.city, &self.state, &self.country]
            .iter()
            .all(|v| v.trim().is_empty())
    }
}
