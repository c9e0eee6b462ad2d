//! Plan repository

use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::Plan;

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    slug: String,
    minimum_users: i64,
    base_price: i64,
    price_per_user: i64,
    public: bool,
    annual: bool,
    for_individuals: bool,
    for_groups: bool,
    roster_sync: bool,
    family: Option<String>,
    family_subscription_cap: Option<i64>,
    created_at: String,
}

const PLAN_COLUMNS: &str = r#"
    p.id, p.name, p.slug, p.minimum_users, p.base_price, p.price_per_user, p.public,
    p.annual, p.for_individuals, p.for_groups, p.roster_sync, p.family,
    p.family_subscription_cap, p.created_at
"#;

pub struct PlanRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> PlanRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, plan: &Plan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plans
                (id, name, slug, minimum_users, base_price, price_per_user, public, annual,
                 for_individuals, for_groups, roster_sync, family, family_subscription_cap,
                 created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(&plan.slug)
        .bind(plan.minimum_users)
        .bind(plan.base_price)
        .bind(plan.price_per_user)
        .bind(plan.public)
        .bind(plan.annual)
        .bind(plan.for_individuals)
        .bind(plan.for_groups)
        .bind(plan.roster_sync)
        .bind(&plan.family)
        .bind(plan.family_subscription_cap)
        .bind(plan.created_at.to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create plan")?;
        Ok(())
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans p WHERE p.id = ?",
            PLAN_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get plan")?;

        Ok(row.map(row_to_plan))
    }

    pub async fn get_by_slug(&mut self, slug: &str) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans p WHERE p.slug = ?",
            PLAN_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get plan by slug")?;

        Ok(row.map(row_to_plan))
    }

    /// Whether the organization is on the plan's private allowlist
    pub async fn is_granted(&mut self, plan_id: Uuid, organization_id: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM plan_private_organizations WHERE plan_id = ? AND organization_id = ?",
        )
        .bind(plan_id.to_string())
        .bind(organization_id.to_string())
        .fetch_one(&mut *self.conn)
        .await
        .context("Failed to check plan grant")?;
        Ok(count > 0)
    }

    pub async fn grant(&mut self, plan_id: Uuid, organization_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO plan_private_organizations (plan_id, organization_id) VALUES (?, ?)",
        )
        .bind(plan_id.to_string())
        .bind(organization_id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to grant plan")?;
        Ok(())
    }

    pub async fn granted_plan_ids(&mut self, organization_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT plan_id FROM plan_private_organizations WHERE organization_id = ? ORDER BY plan_id",
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list plan grants")?;
        Ok(rows.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }

    pub async fn reassign_grants(&mut self, source: Uuid, target: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO plan_private_organizations (plan_id, organization_id)
            SELECT plan_id, ? FROM plan_private_organizations WHERE organization_id = ?
            "#,
        )
        .bind(target.to_string())
        .bind(source.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to copy plan grants")?;

        sqlx::query("DELETE FROM plan_private_organizations WHERE organization_id = ?")
            .bind(source.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to clear source plan grants")?;
        Ok(())
    }

    /// Live subscriptions across every plan in a family
    pub async fn count_family_subscriptions(&mut self, family: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            WHERE p.family = ? AND s.cancelled = 0
            "#,
        )
        .bind(family)
        .fetch_one(&mut *self.conn)
        .await
        .context("Failed to count family subscriptions")?;
        Ok(count)
    }
}

fn row_to_plan(row: PlanRow) -> Plan {
    Plan {
        id: parse_db_uuid(&row.id),
        name: row.name,
        slug: row.slug,
        minimum_users: row.minimum_users,
        base_price: row.base_price,
        price_per_user: row.price_per_user,
        public: row.public,
        annual: row.annual,
        for_individuals: row.for_individuals,
        for_groups: row.for_groups,
        roster_sync: row.roster_sync,
        family: row.family,
        family_subscription_cap: row.family_subscription_cap,
        created_at: parse_db_timestamp(&row.created_at),
    }
}
