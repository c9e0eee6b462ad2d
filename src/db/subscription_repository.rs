//! Subscription repository

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{format_db_date, parse_db_date, parse_db_timestamp, parse_db_uuid};
use crate::models::Subscription;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    organization_id: String,
    plan_id: String,
    subscription_id: Option<String>,
    update_on: String,
    cancelled: bool,
    created_at: String,
}

pub struct SubscriptionRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> SubscriptionRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        organization_id: Uuid,
        plan_id: Uuid,
        update_on: NaiveDate,
    ) -> Result<Subscription> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, organization_id, plan_id, update_on, cancelled, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(organization_id.to_string())
        .bind(plan_id.to_string())
        .bind(format_db_date(update_on))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create subscription")?;

        self.get(id)
            .await?
            .context("Failed to retrieve created subscription")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, organization_id, plan_id, subscription_id, update_on, cancelled, created_at
            FROM subscriptions WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get subscription")?;

        Ok(row.map(row_to_subscription))
    }

    /// The organization's current subscription, newest first
    pub async fn current_for_organization(&mut self, organization_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, organization_id, plan_id, subscription_id, update_on, cancelled, created_at
            FROM subscriptions WHERE organization_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get current subscription")?;

        Ok(row.map(row_to_subscription))
    }

    pub async fn find_by_external_id(
        &mut self,
        organization_id: Uuid,
        subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, organization_id, plan_id, subscription_id, update_on, cancelled, created_at
            FROM subscriptions WHERE organization_id = ? AND subscription_id = ?
            "#,
        )
        .bind(organization_id.to_string())
        .bind(subscription_id)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to find subscription by external id")?;

        Ok(row.map(row_to_subscription))
    }

    /// Subscriptions whose restore date has arrived
    pub async fn list_due(&mut self, today: NaiveDate) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT id, organization_id, plan_id, subscription_id, update_on, cancelled, created_at
            FROM subscriptions WHERE update_on <= ?
            ORDER BY update_on, id
            "#,
        )
        .bind(format_db_date(today))
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list due subscriptions")?;

        Ok(rows.into_iter().map(row_to_subscription).collect())
    }

    pub async fn has_external(&mut self, organization_id: Uuid) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE organization_id = ? AND subscription_id IS NOT NULL AND cancelled = 0
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_one(&mut *self.conn)
        .await
        .context("Failed to check external subscriptions")?;
        Ok(count > 0)
    }

    pub async fn save(&mut self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = ?, subscription_id = ?, update_on = ?, cancelled = ?
            WHERE id = ?
            "#,
        )
        .bind(subscription.plan_id.to_string())
        .bind(&subscription.subscription_id)
        .bind(format_db_date(subscription.update_on))
        .bind(subscription.cancelled)
        .bind(subscription.id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to update subscription")?;
        Ok(())
    }

    pub async fn delete(&mut self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to delete subscription")?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_subscription(row: SubscriptionRow) -> Subscription {
    Subscription {
        id: parse_db_uuid(&row.id),
        organization_id: parse_db_uuid(&row.organization_id),
        plan_id: parse_db_uuid(&row.plan_id),
        subscription_id: row.subscription_id,
        update_on: parse_db_date(&row.update_on).unwrap_or_else(|| Utc::now().date_naive()),
        cancelled: row.cancelled,
        created_at: parse_db_timestamp(&row.created_at),
    }
}
