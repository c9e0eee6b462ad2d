//! Organization change log repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::{ChangeLog, ChangeLogReason};

#[derive(Debug, sqlx::FromRow)]
struct ChangeLogRow {
    id: String,
    organization_id: String,
    user_id: Option<String>,
    reason: String,
    from_plan_id: Option<String>,
    to_plan_id: Option<String>,
    from_max_users: Option<i64>,
    to_max_users: Option<i64>,
    created_at: String,
}

/// Fields of a change log entry
#[derive(Debug, Clone)]
pub struct NewChangeLog {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub reason: ChangeLogReason,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub from_max_users: Option<i64>,
    pub to_max_users: Option<i64>,
}

pub struct ChangeLogRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ChangeLogRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, entry: &NewChangeLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_change_logs
                (id, organization_id, user_id, reason, from_plan_id, to_plan_id,
                 from_max_users, to_max_users, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.organization_id.to_string())
        .bind(entry.user_id.map(|u| u.to_string()))
        .bind(entry.reason.as_str())
        .bind(entry.from_plan_id.map(|p| p.to_string()))
        .bind(entry.to_plan_id.map(|p| p.to_string()))
        .bind(entry.from_max_users)
        .bind(entry.to_max_users)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create change log")?;
        Ok(())
    }

    pub async fn list_for_organization(&mut self, organization_id: Uuid) -> Result<Vec<ChangeLog>> {
        let rows = sqlx::query_as::<_, ChangeLogRow>(
            r#"
            SELECT id, organization_id, user_id, reason, from_plan_id, to_plan_id,
                   from_max_users, to_max_users, created_at
            FROM organization_change_logs
            WHERE organization_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list change logs")?;

        Ok(rows
            .into_iter()
            .map(|row| ChangeLog {
                id: parse_db_uuid(&row.id),
                organization_id: parse_db_uuid(&row.organization_id),
                user_id: row.user_id.as_deref().map(parse_db_uuid),
                reason: row.reason.parse().unwrap_or(ChangeLogReason::Updated),
                from_plan_id: row.from_plan_id.as_deref().map(parse_db_uuid),
                to_plan_id: row.to_plan_id.as_deref().map(parse_db_uuid),
                from_max_users: row.from_max_users,
                to_max_users: row.to_max_users,
                created_at: parse_db_timestamp(&row.created_at),
            })
            .collect())
    }
}
