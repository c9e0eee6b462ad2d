//! Membership repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::Membership;

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    id: String,
    user_id: String,
    organization_id: String,
    admin: bool,
    created_at: String,
}

pub struct MembershipRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> MembershipRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert a membership. Returns `None` when the user is already a member.
    pub async fn create(
        &mut self,
        user_id: Uuid,
        organization_id: Uuid,
        admin: bool,
    ) -> Result<Option<Membership>> {
        let result = sqlx::query(
            r#"
            INSERT INTO memberships (id, user_id, organization_id, admin, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, organization_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.to_string())
        .bind(organization_id.to_string())
        .bind(admin)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create membership")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(user_id, organization_id).await
    }

    pub async fn get(&mut self, user_id: Uuid, organization_id: Uuid) -> Result<Option<Membership>> {
        let row = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT id, user_id, organization_id, admin, created_at
            FROM memberships
            WHERE user_id = ? AND organization_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get membership")?;

        Ok(row.map(row_to_membership))
    }

    pub async fn list_for_organization(&mut self, organization_id: Uuid) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT id, user_id, organization_id, admin, created_at
            FROM memberships
            WHERE organization_id = ?
            ORDER BY created_at, user_id
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list memberships")?;

        Ok(rows.into_iter().map(row_to_membership).collect())
    }

    pub async fn count_for_organization(&mut self, organization_id: Uuid) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM memberships WHERE organization_id = ?")
                .bind(organization_id.to_string())
                .fetch_one(&mut *self.conn)
                .await
                .context("Failed to count memberships")?;
        Ok(count)
    }

    pub async fn set_admin(&mut self, user_id: Uuid, organization_id: Uuid, admin: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE memberships SET admin = ? WHERE user_id = ? AND organization_id = ?",
        )
        .bind(admin)
        .bind(user_id.to_string())
        .bind(organization_id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to update membership")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&mut self, user_id: Uuid, organization_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memberships WHERE user_id = ? AND organization_id = ?")
            .bind(user_id.to_string())
            .bind(organization_id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to delete membership")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_admins(&mut self, organization_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM memberships WHERE organization_id = ? AND admin = 1",
        )
        .bind(organization_id.to_string())
        .fetch_one(&mut *self.conn)
        .await
        .context("Failed to count admins")?;
        Ok(count)
    }

    /// Email addresses of the organization's admins
    pub async fn admin_emails(&mut self, organization_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT u.email FROM memberships m
            JOIN users u ON u.id = m.user_id
            WHERE m.organization_id = ? AND m.admin = 1 AND u.email IS NOT NULL
            ORDER BY m.created_at
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list admin emails")?;
        Ok(rows.into_iter().map(|(e,)| e).collect())
    }

    /// Move memberships to `target`, dropping those whose user is already a member there.
    ///
    /// Returns the users whose memberships changed.
    pub async fn reassign(&mut self, source: Uuid, target: Uuid) -> Result<Vec<Uuid>> {
        let (source, target) = (source.to_string(), target.to_string());

        let moved: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM memberships WHERE organization_id = ?")
                .bind(&source)
                .fetch_all(&mut *self.conn)
                .await
                .context("Failed to list source memberships")?;

        sqlx::query(
            r#"
            UPDATE memberships SET organization_id = ?
            WHERE organization_id = ?
              AND user_id NOT IN (SELECT user_id FROM memberships WHERE organization_id = ?)
            "#,
        )
        .bind(&target)
        .bind(&source)
        .bind(&target)
        .execute(&mut *self.conn)
        .await
        .context("Failed to reassign memberships")?;

        sqlx::query("DELETE FROM memberships WHERE organization_id = ?")
            .bind(&source)
            .execute(&mut *self.conn)
            .await
            .context("Failed to delete duplicate memberships")?;

        Ok(moved.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }
}

fn row_to_membership(row: MembershipRow) -> Membership {
    Membership {
        id: parse_db_uuid(&row.id),
        user_id: parse_db_uuid(&row.user_id),
        organization_id: parse_db_uuid(&row.organization_id),
        admin: row.admin,
        created_at: parse_db_timestamp(&row.created_at),
    }
}
