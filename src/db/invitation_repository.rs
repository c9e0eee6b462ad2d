//! Invitation repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::Invitation;

#[derive(Debug, sqlx::FromRow)]
struct InvitationRow {
    id: String,
    organization_id: String,
    email: Option<String>,
    user_id: Option<String>,
    request: bool,
    created_at: String,
    accepted_at: Option<String>,
    rejected_at: Option<String>,
}

pub struct InvitationRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> InvitationRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        organization_id: Uuid,
        email: Option<&str>,
        user_id: Option<Uuid>,
        request: bool,
    ) -> Result<Invitation> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO invitations (id, organization_id, email, user_id, request, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(organization_id.to_string())
        .bind(email)
        .bind(user_id.map(|u| u.to_string()))
        .bind(request)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create invitation")?;

        self.get(id)
            .await?
            .context("Failed to retrieve created invitation")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<Invitation>> {
        let row = sqlx::query_as::<_, InvitationRow>(
            r#"
            SELECT id, organization_id, email, user_id, request, created_at, accepted_at, rejected_at
            FROM invitations
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get invitation")?;

        Ok(row.map(row_to_invitation))
    }

    pub async fn list_for_organization(&mut self, organization_id: Uuid) -> Result<Vec<Invitation>> {
        let rows = sqlx::query_as::<_, InvitationRow>(
            r#"
            SELECT id, organization_id, email, user_id, request, created_at, accepted_at, rejected_at
            FROM invitations
            WHERE organization_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list invitations")?;

        Ok(rows.into_iter().map(row_to_invitation).collect())
    }

    /// Open admin-issued invitations still holding a seat
    pub async fn count_pending_invites(&mut self, organization_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM invitations
            WHERE organization_id = ? AND request = 0
              AND accepted_at IS NULL AND rejected_at IS NULL
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_one(&mut *self.conn)
        .await
        .context("Failed to count pending invitations")?;
        Ok(count)
    }

    /// Persist the closing transition of an invitation.
    ///
    /// Only applies while the row is still open, so a concurrent close of the
    /// same invitation loses and reports `false`.
    pub async fn close(&mut self, invitation: &Invitation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET user_id = ?, accepted_at = ?, rejected_at = ?
            WHERE id = ? AND accepted_at IS NULL AND rejected_at IS NULL
            "#,
        )
        .bind(invitation.user_id.map(|u| u.to_string()))
        .bind(invitation.accepted_at.map(|t| t.to_rfc3339()))
        .bind(invitation.rejected_at.map(|t| t.to_rfc3339()))
        .bind(invitation.id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to close invitation")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn reassign(&mut self, source: Uuid, target: Uuid) -> Result<u64> {
        let result = sqlx::query("UPDATE invitations SET organization_id = ? WHERE organization_id = ?")
            .bind(target.to_string())
            .bind(source.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to reassign invitations")?;
        Ok(result.rows_affected())
    }
}

fn row_to_invitation(row: InvitationRow) -> Invitation {
    Invitation {
        id: parse_db_uuid(&row.id),
        organization_id: parse_db_uuid(&row.organization_id),
        email: row.email,
        user_id: row.user_id.as_deref().map(parse_db_uuid),
        request: row.request,
        created_at: parse_db_timestamp(&row.created_at),
        accepted_at: row.accepted_at.as_deref().map(parse_db_timestamp),
        rejected_at: row.rejected_at.as_deref().map(parse_db_timestamp),
    }
}
