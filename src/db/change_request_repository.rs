//! Profile change request repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::{ChangeRequestStatus, ProfileChangeRequest, ProfileFields};

#[derive(Debug, sqlx::FromRow)]
struct ChangeRequestRow {
    id: String,
    organization_id: String,
    user_id: Option<String>,
    status: String,
    name: String,
    slug: String,
    city: String,
    state: String,
    country: String,
    previous: Option<String>,
    created_at: String,
    updated_at: String,
}

pub struct ChangeRequestRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ChangeRequestRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        organization_id: Uuid,
        user_id: Option<Uuid>,
        requested: &ProfileFields,
        previous: &ProfileFields,
    ) -> Result<ProfileChangeRequest> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let previous = serde_json::to_string(previous).context("Failed to encode previous values")?;

        sqlx::query(
            r#"
            INSERT INTO profile_change_requests
                (id, organization_id, user_id, status, name, slug, city, state, country,
                 previous, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(organization_id.to_string())
        .bind(user_id.map(|u| u.to_string()))
        .bind(&requested.name)
        .bind(&requested.slug)
        .bind(&requested.city)
        .bind(&requested.state)
        .bind(&requested.country)
        .bind(previous)
        .bind(&now)
        .bind(&now)
        .execute(&mut *self.conn)
        .await
        .context("Failed to create change request")?;

        self.get(id)
            .await?
            .context("Failed to retrieve created change request")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<ProfileChangeRequest>> {
        let row = sqlx::query_as::<_, ChangeRequestRow>(
            r#"
            SELECT id, organization_id, user_id, status, name, slug, city, state, country,
                   previous, created_at, updated_at
            FROM profile_change_requests WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get change request")?;

        Ok(row.map(row_to_request))
    }

    /// Move a pending request to a final status; `false` if it was not pending
    pub async fn resolve(&mut self, id: Uuid, status: ChangeRequestStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE profile_change_requests SET status = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to update change request")?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_request(row: ChangeRequestRow) -> ProfileChangeRequest {
    ProfileChangeRequest {
        id: parse_db_uuid(&row.id),
        organization_id: parse_db_uuid(&row.organization_id),
        user_id: row.user_id.as_deref().map(parse_db_uuid),
        status: row.status.parse().unwrap_or(ChangeRequestStatus::Pending),
        requested: ProfileFields {
            name: row.name,
            slug: row.slug,
            city: row.city,
            state: row.state,
            country: row.country,
        },
        previous: row.previous.as_deref().and_then(|p| serde_json::from_str(p).ok()),
        created_at: parse_db_timestamp(&row.created_at),
        updated_at: parse_db_timestamp(&row.updated_at),
    }
}
