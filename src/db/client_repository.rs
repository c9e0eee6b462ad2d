//! Downstream client repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{json_id_list, parse_db_timestamp, parse_db_uuid};
use crate::models::ClientApp;

#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    id: String,
    name: String,
    webhook_url: String,
    secret: String,
    require_consent: bool,
    created_at: String,
}

pub struct ClientRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ClientRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &mut self,
        name: &str,
        webhook_url: &str,
        secret: &str,
        require_consent: bool,
    ) -> Result<ClientApp> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO clients (id, name, webhook_url, secret, require_consent, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(webhook_url)
        .bind(secret)
        .bind(require_consent)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create client")?;

        self.get(id).await?.context("Failed to retrieve created client")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<ClientApp>> {
        let row = sqlx::query_as::<_, ClientRow>(
            "SELECT id, name, webhook_url, secret, require_consent, created_at FROM clients WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get client")?;

        Ok(row.map(row_to_client))
    }

    /// Clients with a configured invalidation webhook
    pub async fn list_receiving(&mut self) -> Result<Vec<ClientApp>> {
        let rows = sqlx::query_as::<_, ClientRow>(
            r#"
            SELECT id, name, webhook_url, secret, require_consent, created_at
            FROM clients WHERE TRIM(webhook_url) != ''
            ORDER BY name
            "#,
        )
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list clients")?;

        Ok(rows.into_iter().map(row_to_client).collect())
    }

    pub async fn grant_consent(
        &mut self,
        user_id: Uuid,
        client_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO client_consents (user_id, client_id, expires_at) VALUES (?, ?, ?)
            ON CONFLICT (user_id, client_id) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(user_id.to_string())
        .bind(client_id.to_string())
        .bind(expires_at.map(|t| t.to_rfc3339()))
        .execute(&mut *self.conn)
        .await
        .context("Failed to grant consent")?;
        Ok(())
    }

    /// The subset of `user_ids` holding unexpired consent for the client
    pub async fn consenting_users(
        &mut self,
        client_id: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM client_consents
            WHERE client_id = ?
              AND user_id IN (SELECT value FROM json_each(?))
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY user_id
            "#,
        )
        .bind(client_id.to_string())
        .bind(json_id_list(user_ids))
        .bind(now.to_rfc3339())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to filter consenting users")?;

        Ok(rows.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }

    /// The subset of `organization_ids` with at least one consenting member
    pub async fn consenting_organizations(
        &mut self,
        client_id: Uuid,
        organization_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT m.organization_id FROM memberships m
            JOIN client_consents c ON c.user_id = m.user_id
            WHERE c.client_id = ?
              AND m.organization_id IN (SELECT value FROM json_each(?))
              AND (c.expires_at IS NULL OR c.expires_at > ?)
            ORDER BY m.organization_id
            "#,
        )
        .bind(client_id.to_string())
        .bind(json_id_list(organization_ids))
        .bind(now.to_rfc3339())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to filter consenting organizations")?;

        Ok(rows.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }
}

fn row_to_client(row: ClientRow) -> ClientApp {
    ClientApp {
        id: parse_db_uuid(&row.id),
        name: row.name,
        webhook_url: row.webhook_url,
        secret: row.secret,
        require_consent: row.require_consent,
        created_at: parse_db_timestamp(&row.created_at),
    }
}
