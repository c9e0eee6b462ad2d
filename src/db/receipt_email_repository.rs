//! Receipt email repository

use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use uuid::Uuid;

pub struct ReceiptEmailRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ReceiptEmailRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn add(&mut self, organization_id: Uuid, email: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO receipt_emails (organization_id, email) VALUES (?, ?)")
            .bind(organization_id.to_string())
            .bind(email.to_lowercase())
            .execute(&mut *self.conn)
            .await
            .context("Failed to add receipt email")?;
        Ok(())
    }

    pub async fn list(&mut self, organization_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT email FROM receipt_emails WHERE organization_id = ? AND failed = 0 ORDER BY id",
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list receipt emails")?;
        Ok(rows.into_iter().map(|(e,)| e).collect())
    }

    /// Replace the organization's receipt addresses with `emails`
    pub async fn replace(&mut self, organization_id: Uuid, emails: &[String]) -> Result<()> {
        let normalized: Vec<String> = emails.iter().map(|e| e.trim().to_lowercase()).collect();
        let keep = serde_json::Value::from(normalized.clone()).to_string();

        sqlx::query(
            r#"
            DELETE FROM receipt_emails
            WHERE organization_id = ? AND email NOT IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(organization_id.to_string())
        .bind(keep)
        .execute(&mut *self.conn)
        .await
        .context("Failed to remove receipt emails")?;

        for email in normalized.iter().filter(|e| !e.is_empty()) {
            self.add(organization_id, email).await?;
        }
        Ok(())
    }

    pub async fn reassign(&mut self, source: Uuid, target: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO receipt_emails (organization_id, email, failed)
            SELECT ?, email, failed FROM receipt_emails WHERE organization_id = ?
            "#,
        )
        .bind(target.to_string())
        .bind(source.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to copy receipt emails")?;

        sqlx::query("DELETE FROM receipt_emails WHERE organization_id = ?")
            .bind(source.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to clear source receipt emails")?;
        Ok(())
    }
}
