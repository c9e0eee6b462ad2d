//! Customer repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::Customer;

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: String,
    organization_id: String,
    customer_id: Option<String>,
    updated_at: String,
}

pub struct CustomerRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> CustomerRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Fetch the organization's customer row, inserting an empty one if missing
    pub async fn get_or_create(&mut self, organization_id: Uuid) -> Result<Customer> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, organization_id, customer_id, updated_at)
            VALUES (?, ?, NULL, ?)
            ON CONFLICT (organization_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(organization_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create customer")?;

        self.get(organization_id)
            .await?
            .context("Failed to retrieve customer")
    }

    pub async fn get(&mut self, organization_id: Uuid) -> Result<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT id, organization_id, customer_id, updated_at FROM customers WHERE organization_id = ?",
        )
        .bind(organization_id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get customer")?;

        Ok(row.map(row_to_customer))
    }

    /// Take the write lock on the customer row.
    ///
    /// SQLite has no `SELECT ... FOR UPDATE`; writing the row first makes the
    /// enclosing transaction hold the database write lock, so concurrent
    /// callers serialize on the check-and-create that follows.
    pub async fn lock(&mut self, organization_id: Uuid) -> Result<Customer> {
        let customer = self.get_or_create(organization_id).await?;
        sqlx::query("UPDATE customers SET updated_at = ? WHERE organization_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(organization_id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to lock customer")?;
        Ok(customer)
    }

    pub async fn set_customer_id(&mut self, organization_id: Uuid, customer_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE customers SET customer_id = ?, updated_at = ? WHERE organization_id = ?")
            .bind(customer_id)
            .bind(Utc::now().to_rfc3339())
            .bind(organization_id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to update customer id")?;
        Ok(())
    }
}

fn row_to_customer(row: CustomerRow) -> Customer {
    Customer {
        id: parse_db_uuid(&row.id),
        organization_id: parse_db_uuid(&row.organization_id),
        customer_id: row.customer_id,
        updated_at: parse_db_timestamp(&row.updated_at),
    }
}
