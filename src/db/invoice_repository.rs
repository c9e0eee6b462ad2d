//! Invoice repository

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{format_db_date, parse_db_date, parse_db_timestamp, parse_db_uuid};
use crate::models::{Invoice, InvoiceStatus};

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    invoice_id: String,
    organization_id: String,
    subscription_id: Option<String>,
    amount: i64,
    due_date: Option<String>,
    status: String,
    last_overdue_email_sent: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Provider-side invoice fields written on every upsert
#[derive(Debug, Clone)]
pub struct InvoiceUpsert {
    pub invoice_id: String,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount: i64,
    pub due_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
}

pub struct InvoiceRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> InvoiceRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert or refresh an invoice keyed by its provider id
    pub async fn upsert(&mut self, invoice: &InvoiceUpsert) -> Result<Invoice> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, invoice_id, organization_id, subscription_id, amount, due_date, status,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (invoice_id) DO UPDATE SET
                organization_id = excluded.organization_id,
                subscription_id = excluded.subscription_id,
                amount = excluded.amount,
                due_date = excluded.due_date,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&invoice.invoice_id)
        .bind(invoice.organization_id.to_string())
        .bind(invoice.subscription_id.map(|s| s.to_string()))
        .bind(invoice.amount)
        .bind(invoice.due_date.map(format_db_date))
        .bind(invoice.status.as_str())
        .bind(invoice.created_at.to_rfc3339())
        .bind(&now)
        .execute(&mut *self.conn)
        .await
        .context("Failed to upsert invoice")?;

        self.get_by_invoice_id(&invoice.invoice_id)
            .await?
            .context("Failed to retrieve upserted invoice")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT id, invoice_id, organization_id, subscription_id, amount, due_date, status,
                   last_overdue_email_sent, created_at, updated_at
            FROM invoices WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get invoice")?;

        Ok(row.map(row_to_invoice))
    }

    pub async fn get_by_invoice_id(&mut self, invoice_id: &str) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT id, invoice_id, organization_id, subscription_id, amount, due_date, status,
                   last_overdue_email_sent, created_at, updated_at
            FROM invoices WHERE invoice_id = ?
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get invoice by provider id")?;

        Ok(row.map(row_to_invoice))
    }

    /// Open invoices whose due date is before `today`
    pub async fn list_overdue(&mut self, today: NaiveDate) -> Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT id, invoice_id, organization_id, subscription_id, amount, due_date, status,
                   last_overdue_email_sent, created_at, updated_at
            FROM invoices
            WHERE status = 'open' AND due_date IS NOT NULL AND due_date < ?
            ORDER BY due_date, id
            "#,
        )
        .bind(format_db_date(today))
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list overdue invoices")?;

        Ok(rows.into_iter().map(row_to_invoice).collect())
    }

    /// Update status (and optionally due date) of an invoice by provider id.
    /// Returns `false` when no such invoice is mirrored locally.
    pub async fn set_status(
        &mut self,
        invoice_id: &str,
        status: InvoiceStatus,
        due_date: Option<NaiveDate>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = ?, due_date = COALESCE(?, due_date), updated_at = ?
            WHERE invoice_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(due_date.map(format_db_date))
        .bind(Utc::now().to_rfc3339())
        .bind(invoice_id)
        .execute(&mut *self.conn)
        .await
        .context("Failed to update invoice status")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_last_overdue_email_sent(&mut self, id: Uuid, date: NaiveDate) -> Result<()> {
        sqlx::query("UPDATE invoices SET last_overdue_email_sent = ?, updated_at = ? WHERE id = ?")
            .bind(format_db_date(date))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to record overdue email")?;
        Ok(())
    }
}

fn row_to_invoice(row: InvoiceRow) -> Invoice {
    Invoice {
        id: parse_db_uuid(&row.id),
        invoice_id: row.invoice_id,
        organization_id: parse_db_uuid(&row.organization_id),
        subscription_id: row.subscription_id.as_deref().map(parse_db_uuid),
        amount: row.amount,
        due_date: row.due_date.as_deref().and_then(parse_db_date),
        status: row.status.parse().unwrap_or(InvoiceStatus::Draft),
        last_overdue_email_sent: row.last_overdue_email_sent.as_deref().and_then(parse_db_date),
        created_at: parse_db_timestamp(&row.created_at),
        updated_at: parse_db_timestamp(&row.updated_at),
    }
}
