//! Database layer
//!
//! SQLite persistence for organizations, memberships and billing records.
//! Repositories borrow a connection so that a single transaction can span
//! several of them.

mod change_log_repository;
mod change_request_repository;
mod charge_repository;
mod client_repository;
mod customer_repository;
mod invitation_repository;
mod invoice_repository;
mod membership_repository;
mod organization_repository;
mod plan_repository;
mod receipt_email_repository;
mod subscription_repository;
mod user_repository;

pub use change_log_repository::*;
pub use change_request_repository::*;
pub use charge_repository::*;
pub use client_repository::*;
pub use customer_repository::*;
pub use invitation_repository::*;
pub use invoice_repository::*;
pub use membership_repository::*;
pub use organization_repository::*;
pub use plan_repository::*;
pub use receipt_email_repository::*;
pub use subscription_repository::*;
pub use user_repository::*;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::warn;
use uuid::Uuid;

use crate::config::DatabaseConfig;

/// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Initialize the database connection pool and run migrations
pub async fn init_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("Invalid database URL: {}", config.url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.connect_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    Ok(pool)
}

/// Run a trivial query to confirm the database answers
pub async fn check_health(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("Database health check failed")?;
    Ok(())
}

pub(crate) fn parse_db_timestamp(ts: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S") {
        return DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc);
    }
    warn!(value = %ts, "Unparseable timestamp in database, using current time");
    Utc::now()
}

pub(crate) fn parse_db_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

pub(crate) fn parse_db_uuid(id: &str) -> Uuid {
    Uuid::parse_str(id).unwrap_or_else(|err| {
        warn!(value = %id, error = %err, "Unparseable id in database, using nil");
        Uuid::nil()
    })
}

pub(crate) fn format_db_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Bind a set of ids as a JSON array for `IN (SELECT value FROM json_each(?))`
pub(crate) fn json_id_list(ids: &[Uuid]) -> String {
    serde_json::Value::from(ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()).to_string()
}

const DATE_FORMAT: &str = "%Y-%m-%d";
