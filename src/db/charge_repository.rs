//! Charge repository

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::Charge;

#[derive(Debug, sqlx::FromRow)]
struct ChargeRow {
    id: String,
    charge_id: String,
    organization_id: String,
    amount: i64,
    fee_amount: i64,
    description: String,
    metadata: String,
    created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewCharge {
    pub charge_id: String,
    pub organization_id: Uuid,
    pub amount: i64,
    pub fee_amount: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

pub struct ChargeRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ChargeRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert a charge unless one with the same provider id exists.
    ///
    /// Returns the stored charge and whether this call created it.
    pub async fn get_or_create(&mut self, charge: &NewCharge) -> Result<(Charge, bool)> {
        let metadata = serde_json::to_string(&charge.metadata)
            .context("Failed to encode charge metadata")?;

        let result = sqlx::query(
            r#"
            INSERT INTO charges
                (id, charge_id, organization_id, amount, fee_amount, description, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (charge_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&charge.charge_id)
        .bind(charge.organization_id.to_string())
        .bind(charge.amount)
        .bind(charge.fee_amount)
        .bind(&charge.description)
        .bind(metadata)
        .bind(charge.created_at.to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .context("Failed to create charge")?;

        let stored = self
            .get_by_charge_id(&charge.charge_id)
            .await?
            .context("Failed to retrieve charge")?;
        Ok((stored, result.rows_affected() > 0))
    }

    pub async fn get_by_charge_id(&mut self, charge_id: &str) -> Result<Option<Charge>> {
        let row = sqlx::query_as::<_, ChargeRow>(
            r#"
            SELECT id, charge_id, organization_id, amount, fee_amount, description, metadata, created_at
            FROM charges WHERE charge_id = ?
            "#,
        )
        .bind(charge_id)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get charge")?;

        Ok(row.map(row_to_charge))
    }

    pub async fn list_for_organization(&mut self, organization_id: Uuid) -> Result<Vec<Charge>> {
        let rows = sqlx::query_as::<_, ChargeRow>(
            r#"
            SELECT id, charge_id, organization_id, amount, fee_amount, description, metadata, created_at
            FROM charges WHERE organization_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(organization_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list charges")?;

        Ok(rows.into_iter().map(row_to_charge).collect())
    }

    pub async fn reassign(&mut self, source: Uuid, target: Uuid) -> Result<u64> {
        let result = sqlx::query("UPDATE charges SET organization_id = ? WHERE organization_id = ?")
            .bind(target.to_string())
            .bind(source.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to reassign charges")?;
        Ok(result.rows_affected())
    }
}

fn row_to_charge(row: ChargeRow) -> Charge {
    Charge {
        id: parse_db_uuid(&row.id),
        charge_id: row.charge_id,
        organization_id: parse_db_uuid(&row.organization_id),
        amount: row.amount,
        fee_amount: row.fee_amount,
        description: row.description,
        metadata: serde_json::from_str(&row.metadata).unwrap_or_default(),
        created_at: parse_db_timestamp(&row.created_at),
    }
}
