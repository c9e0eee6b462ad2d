//! Organization (tenant) repository

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::{MergeRecord, Organization, OrganizationState};

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: String,
    name: String,
    slug: String,
    individual: bool,
    private: bool,
    verified_journalist: bool,
    max_users: i64,
    payment_failed: bool,
    allow_auto_join: bool,
    city: String,
    state: String,
    country: String,
    parent_id: Option<String>,
    merged_into: Option<String>,
    merged_at: Option<String>,
    merged_by: Option<String>,
    created_at: String,
    updated_at: String,
}

const ORGANIZATION_COLUMNS: &str = r#"
    o.id, o.name, o.slug, o.individual, o.private, o.verified_journalist,
    o.max_users, o.payment_failed, o.allow_auto_join, o.city, o.state, o.country,
    o.parent_id, o.merged_into, o.merged_at, o.merged_by, o.created_at, o.updated_at
"#;

/// Values for a new organization row
#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub individual: bool,
    pub private: bool,
    pub verified_journalist: bool,
    pub max_users: i64,
}

pub struct OrganizationRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> OrganizationRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, new: &NewOrganization) -> Result<Organization> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO organizations
                (id, name, slug, individual, private, verified_journalist, max_users,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.id.to_string())
        .bind(&new.name)
        .bind(&new.slug)
        .bind(new.individual)
        .bind(new.private)
        .bind(new.verified_journalist)
        .bind(new.max_users)
        .bind(&now)
        .bind(&now)
        .execute(&mut *self.conn)
        .await
        .context("Failed to create organization")?;

        self.get(new.id)
            .await?
            .context("Failed to retrieve created organization")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {} FROM organizations o WHERE o.id = ?",
            ORGANIZATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get organization")?;

        Ok(row.map(row_to_org))
    }

    pub async fn get_by_slug(&mut self, slug: &str) -> Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {} FROM organizations o WHERE o.slug = ?",
            ORGANIZATION_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get organization by slug")?;

        Ok(row.map(row_to_org))
    }

    /// Organization owning a billing-provider customer id
    pub async fn find_by_customer_id(&mut self, customer_id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            SELECT {} FROM organizations o
            JOIN customers c ON c.organization_id = o.id
            WHERE c.customer_id = ?
            "#,
            ORGANIZATION_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to find organization by customer id")?;

        Ok(row.map(row_to_org))
    }

    /// Active organizations accepting auto-join for an email domain
    pub async fn find_auto_join(&mut self, domain: &str) -> Result<Vec<Organization>> {
        let rows = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            SELECT {} FROM organizations o
            JOIN organization_email_domains d ON d.organization_id = o.id
            WHERE d.domain = ? AND o.allow_auto_join = 1 AND o.merged_into IS NULL
            ORDER BY o.name
            "#,
            ORGANIZATION_COLUMNS
        ))
        .bind(domain.to_lowercase())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to find auto-join organizations")?;

        Ok(rows.into_iter().map(row_to_org).collect())
    }

    /// Active groups the organization belongs to
    pub async fn groups_of(&mut self, member_id: Uuid) -> Result<Vec<Organization>> {
        let rows = sqlx::query_as::<_, OrganizationRow>(&format!(
            r#"
            SELECT {} FROM organizations o
            JOIN organization_members m ON m.group_id = o.id
            WHERE m.member_id = ? AND o.merged_into IS NULL
            ORDER BY o.name
            "#,
            ORGANIZATION_COLUMNS
        ))
        .bind(member_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list organization groups")?;

        Ok(rows.into_iter().map(row_to_org).collect())
    }

    pub async fn member_ids(&mut self, group_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT member_id FROM organization_members WHERE group_id = ? ORDER BY member_id",
        )
        .bind(group_id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list group members")?;

        Ok(rows.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }

    pub async fn child_ids(&mut self, parent_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM organizations WHERE parent_id = ? ORDER BY id")
                .bind(parent_id.to_string())
                .fetch_all(&mut *self.conn)
                .await
                .context("Failed to list child organizations")?;

        Ok(rows.into_iter().map(|(id,)| parse_db_uuid(&id)).collect())
    }

    /// Persist the mutable columns of an organization
    pub async fn save(&mut self, org: &Organization) -> Result<()> {
        let (merged_into, merged_at, merged_by) = match (&org.state, &org.merge) {
            (OrganizationState::MergedInto(target), Some(record)) => (
                Some(target.to_string()),
                Some(record.merged_at.to_rfc3339()),
                record.merged_by.map(|u| u.to_string()),
            ),
            (OrganizationState::MergedInto(target), None) => {
                (Some(target.to_string()), Some(Utc::now().to_rfc3339()), None)
            }
            (OrganizationState::Active, _) => (None, None, None),
        };

        sqlx::query(
            r#"
            UPDATE organizations
            SET name = ?, slug = ?, private = ?, verified_journalist = ?, max_users = ?,
                payment_failed = ?, allow_auto_join = ?, city = ?, state = ?, country = ?,
                parent_id = ?, merged_into = ?, merged_at = ?, merged_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&org.name)
        .bind(&org.slug)
        .bind(org.private)
        .bind(org.verified_journalist)
        .bind(org.max_users)
        .bind(org.payment_failed)
        .bind(org.allow_auto_join)
        .bind(&org.city)
        .bind(&org.state_province)
        .bind(&org.country)
        .bind(org.parent_id.map(|p| p.to_string()))
        .bind(merged_into)
        .bind(merged_at)
        .bind(merged_by)
        .bind(Utc::now().to_rfc3339())
        .bind(org.id.to_string())
        .execute(&mut *self.conn)
        .await
        .context("Failed to update organization")?;

        Ok(())
    }

    pub async fn set_payment_failed(&mut self, id: Uuid, failed: bool) -> Result<()> {
        sqlx::query("UPDATE organizations SET payment_failed = ?, updated_at = ? WHERE id = ?")
            .bind(failed)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to update payment_failed")?;
        Ok(())
    }

    pub async fn set_max_users(&mut self, id: Uuid, max_users: i64) -> Result<()> {
        sqlx::query("UPDATE organizations SET max_users = ?, updated_at = ? WHERE id = ?")
            .bind(max_users)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to update max_users")?;
        Ok(())
    }

    pub async fn add_to_group(&mut self, group_id: Uuid, member_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO organization_members (group_id, member_id) VALUES (?, ?)")
            .bind(group_id.to_string())
            .bind(member_id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to add organization to group")?;
        Ok(())
    }

    pub async fn add_email_domain(&mut self, id: Uuid, domain: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO organization_email_domains (organization_id, domain) VALUES (?, ?)",
        )
        .bind(id.to_string())
        .bind(domain.to_lowercase())
        .execute(&mut *self.conn)
        .await
        .context("Failed to add email domain")?;
        Ok(())
    }

    pub async fn email_domains(&mut self, id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT domain FROM organization_email_domains WHERE organization_id = ? ORDER BY domain",
        )
        .bind(id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list email domains")?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub async fn add_url(&mut self, id: Uuid, url: &str) -> Result<()> {
        sqlx::query("INSERT INTO organization_urls (organization_id, url) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(url)
            .execute(&mut *self.conn)
            .await
            .context("Failed to add organization url")?;
        Ok(())
    }

    pub async fn urls(&mut self, id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM organization_urls WHERE organization_id = ? ORDER BY id")
                .bind(id.to_string())
                .fetch_all(&mut *self.conn)
                .await
                .context("Failed to list organization urls")?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    pub async fn add_subtype(&mut self, id: Uuid, subtype: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO organization_subtypes (organization_id, subtype) VALUES (?, ?)",
        )
        .bind(id.to_string())
        .bind(subtype)
        .execute(&mut *self.conn)
        .await
        .context("Failed to add organization subtype")?;
        Ok(())
    }

    pub async fn subtypes(&mut self, id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT subtype FROM organization_subtypes WHERE organization_id = ? ORDER BY subtype",
        )
        .bind(id.to_string())
        .fetch_all(&mut *self.conn)
        .await
        .context("Failed to list organization subtypes")?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    /// Move every list-valued organization relation from `source` to `target`.
    ///
    /// Covers children, group links in both directions, subtypes, urls and
    /// email domains. Links that would point an organization at itself are
    /// dropped.
    pub async fn reassign_relations(&mut self, source: Uuid, target: Uuid) -> Result<()> {
        let (source, target) = (source.to_string(), target.to_string());

        sqlx::query("UPDATE organizations SET parent_id = ? WHERE parent_id = ? AND id != ?")
            .bind(&target)
            .bind(&source)
            .bind(&target)
            .execute(&mut *self.conn)
            .await
            .context("Failed to reassign child organizations")?;

        // groups the source belonged to
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO organization_members (group_id, member_id)
            SELECT group_id, ? FROM organization_members
            WHERE member_id = ? AND group_id != ?
            "#,
        )
        .bind(&target)
        .bind(&source)
        .bind(&target)
        .execute(&mut *self.conn)
        .await
        .context("Failed to reassign group memberships")?;

        // members of the source group
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO organization_members (group_id, member_id)
            SELECT ?, member_id FROM organization_members
            WHERE group_id = ? AND member_id != ?
            "#,
        )
        .bind(&target)
        .bind(&source)
        .bind(&target)
        .execute(&mut *self.conn)
        .await
        .context("Failed to reassign group members")?;

        sqlx::query("DELETE FROM organization_members WHERE group_id = ? OR member_id = ?")
            .bind(&source)
            .bind(&source)
            .execute(&mut *self.conn)
            .await
            .context("Failed to clear source group links")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO organization_subtypes (organization_id, subtype)
            SELECT ?, subtype FROM organization_subtypes WHERE organization_id = ?
            "#,
        )
        .bind(&target)
        .bind(&source)
        .execute(&mut *self.conn)
        .await
        .context("Failed to copy subtypes")?;

        sqlx::query("DELETE FROM organization_subtypes WHERE organization_id = ?")
            .bind(&source)
            .execute(&mut *self.conn)
            .await
            .context("Failed to clear source subtypes")?;

        sqlx::query("UPDATE organization_urls SET organization_id = ? WHERE organization_id = ?")
            .bind(&target)
            .bind(&source)
            .execute(&mut *self.conn)
            .await
            .context("Failed to reassign urls")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO organization_email_domains (organization_id, domain)
            SELECT ?, domain FROM organization_email_domains WHERE organization_id = ?
            "#,
        )
        .bind(&target)
        .bind(&source)
        .execute(&mut *self.conn)
        .await
        .context("Failed to copy email domains")?;

        sqlx::query("DELETE FROM organization_email_domains WHERE organization_id = ?")
            .bind(&source)
            .execute(&mut *self.conn)
            .await
            .context("Failed to clear source email domains")?;

        Ok(())
    }
}

fn parse_optional_timestamp(ts: Option<String>) -> Option<DateTime<Utc>> {
    ts.as_deref().map(parse_db_timestamp)
}

fn row_to_org(row: OrganizationRow) -> Organization {
    let state = match row.merged_into.as_deref() {
        Some(target) => OrganizationState::MergedInto(parse_db_uuid(target)),
        None => OrganizationState::Active,
    };
    let merge = parse_optional_timestamp(row.merged_at).map(|merged_at| MergeRecord {
        merged_at,
        merged_by: row.merged_by.as_deref().map(parse_db_uuid),
    });

    Organization {
        id: parse_db_uuid(&row.id),
        name: row.name,
        slug: row.slug,
        individual: row.individual,
        private: row.private,
        verified_journalist: row.verified_journalist,
        max_users: row.max_users,
        payment_failed: row.payment_failed,
        allow_auto_join: row.allow_auto_join,
        city: row.city,
        state_province: row.state,
        country: row.country,
        parent_id: row.parent_id.as_deref().map(parse_db_uuid),
        state,
        merge,
        created_at: parse_db_timestamp(&row.created_at),
        updated_at: parse_db_timestamp(&row.updated_at),
    }
}
