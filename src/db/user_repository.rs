//! User repository

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{parse_db_timestamp, parse_db_uuid};
use crate::models::{CreateUserRequest, User};

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    username: String,
    name: String,
    email: Option<String>,
    email_verified: bool,
    verified_journalist: bool,
    is_staff: bool,
    created_at: String,
    updated_at: String,
}

pub struct UserRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> UserRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&mut self, req: &CreateUserRequest) -> Result<User> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO users (id, username, name, email, email_verified, is_staff, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&req.username)
        .bind(&req.name)
        .bind(req.email.as_deref().map(str::to_lowercase))
        .bind(req.email_verified)
        .bind(req.is_staff)
        .bind(&now)
        .bind(&now)
        .execute(&mut *self.conn)
        .await
        .context("Failed to create user")?;

        self.get(id).await?.context("Failed to retrieve created user")
    }

    pub async fn get(&mut self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, username, name, email, email_verified, verified_journalist, is_staff,
                   created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .context("Failed to get user")?;

        Ok(row.map(row_to_user))
    }

    pub async fn set_verified_journalist(&mut self, id: Uuid, verified: bool) -> Result<()> {
        sqlx::query("UPDATE users SET verified_journalist = ?, updated_at = ? WHERE id = ?")
            .bind(verified)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .context("Failed to update user verification")?;
        Ok(())
    }
}

fn row_to_user(row: UserRow) -> User {
    User {
        id: parse_db_uuid(&row.id),
        username: row.username,
        name: row.name,
        email: row.email,
        email_verified: row.email_verified,
        verified_journalist: row.verified_journalist,
        is_staff: row.is_staff,
        created_at: parse_db_timestamp(&row.created_at),
        updated_at: parse_db_timestamp(&row.updated_at),
    }
}
