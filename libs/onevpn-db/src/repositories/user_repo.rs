use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::user::{User, generate_link_slug};
use crate::store::AccountStore;

const USER_COLUMNS: &str = "id, telegram_id, username, balance, subscription_end, allowed_devices, \
     link_slug, banned, link_suspended, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_all(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users ORDER BY id",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch all users")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by ID")
    }

    pub async fn get_by_telegram_id(&self, telegram_id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE telegram_id = $1",
            USER_COLUMNS
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by Telegram ID")
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE username = $1 ORDER BY id LIMIT 1",
            USER_COLUMNS
        ))
        .bind(username.trim_start_matches('@'))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by username")
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE link_slug = $1",
            USER_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by link slug")
    }

    /// Creates the user on first contact; later calls only refresh the username.
    pub async fn upsert(&self, telegram_id: &str, username: Option<&str>) -> Result<User> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (telegram_id, username, link_slug)
            VALUES ($1, $2, $3)
            ON CONFLICT (telegram_id) DO UPDATE SET
                username = COALESCE(excluded.username, users.username),
                updated_at = CURRENT_TIMESTAMP
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(telegram_id)
        .bind(username)
        .bind(generate_link_slug())
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert user")
    }

    /// Adds `delta` to the balance, never going below zero. Returns the new balance.
    pub async fn adjust_balance(&self, id: i64, delta: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE users SET balance = GREATEST(balance + $1, 0), updated_at = CURRENT_TIMESTAMP \
             WHERE id = $2 RETURNING balance",
        )
        .bind(delta)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to adjust user balance")
    }

    pub async fn set_banned(&self, id: i64, banned: bool) -> Result<()> {
        sqlx::query("UPDATE users SET banned = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(banned)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update ban flag")?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for UserRepository {
    async fn user_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list user ids")
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.get_by_id(id).await
    }

    async fn count_devices(&self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM devices WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count devices")
    }

    async fn save_billing_state(&self, user: &User, debit: i64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE users SET
                balance = GREATEST(balance - $1, 0),
                subscription_end = $2,
                allowed_devices = $3,
                link_suspended = $4,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $5
            RETURNING balance
            "#,
        )
        .bind(debit)
        .bind(user.subscription_end)
        .bind(user.allowed_devices)
        .bind(user.link_suspended)
        .bind(user.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to save billing state")
    }
}
