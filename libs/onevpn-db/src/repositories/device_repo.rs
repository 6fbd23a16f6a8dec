use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::device::Device;

#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(
            "SELECT id, user_id, fingerprint, label, last_seen FROM devices WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch devices")
    }

    /// Registers a fingerprint, or refreshes `last_seen` when it is already known.
    pub async fn register(&self, user_id: i64, fingerprint: &str, label: &str) -> Result<Device> {
        sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (user_id, fingerprint, label)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, fingerprint) DO UPDATE SET last_seen = CURRENT_TIMESTAMP
            RETURNING id, user_id, fingerprint, label, last_seen
            "#,
        )
        .bind(user_id)
        .bind(fingerprint)
        .bind(label)
        .fetch_one(&self.pool)
        .await
        .context("Failed to register device")
    }

    /// Returns false when the device does not exist or belongs to someone else.
    pub async fn delete(&self, user_id: i64, device_id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM devices WHERE id = $1 AND user_id = $2")
            .bind(device_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete device")?
            .rows_affected();
        Ok(rows > 0)
    }
}
