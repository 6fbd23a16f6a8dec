use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::provisioning::{BackendKind, Binding, NewBinding, NewPool, ProvisioningPool};
use crate::store::BindingStore;

const POOL_COLUMNS: &str =
    "id, backend, name, api_url, api_token, squad_uuid, capacity, position, created_at";
const BINDING_COLUMNS: &str =
    "id, user_id, pool_id, backend, remote_id, link, expires_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct ProvisioningRepository {
    pool: PgPool,
}

impl ProvisioningRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_pool(&self, new: &NewPool) -> Result<ProvisioningPool> {
        sqlx::query_as::<_, ProvisioningPool>(&format!(
            r#"
            INSERT INTO provisioning_pools (backend, name, api_url, api_token, squad_uuid, capacity, position)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            POOL_COLUMNS
        ))
        .bind(new.backend.as_str())
        .bind(&new.name)
        .bind(new.api_url.trim_end_matches('/'))
        .bind(&new.api_token)
        .bind(&new.squad_uuid)
        .bind(new.capacity.max(0))
        .bind(new.position)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create provisioning pool")
    }
}

#[async_trait]
impl BindingStore for ProvisioningRepository {
    async fn find_binding(&self, user_id: i64, backend: BackendKind) -> Result<Option<Binding>> {
        sqlx::query_as::<_, Binding>(&format!(
            "SELECT {} FROM provisioning_bindings WHERE user_id = $1 AND backend = $2",
            BINDING_COLUMNS
        ))
        .bind(user_id)
        .bind(backend.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch binding")
    }

    async fn save_binding(&self, binding: &NewBinding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provisioning_bindings (user_id, pool_id, backend, remote_id, link, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, backend) DO UPDATE SET
                pool_id = excluded.pool_id,
                remote_id = excluded.remote_id,
                link = excluded.link,
                expires_at = excluded.expires_at,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(binding.user_id)
        .bind(binding.pool_id)
        .bind(binding.backend.as_str())
        .bind(&binding.remote_id)
        .bind(&binding.link)
        .bind(binding.expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to save binding")?;
        Ok(())
    }

    async fn pools(&self, backend: BackendKind) -> Result<Vec<ProvisioningPool>> {
        sqlx::query_as::<_, ProvisioningPool>(&format!(
            "SELECT {} FROM provisioning_pools WHERE backend = $1 ORDER BY position, id",
            POOL_COLUMNS
        ))
        .bind(backend.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch provisioning pools")
    }

    async fn get_pool(&self, id: i64) -> Result<Option<ProvisioningPool>> {
        sqlx::query_as::<_, ProvisioningPool>(&format!(
            "SELECT {} FROM provisioning_pools WHERE id = $1",
            POOL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch provisioning pool")
    }

    async fn active_in_pool(
        &self,
        pool_id: i64,
        now: DateTime<Utc>,
        exclude_user: i64,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM provisioning_bindings b
            INNER JOIN users u ON u.id = b.user_id
            WHERE b.pool_id = $1
              AND b.user_id <> $2
              AND u.subscription_end IS NOT NULL
              AND u.subscription_end > $3
            "#,
        )
        .bind(pool_id)
        .bind(exclude_user)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count pool occupancy")
    }
}
