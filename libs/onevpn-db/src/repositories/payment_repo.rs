use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::payment::{Payment, STATUS_PENDING, STATUS_SUCCEEDED};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_pending(&self, user_id: i64, amount: i64) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (user_id, amount, status)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, amount, status, provider_payment_id, created_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create payment")
    }

    pub async fn set_provider_id(&self, id: i64, provider_payment_id: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET provider_payment_id = $1 WHERE id = $2")
            .bind(provider_payment_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to store provider payment id")?;
        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT id, user_id, amount, status, provider_payment_id, created_at FROM payments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch payment")
    }

    pub async fn set_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET status = $1 WHERE id = $2 AND status <> $3")
            .bind(status)
            .bind(id)
            .bind(STATUS_SUCCEEDED)
            .execute(&self.pool)
            .await
            .context("Failed to update payment status")?;
        Ok(())
    }

    /// Marks the payment succeeded and credits the owner in one transaction.
    /// Returns `None` when the payment was already settled or does not exist.
    pub async fn settle(&self, id: i64) -> Result<Option<Payment>> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET status = $1
            WHERE id = $2 AND status <> $1
            RETURNING id, user_id, amount, status, provider_payment_id, created_at
            "#,
        )
        .bind(STATUS_SUCCEEDED)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to settle payment")?;

        let Some(payment) = payment else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE users SET balance = balance + $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2")
            .bind(payment.amount)
            .bind(payment.user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to credit balance")?;

        tx.commit().await?;
        Ok(Some(payment))
    }
}
