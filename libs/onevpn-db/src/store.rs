//! Persistence seams consumed by the billing core.
//!
//! The Pg repositories implement these; the panel's tests swap in in-memory
//! versions.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::provisioning::{BackendKind, Binding, NewBinding, ProvisioningPool};
use crate::models::user::User;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn user_ids(&self) -> Result<Vec<i64>>;

    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    async fn count_devices(&self, user_id: i64) -> Result<i64>;

    /// Writes expiry, device allowance and suspension, and takes `debit` off
    /// the stored balance (never below zero). The balance is never written
    /// back, so credits applied meanwhile survive. Returns the new balance.
    async fn save_billing_state(&self, user: &User, debit: i64) -> Result<i64>;
}

#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn find_binding(&self, user_id: i64, backend: BackendKind) -> Result<Option<Binding>>;

    /// Insert or update in place; `(user_id, backend)` is unique.
    async fn save_binding(&self, binding: &NewBinding) -> Result<()>;

    /// Pools of one backend in placement order.
    async fn pools(&self, backend: BackendKind) -> Result<Vec<ProvisioningPool>>;

    async fn get_pool(&self, id: i64) -> Result<Option<ProvisioningPool>>;

    /// Bindings in the pool whose user holds an active subscription,
    /// not counting `exclude_user`.
    async fn active_in_pool(
        &self,
        pool_id: i64,
        now: DateTime<Utc>,
        exclude_user: i64,
    ) -> Result<i64>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}
