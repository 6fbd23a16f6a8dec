use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use onevpn_db::models::user::User;
use onevpn_db::store::AccountStore;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::services::billing_service::{BillingReconciler, ProvisioningStatus, ReconcileOutcome};

/// One async mutex per user id. Entries are dropped once nobody holds them.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Persisted user state after a reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub user: User,
    pub outcome: ReconcileOutcome,
}

/// Serializes read-modify-provision-write per user and persists the result.
pub struct SubscriptionService {
    accounts: Arc<dyn AccountStore>,
    reconciler: Arc<BillingReconciler>,
    locks: UserLocks,
}

impl SubscriptionService {
    pub fn new(accounts: Arc<dyn AccountStore>, reconciler: Arc<BillingReconciler>) -> Self {
        Self {
            accounts,
            reconciler,
            locks: UserLocks::default(),
        }
    }

    pub fn reconciler(&self) -> &BillingReconciler {
        &self.reconciler
    }

    pub fn accounts(&self) -> &Arc<dyn AccountStore> {
        &self.accounts
    }

    /// Held by anything that rewrites a user's billing state.
    pub async fn lock_user(&self, user_id: i64) -> OwnedMutexGuard<()> {
        self.locks.lock(user_id).await
    }

    /// `Ok(None)` when the user does not exist.
    pub async fn recalc_subscription(&self, user_id: i64) -> Result<Option<Reconciled>> {
        let _guard = self.lock_user(user_id).await;
        self.recalc_locked(user_id).await
    }

    /// Runs `change` and the reconciliation that follows it under the user's lock.
    pub async fn change_then_recalc<T, F, Fut>(&self, user_id: i64, change: F) -> Result<(T, Reconciled)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock_user(user_id).await;
        let value = change().await?;
        let reconciled = self
            .recalc_locked(user_id)
            .await?
            .ok_or_else(|| anyhow!("User {} disappeared during update", user_id))?;
        Ok((value, reconciled))
    }

    async fn recalc_locked(&self, user_id: i64) -> Result<Option<Reconciled>> {
        let Some(mut user) = self.accounts.get_user(user_id).await? else {
            return Ok(None);
        };
        let devices = self
            .accounts
            .count_devices(user_id)
            .await
            .context("Failed to count devices")?;

        let outcome = self.reconciler.reconcile(&mut user, devices).await;

        user.balance = self
            .accounts
            .save_billing_state(&user, 0)
            .await
            .with_context(|| format!("Failed to persist billing state of user {}", user_id))?;

        match &outcome.provisioning {
            ProvisioningStatus::Unavailable(e) => {
                error!("Provisioning unavailable for user {}: {}", user_id, e)
            }
            ProvisioningStatus::Failed(e) => warn!("Provisioning failed for user {}: {}", user_id, e),
            _ => debug!(
                "Reconciled user {}: {} days, suspended={}",
                user_id, outcome.estimated_days, outcome.link_suspended
            ),
        }

        Ok(Some(Reconciled { user, outcome }))
    }
}
