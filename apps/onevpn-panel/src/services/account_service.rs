use std::sync::Arc;

use anyhow::{Context, Result};
use onevpn_db::models::device::Device;
use onevpn_db::models::payment::{Payment, STATUS_SUCCEEDED};
use onevpn_db::models::user::User;
use onevpn_db::repositories::device_repo::DeviceRepository;
use onevpn_db::repositories::payment_repo::PaymentRepository;
use onevpn_db::repositories::user_repo::UserRepository;
use sqlx::PgPool;
use tracing::info;

use crate::services::notification_service::{Notice, Notifier};
use crate::services::subscription_service::{Reconciled, SubscriptionService};

/// User-facing and admin mutations. Every change that affects billing is
/// followed by a reconciliation under the user's lock.
pub struct AccountService {
    pub users: UserRepository,
    pub devices: DeviceRepository,
    pub payments: PaymentRepository,
    subscriptions: Arc<SubscriptionService>,
    notifier: Arc<dyn Notifier>,
}

impl AccountService {
    pub fn new(pool: PgPool, subscriptions: Arc<SubscriptionService>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            devices: DeviceRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool),
            subscriptions,
            notifier,
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionService> {
        &self.subscriptions
    }

    /// Creates the user on first authenticated contact and keeps the
    /// display name current afterwards.
    pub async fn get_or_create_user(&self, telegram_id: &str, username: Option<&str>) -> Result<User> {
        let user = self.users.upsert(telegram_id, username).await?;
        if user.created_at == user.updated_at {
            info!("New user {} (tg {})", user.id, telegram_id);
        }
        Ok(user)
    }

    pub async fn register_device(&self, user_id: i64, fingerprint: &str, label: &str) -> Result<(Device, Reconciled)> {
        self.subscriptions
            .change_then_recalc(user_id, || self.devices.register(user_id, fingerprint, label))
            .await
    }

    /// `false` in the first slot when the device does not belong to the user.
    pub async fn delete_device(&self, user_id: i64, device_id: i64) -> Result<(bool, Reconciled)> {
        self.subscriptions
            .change_then_recalc(user_id, || self.devices.delete(user_id, device_id))
            .await
    }

    /// Adds `delta` (negative debits), clamping the balance at zero.
    pub async fn adjust_balance(&self, user_id: i64, delta: i64) -> Result<Reconciled> {
        let (balance, reconciled) = self
            .subscriptions
            .change_then_recalc(user_id, || self.users.adjust_balance(user_id, delta))
            .await?;
        info!("Balance of user {} adjusted by {} to {}", user_id, delta, balance);
        Ok(reconciled)
    }

    pub async fn set_banned(&self, user_id: i64, banned: bool) -> Result<Reconciled> {
        let ((), reconciled) = self
            .subscriptions
            .change_then_recalc(user_id, || self.users.set_banned(user_id, banned))
            .await?;
        info!("User {} banned={}", user_id, banned);
        Ok(reconciled)
    }

    pub async fn create_topup(&self, user_id: i64, amount: i64) -> Result<Payment> {
        self.payments.create_pending(user_id, amount).await
    }

    /// Applies a provider status update. A `succeeded` payment credits the
    /// balance exactly once; other statuses are only recorded.
    pub async fn apply_payment_status(&self, payment_id: i64, status: &str) -> Result<Option<Reconciled>> {
        let payment = self
            .payments
            .get_by_id(payment_id)
            .await?
            .with_context(|| format!("Payment {} not found", payment_id))?;

        if status != STATUS_SUCCEEDED {
            self.payments.set_status(payment_id, status).await?;
            info!("Payment {} is now {}", payment_id, status);
            return Ok(None);
        }

        let (settled, reconciled) = self
            .subscriptions
            .change_then_recalc(payment.user_id, || self.payments.settle(payment_id))
            .await?;

        match settled {
            Some(payment) => {
                info!("Payment {} credited {} to user {}", payment.id, payment.amount, payment.user_id);
                self.notifier
                    .notify(
                        &reconciled.user.telegram_id,
                        Notice::BalanceCredited { amount: payment.amount },
                    )
                    .await;
                Ok(Some(reconciled))
            }
            None => {
                info!("Payment {} was already settled", payment_id);
                Ok(None)
            }
        }
    }
}
