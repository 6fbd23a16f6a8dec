use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use onevpn_db::models::user::User;
use tracing::{debug, info, warn};

use crate::clock::{Clock, days_covered, days_remaining};
use crate::services::notification_service::{Notice, Notifier};
use crate::services::pricing_service::PricingStore;
use crate::services::provisioning::{ProvisionTarget, ProvisioningBackend, ProvisioningError};

/// A low-balance warning is sent once the paid days drop to this or below.
pub const LOW_BALANCE_DAYS: i64 = 3;

/// What happened on the remote side during one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningStatus {
    Confirmed,
    /// Remote call failed; the user was suspended as a fallback.
    Failed(ProvisioningError),
    /// Backend not configured or out of capacity.
    Unavailable(ProvisioningError),
    /// Nothing to push (no remote account yet).
    Skipped,
}

impl ProvisioningStatus {
    fn from_error(err: ProvisioningError) -> Self {
        if err.is_configuration() {
            ProvisioningStatus::Unavailable(err)
        } else {
            ProvisioningStatus::Failed(err)
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProvisioningStatus::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub link: String,
    pub link_suspended: bool,
    pub allowed_devices: i32,
    pub estimated_days: i64,
    pub provisioning: ProvisioningStatus,
}

/// Cost of one day for `allowed_devices`; non-positive prices cost nothing.
pub fn daily_cost(price_per_day: f64, allowed_devices: i32) -> f64 {
    if !price_per_day.is_finite() || price_per_day <= 0.0 {
        return 0.0;
    }
    price_per_day * f64::from(allowed_devices.max(1))
}

pub fn allowed_devices(device_count: i64) -> i32 {
    device_count.clamp(1, i64::from(i32::MAX)) as i32
}

/// Derives subscription state from balance and devices and pushes it to the
/// provisioning backend. Mutates the user in place; persisting is up to the
/// caller.
pub struct BillingReconciler {
    pricing: PricingStore,
    backend: Arc<dyn ProvisioningBackend>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl BillingReconciler {
    pub fn new(
        pricing: PricingStore,
        backend: Arc<dyn ProvisioningBackend>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pricing,
            backend,
            notifier,
            clock,
        }
    }

    pub fn pricing(&self) -> &PricingStore {
        &self.pricing
    }

    pub async fn reconcile(&self, user: &mut User, device_count: i64) -> ReconcileOutcome {
        let price = self.pricing.get_price().await;
        let now = self.clock.now();

        let allowed = allowed_devices(device_count);
        user.allowed_devices = allowed;
        let cost = daily_cost(price, allowed);

        if user.banned {
            let provisioning = self.ban(user).await;
            return ReconcileOutcome {
                link: String::new(),
                link_suspended: true,
                allowed_devices: allowed,
                estimated_days: 0,
                provisioning,
            };
        }

        let estimated_days = days_covered(user.balance, cost);
        if estimated_days <= 0 {
            if cost <= 0.0 {
                warn!(
                    "Price per day is {}, treating user {} as unable to pay",
                    price, user.id
                );
            }
            let provisioning = self.suspend(user, now).await;
            return ReconcileOutcome {
                link: String::new(),
                link_suspended: true,
                allowed_devices: allowed,
                estimated_days: 0,
                provisioning,
            };
        }

        let previous_end = user.subscription_end;
        let end = match previous_end {
            // Already covers exactly the paid days: keep it so repeated calls do not drift.
            Some(prev) if days_remaining(prev, now) == estimated_days => prev,
            _ => now + Duration::days(estimated_days),
        };

        let (link, provisioning) = self.activate(user, end).await;

        let previous_estimate = previous_end.map_or(0, |prev| days_remaining(prev, now));
        if estimated_days <= LOW_BALANCE_DAYS
            && user.balance > 0
            && previous_end.is_some()
            && previous_estimate > LOW_BALANCE_DAYS
        {
            self.notifier
                .notify(&user.telegram_id, Notice::LowBalance { days: estimated_days })
                .await;
        }

        ReconcileOutcome {
            link,
            link_suspended: user.link_suspended,
            allowed_devices: allowed,
            estimated_days,
            provisioning,
        }
    }

    /// Clears access for a banned user and disables the remote account.
    pub async fn ban(&self, user: &mut User) -> ProvisioningStatus {
        user.subscription_end = None;
        user.link_suspended = true;

        let target = ProvisionTarget::from(&*user);
        match self.backend.disable(&target).await {
            Ok(()) => ProvisioningStatus::Confirmed,
            Err(e) => {
                warn!("Disable for banned user {} failed: {}", user.id, e);
                ProvisioningStatus::from_error(e)
            }
        }
    }

    /// Suspends for lack of funds, expiring the remote account now.
    pub async fn suspend(&self, user: &mut User, now: DateTime<Utc>) -> ProvisioningStatus {
        let was_suspended = user.link_suspended;
        let had_end = user.subscription_end.is_some();

        user.subscription_end = None;
        user.link_suspended = true;

        let target = ProvisionTarget::from(&*user);
        let status = match self
            .backend
            .update_existing(&target, user.allowed_devices, now)
            .await
        {
            Ok(Some(_)) => match self.backend.disable(&target).await {
                Ok(()) => ProvisioningStatus::Confirmed,
                Err(e) => ProvisioningStatus::from_error(e),
            },
            Ok(None) => ProvisioningStatus::Skipped,
            Err(e) => {
                // Still try to cut access even if the expiry push failed.
                if let Err(disable_err) = self.backend.disable(&target).await {
                    debug!("Disable after failed expiry push for user {}: {}", user.id, disable_err);
                }
                ProvisioningStatus::from_error(e)
            }
        };
        if let ProvisioningStatus::Failed(e) | ProvisioningStatus::Unavailable(e) = &status {
            warn!("Remote suspension of user {} not confirmed: {}", user.id, e);
        }

        if !was_suspended && (user.balance > 0 || had_end) {
            info!("Subscription of user {} paused", user.id);
            self.notifier
                .notify(&user.telegram_id, Notice::SubscriptionPaused)
                .await;
        }
        status
    }

    /// Grants access until `end` and confirms it remotely. Any remote failure
    /// leaves the user suspended with no link.
    pub async fn activate(&self, user: &mut User, end: DateTime<Utc>) -> (String, ProvisioningStatus) {
        user.subscription_end = Some(end);
        user.link_suspended = false;

        let target = ProvisionTarget::from(&*user);
        let result = async {
            let account = self
                .backend
                .upsert(&target, user.allowed_devices, end)
                .await?;
            self.backend.enable(&target).await?;
            Ok::<_, ProvisioningError>(account)
        }
        .await;

        match result {
            Ok(account) => (account.link, ProvisioningStatus::Confirmed),
            Err(e) => {
                warn!(
                    "Provisioning for user {} failed, suspending link: {}",
                    user.id, e
                );
                user.link_suspended = true;
                (String::new(), ProvisioningStatus::from_error(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notification_service::TelegramNotifier;
    use crate::testing::{
        BackendCall, FixedClock, MemorySettings, RecordingNotifier, ScriptedBackend, user,
    };

    struct Harness {
        reconciler: BillingReconciler,
        backend: Arc<ScriptedBackend>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<FixedClock>,
    }

    async fn harness(price: &str) -> Harness {
        let settings = Arc::new(MemorySettings::default());
        let pricing = PricingStore::new(settings, 10.0);
        pricing.set_price(price).await.unwrap();
        let backend = Arc::new(ScriptedBackend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(FixedClock::default());
        let reconciler = BillingReconciler::new(pricing, backend.clone(), notifier.clone(), clock.clone());
        Harness {
            reconciler,
            backend,
            notifier,
            clock,
        }
    }

    fn low_balance(n: &Notice) -> bool {
        matches!(n, Notice::LowBalance { .. })
    }

    #[test]
    fn cost_scales_with_devices() {
        assert_eq!(daily_cost(10.0, 3), 30.0);
        assert_eq!(daily_cost(0.0, 3), 0.0);
        assert_eq!(daily_cost(-5.0, 1), 0.0);
        assert_eq!(allowed_devices(0), 1);
        assert_eq!(allowed_devices(4), 4);
    }

    #[tokio::test]
    async fn funded_user_gets_paid_days() {
        let h = harness("10").await;
        let mut u = user(1, 100);

        let out = h.reconciler.reconcile(&mut u, 1).await;

        assert_eq!(out.estimated_days, 10);
        assert!(!out.link_suspended);
        assert_eq!(u.subscription_end, Some(h.clock.now() + Duration::days(10)));
        assert_eq!(out.link, "https://vpn.example.com/slug1#1VPN");
        assert_eq!(out.provisioning, ProvisioningStatus::Confirmed);
        assert_eq!(
            h.backend.calls(),
            vec![
                BackendCall::Upsert {
                    user_id: 1,
                    device_limit: 1,
                    expires_at: h.clock.now() + Duration::days(10),
                },
                BackendCall::Enable(1),
            ]
        );
    }

    #[tokio::test]
    async fn underfunded_user_is_suspended() {
        let h = harness("10").await;
        let mut u = user(1, 5);

        let out = h.reconciler.reconcile(&mut u, 1).await;

        assert_eq!(out.estimated_days, 0);
        assert!(out.link_suspended);
        assert!(out.link.is_empty());
        assert_eq!(u.subscription_end, None);
        assert!(u.link_suspended);
    }

    #[tokio::test]
    async fn three_devices_triple_the_cost() {
        let h = harness("10").await;
        let mut u = user(1, 100);

        let out = h.reconciler.reconcile(&mut u, 3).await;

        assert_eq!(out.allowed_devices, 3);
        assert_eq!(u.allowed_devices, 3);
        assert_eq!(out.estimated_days, 3);
    }

    #[tokio::test]
    async fn allowed_devices_is_at_least_one() {
        let h = harness("10").await;
        let mut u = user(1, 100);
        u.allowed_devices = 7;

        let out = h.reconciler.reconcile(&mut u, 0).await;
        assert_eq!(out.allowed_devices, 1);
        assert_eq!(u.allowed_devices, 1);
    }

    #[tokio::test]
    async fn banned_user_is_disabled_regardless_of_balance() {
        let h = harness("10").await;
        let mut u = user(1, 1000);
        u.banned = true;
        u.subscription_end = Some(h.clock.now() + Duration::days(30));

        let out = h.reconciler.reconcile(&mut u, 2).await;

        assert_eq!(u.subscription_end, None);
        assert!(u.link_suspended);
        assert_eq!(out.estimated_days, 0);
        assert!(out.link.is_empty());
        assert_eq!(h.backend.calls(), vec![BackendCall::Disable(1)]);
        assert_eq!(u.balance, 1000);
    }

    #[tokio::test]
    async fn banned_user_disable_failure_is_swallowed() {
        let h = harness("10").await;
        h.backend.fail_with(ProvisioningError::Timeout);
        let mut u = user(1, 1000);
        u.banned = true;

        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert!(out.link_suspended);
        assert_eq!(out.provisioning, ProvisioningStatus::Failed(ProvisioningError::Timeout));
    }

    #[tokio::test]
    async fn backend_failure_suspends_funded_user() {
        let h = harness("10").await;
        h.backend.fail_with(ProvisioningError::Status(502, "bad gateway".into()));
        let mut u = user(1, 100);

        let out = h.reconciler.reconcile(&mut u, 1).await;

        assert!(out.link_suspended);
        assert!(u.link_suspended);
        assert!(out.link.is_empty());
        assert_eq!(out.estimated_days, 10);
        assert!(matches!(out.provisioning, ProvisioningStatus::Failed(_)));
    }

    #[tokio::test]
    async fn unconfigured_backend_is_reported_as_unavailable() {
        let h = harness("10").await;
        h.backend.fail_with(ProvisioningError::NotConfigured);
        let mut u = user(1, 100);

        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert!(out.link_suspended);
        assert!(out.provisioning.is_unavailable());
    }

    #[tokio::test]
    async fn failed_user_recovers_on_next_pass() {
        let h = harness("10").await;
        h.backend.fail_with(ProvisioningError::Timeout);
        let mut u = user(1, 100);
        h.reconciler.reconcile(&mut u, 1).await;
        assert!(u.link_suspended);

        h.backend.recover();
        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert!(!out.link_suspended);
        assert!(!out.link.is_empty());
    }

    #[tokio::test]
    async fn zero_price_suspends() {
        let h = harness("0").await;
        let mut u = user(1, 500);

        let out = h.reconciler.reconcile(&mut u, 1).await;

        assert_eq!(out.estimated_days, 0);
        assert!(out.link_suspended);
        assert_eq!(u.subscription_end, None);
    }

    #[tokio::test]
    async fn repeated_reconcile_does_not_drift() {
        let h = harness("10").await;
        let mut u = user(1, 100);

        h.reconciler.reconcile(&mut u, 1).await;
        let first = (u.subscription_end, u.link_suspended);

        h.clock.advance(Duration::minutes(5));
        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!((u.subscription_end, u.link_suspended), first);

        h.clock.advance(Duration::hours(3));
        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!((u.subscription_end, u.link_suspended), first);
    }

    #[tokio::test]
    async fn balance_change_moves_the_end() {
        let h = harness("10").await;
        let mut u = user(1, 100);
        h.reconciler.reconcile(&mut u, 1).await;

        u.balance = 50;
        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(u.subscription_end, Some(h.clock.now() + Duration::days(5)));
    }

    #[tokio::test]
    async fn low_balance_warning_is_edge_triggered() {
        let h = harness("10").await;
        let mut u = user(1, 100);

        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(h.notifier.count(low_balance), 0);

        u.balance = 20;
        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(out.estimated_days, 2);
        assert_eq!(h.notifier.count(low_balance), 1);
        assert_eq!(
            h.notifier.sent()[0],
            ("1001".to_string(), Notice::LowBalance { days: 2 })
        );

        h.clock.advance(Duration::hours(1));
        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(h.notifier.count(low_balance), 1);

        u.balance = 10;
        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(out.estimated_days, 1);
        assert_eq!(h.notifier.count(low_balance), 1);
    }

    #[tokio::test]
    async fn no_low_balance_warning_without_previous_end() {
        let h = harness("10").await;
        let mut u = user(1, 20);

        h.reconciler.reconcile(&mut u, 1).await;
        assert_eq!(h.notifier.count(low_balance), 0);
    }

    #[tokio::test]
    async fn pause_notice_fires_once_on_transition() {
        let h = harness("10").await;
        let mut u = user(1, 100);
        h.reconciler.reconcile(&mut u, 1).await;

        u.balance = 5;
        h.reconciler.reconcile(&mut u, 1).await;
        h.reconciler.reconcile(&mut u, 1).await;

        let paused = h.notifier.count(|n| matches!(n, Notice::SubscriptionPaused));
        assert_eq!(paused, 1);
    }

    #[tokio::test]
    async fn fresh_user_without_money_gets_no_pause_notice() {
        let h = harness("10").await;
        let mut u = user(1, 0);

        h.reconciler.reconcile(&mut u, 1).await;
        assert!(h.notifier.sent().is_empty());
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn suspension_pushes_expiry_now_then_disables() {
        let h = harness("10").await;
        h.backend.mark_provisioned(1);
        let mut u = user(1, 5);

        let out = h.reconciler.reconcile(&mut u, 1).await;

        assert_eq!(
            h.backend.calls(),
            vec![
                BackendCall::UpdateExisting {
                    user_id: 1,
                    expires_at: h.clock.now(),
                },
                BackendCall::Disable(1),
            ]
        );
        assert_eq!(out.provisioning, ProvisioningStatus::Confirmed);
    }

    #[tokio::test]
    async fn suspension_survives_remote_failure() {
        let h = harness("10").await;
        h.backend.mark_provisioned(1);
        h.backend.fail_with(ProvisioningError::Transport("reset".into()));
        let mut u = user(1, 5);

        let out = h.reconciler.reconcile(&mut u, 1).await;
        assert!(out.link_suspended);
        assert_eq!(u.subscription_end, None);
        assert!(matches!(out.provisioning, ProvisioningStatus::Failed(_)));
    }

    #[tokio::test]
    async fn hung_telegram_does_not_delay_suspension() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (addr, server) = crate::testing::silent_listener().await;
        let api_url = url::Url::parse(&format!("http://{}/", addr)).unwrap();
        let bot = teloxide::Bot::new("123:abc").set_api_url(api_url);
        let notifier = Arc::new(TelegramNotifier::new(bot, Default::default()));

        let settings = Arc::new(MemorySettings::default());
        let pricing = PricingStore::new(settings, 10.0);
        let clock = Arc::new(FixedClock::default());
        let reconciler = BillingReconciler::new(
            pricing,
            Arc::new(ScriptedBackend::default()),
            notifier,
            clock.clone(),
        );
        let mut u = user(1, 5);
        u.subscription_end = Some(clock.now() + Duration::days(1));

        let out = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            reconciler.reconcile(&mut u, 1),
        )
        .await
        .unwrap();
        assert!(out.link_suspended);
        server.abort();
    }
}
