use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use onevpn_db::store::SettingsStore;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::{Clock, days_covered};
use crate::services::billing_service::{ProvisioningStatus, allowed_devices, daily_cost};
use crate::services::subscription_service::SubscriptionService;

pub const LAST_BILLED_DATE_KEY: &str = "last_billed_date";

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    /// Already billed today; nothing was touched.
    pub skipped: bool,
    pub billed: usize,
    pub suspended: usize,
    pub banned: usize,
    pub failed: usize,
    /// Billed but the remote update did not go through.
    pub provisioning_failures: usize,
}

enum Billed {
    Charged { confirmed: bool },
    Suspended,
    Banned,
    Missing,
}

/// Debits one day of service from every user once per calendar day (UTC).
pub struct PeriodicBiller {
    subscriptions: Arc<SubscriptionService>,
    /// Uncached store so a marker written by another process is seen.
    markers: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    check_interval: StdDuration,
}

impl PeriodicBiller {
    pub fn new(
        subscriptions: Arc<SubscriptionService>,
        markers: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
        check_interval: StdDuration,
    ) -> Self {
        Self {
            subscriptions,
            markers,
            clock,
            check_interval,
        }
    }

    /// Wakes up every `check_interval` and bills if the date has changed.
    /// Never returns.
    pub async fn start(self: Arc<Self>) {
        info!(
            "Daily biller started, checking every {}s",
            self.check_interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_daily_sweep_once().await {
                error!("Daily sweep failed: {:#}", e);
            }
        }
    }

    pub async fn run_daily_sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let today = now.date_naive().format("%Y-%m-%d").to_string();

        let last = self
            .markers
            .get(LAST_BILLED_DATE_KEY)
            .await
            .context("Failed to read last billed date")?;
        if last.as_deref() == Some(today.as_str()) {
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        }

        // Marker first: a sweep that dies halfway is not repeated today.
        self.markers
            .set(LAST_BILLED_DATE_KEY, &today)
            .await
            .context("Failed to store last billed date")?;

        let price = self.subscriptions.reconciler().pricing().get_price().await;
        let user_ids = self
            .subscriptions
            .accounts()
            .user_ids()
            .await
            .context("Failed to list users for billing")?;
        info!("Daily sweep for {}: {} users at {}/day", today, user_ids.len(), price);

        let mut report = SweepReport::default();
        for user_id in user_ids {
            match self.bill_user(user_id, price, now).await {
                Ok(Billed::Charged { confirmed }) => {
                    report.billed += 1;
                    if !confirmed {
                        report.provisioning_failures += 1;
                    }
                }
                Ok(Billed::Suspended) => report.suspended += 1,
                Ok(Billed::Banned) => report.banned += 1,
                Ok(Billed::Missing) => {}
                Err(e) => {
                    report.failed += 1;
                    error!("Billing user {} failed: {:#}", user_id, e);
                }
            }
        }

        info!(
            "Daily sweep done: {} billed, {} suspended, {} banned, {} failed, {} provisioning failures",
            report.billed, report.suspended, report.banned, report.failed, report.provisioning_failures
        );
        Ok(report)
    }

    async fn bill_user(&self, user_id: i64, price: f64, now: DateTime<Utc>) -> Result<Billed> {
        let _guard = self.subscriptions.lock_user(user_id).await;
        let accounts = self.subscriptions.accounts();
        let reconciler = self.subscriptions.reconciler();

        let Some(mut user) = accounts.get_user(user_id).await? else {
            return Ok(Billed::Missing);
        };
        let allowed = allowed_devices(accounts.count_devices(user_id).await?);
        user.allowed_devices = allowed;
        let mut debit = 0;

        let result = if user.banned {
            reconciler.ban(&mut user).await;
            Billed::Banned
        } else {
            let cost = daily_cost(price, allowed);
            if cost > 0.0 && user.balance as f64 >= cost {
                debit = cost.ceil() as i64;
                user.balance = (user.balance - debit).max(0);
                // Today is paid for on top of what the rest of the balance covers.
                let days = days_covered(user.balance, cost) + 1;
                let (_, status) = reconciler.activate(&mut user, now + Duration::days(days)).await;
                if status != ProvisioningStatus::Confirmed {
                    warn!("User {} billed {} but provisioning is {:?}", user_id, debit, status);
                }
                Billed::Charged {
                    confirmed: status == ProvisioningStatus::Confirmed,
                }
            } else {
                reconciler.suspend(&mut user, now).await;
                Billed::Suspended
            }
        };

        accounts
            .save_billing_state(&user, debit)
            .await
            .with_context(|| format!("Failed to save billing state of user {}", user_id))?;
        Ok(result)
    }
}
