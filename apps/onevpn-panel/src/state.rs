use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use onevpn_db::models::provisioning::{BackendKind, NewPool};
use onevpn_db::repositories::provisioning_repo::ProvisioningRepository;
use onevpn_db::repositories::settings_repo::SettingsRepository;
use onevpn_db::repositories::user_repo::UserRepository;
use onevpn_db::store::BindingStore;
use sqlx::PgPool;
use teloxide::Bot;
use tracing::info;

use crate::bot::keyboards::webapp_keyboard;
use crate::clock::{Clock, SystemClock};
use crate::config::PanelConfig;
use crate::services::account_service::AccountService;
use crate::services::admin_auth_service::AdminAuthService;
use crate::services::billing_service::BillingReconciler;
use crate::services::daily_billing_service::PeriodicBiller;
use crate::services::notification_service::{NoopNotifier, Notifier, TelegramNotifier};
use crate::services::pricing_service::PricingStore;
use crate::services::provisioning::marzban::MarzbanApi;
use crate::services::provisioning::remnawave::RemnawaveApi;
use crate::services::provisioning::wireguard::WireguardLinks;
use crate::services::provisioning::{PanelApi, Provisioner, ProvisioningBackend, http_client};
use crate::services::settings_service::SettingsService;
use crate::services::subscription_service::SubscriptionService;

const SETTINGS_TTL: Duration = Duration::from_secs(30);
const DEFAULT_WIREGUARD_CAPACITY: i32 = 100_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfig>,
    pub pool: PgPool,
    pub bot: Option<Bot>,
    pub settings: Arc<SettingsService>,
    pub pricing: PricingStore,
    pub provisioning: ProvisioningRepository,
    pub notifier: Arc<dyn Notifier>,
    pub subscriptions: Arc<SubscriptionService>,
    pub accounts: Arc<AccountService>,
    pub biller: Arc<PeriodicBiller>,
    pub admin: Arc<AdminAuthService>,
}

fn panel_api(config: &PanelConfig) -> Result<Arc<dyn PanelApi>> {
    let api: Arc<dyn PanelApi> = match config.provisioning_backend {
        BackendKind::Wireguard => Arc::new(WireguardLinks::new(config.domain.clone())),
        BackendKind::Marzban => Arc::new(MarzbanApi::new(http_client(config.provisioning_timeout())?)),
        BackendKind::Remnawave => Arc::new(RemnawaveApi::new(http_client(config.provisioning_timeout())?)),
    };
    Ok(api)
}

impl AppState {
    /// Wires every service on top of one connection pool.
    pub fn build(config: PanelConfig, pool: PgPool) -> Result<Self> {
        let config = Arc::new(config);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let settings_repo = Arc::new(SettingsRepository::new(pool.clone()));
        let settings = Arc::new(SettingsService::new(settings_repo.clone(), SETTINGS_TTL));
        let pricing = PricingStore::new(settings.clone(), config.price_per_day);

        let provisioning = ProvisioningRepository::new(pool.clone());
        let backend = Arc::new(Provisioner::new(
            panel_api(&config)?,
            Arc::new(provisioning.clone()),
            clock.clone(),
        ));
        info!("Provisioning backend: {}", backend.kind());

        let bot = config.bot_token.as_deref().map(Bot::new);
        let notifier: Arc<dyn Notifier> = match &bot {
            Some(bot) => Arc::new(TelegramNotifier::new(bot.clone(), webapp_keyboard(&config))),
            None => Arc::new(NoopNotifier),
        };

        let reconciler = Arc::new(BillingReconciler::new(
            pricing.clone(),
            backend,
            notifier.clone(),
            clock.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            Arc::new(UserRepository::new(pool.clone())),
            reconciler,
        ));
        let accounts = Arc::new(AccountService::new(
            pool.clone(),
            subscriptions.clone(),
            notifier.clone(),
        ));
        let biller = Arc::new(PeriodicBiller::new(
            subscriptions.clone(),
            settings_repo,
            clock.clone(),
            config.sweep_check_interval(),
        ));
        let admin = Arc::new(AdminAuthService::new(
            settings.clone(),
            config.admin_secret.clone(),
            clock,
        ));

        Ok(Self {
            config,
            pool,
            bot,
            settings,
            pricing,
            provisioning,
            notifier,
            subscriptions,
            accounts,
            biller,
            admin,
        })
    }

    /// WireGuard links are served by the panel itself, so a fresh install
    /// gets one pool on the panel domain instead of refusing every user.
    pub async fn ensure_wireguard_pool(&self) -> Result<()> {
        if self.config.provisioning_backend != BackendKind::Wireguard {
            return Ok(());
        }
        if !self.provisioning.pools(BackendKind::Wireguard).await?.is_empty() {
            return Ok(());
        }
        let pool = self
            .provisioning
            .create_pool(&NewPool {
                backend: BackendKind::Wireguard,
                name: "default".to_string(),
                api_url: format!("https://{}", self.config.domain),
                api_token: String::new(),
                squad_uuid: None,
                capacity: DEFAULT_WIREGUARD_CAPACITY,
                position: 0,
            })
            .await?;
        info!("Created default WireGuard pool {} at {}", pool.id, pool.api_url);
        Ok(())
    }
}
