use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use onevpn_db::models::provisioning::BackendKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub database_url: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub webapp_url: String,
    pub admin_secret: String,
    #[serde(default)]
    pub admin_tg_id: Option<String>,
    #[serde(default = "default_support_username")]
    pub support_username: String,
    #[serde(default = "default_ios_help_url")]
    pub ios_help_url: String,
    #[serde(default = "default_android_help_url")]
    pub android_help_url: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Fallback when no `price_per_day` override is stored.
    #[serde(default = "default_price_per_day")]
    pub price_per_day: f64,
    #[serde(default = "default_backend")]
    pub provisioning_backend: BackendKind,
    #[serde(default = "default_provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,
    #[serde(default = "default_sweep_check_interval_secs")]
    pub sweep_check_interval_secs: u64,
    #[serde(default = "default_min_topup")]
    pub min_topup: i64,
    #[serde(default)]
    pub required_channel: Option<String>,
    #[serde(default)]
    pub policy_url: Option<String>,
    /// When set, payment webhooks must carry `?token=<secret>`.
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,
    /// Mini-app and admin UI files: `index.html`, `admin.html` and assets.
    #[serde(default = "default_webapp_dir")]
    pub webapp_dir: String,
}

fn default_support_username() -> String {
    "support".to_string()
}

fn default_ios_help_url() -> String {
    "https://telegra.ph/ios-vpn-install".to_string()
}

fn default_android_help_url() -> String {
    "https://telegra.ph/android-vpn-install".to_string()
}

fn default_domain() -> String {
    "the1priority.ru".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_price_per_day() -> f64 {
    10.0
}

fn default_backend() -> BackendKind {
    BackendKind::Wireguard
}

fn default_provisioning_timeout_secs() -> u64 {
    15
}

fn default_sweep_check_interval_secs() -> u64 {
    600
}

fn default_min_topup() -> i64 {
    50
}

fn default_webapp_dir() -> String {
    "webapp".to_string()
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}

impl PanelConfig {
    pub fn load() -> Result<Self> {
        let config_paths = ["/etc/onevpn/panel.toml", "./panel.toml"];

        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml_str(&contents)
                    .with_context(|| format!("Failed to parse {}", path));
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bot_token: env_opt("BOT_TOKEN"),
            webapp_url: env_opt("WEBAPP_URL").unwrap_or_default(),
            admin_secret: std::env::var("ADMIN_SECRET").context("ADMIN_SECRET must be set")?,
            admin_tg_id: env_opt("ADMIN_TG_ID"),
            support_username: env_opt("SUPPORT_USERNAME").unwrap_or_else(default_support_username),
            ios_help_url: env_opt("IOS_HELP_URL").unwrap_or_else(default_ios_help_url),
            android_help_url: env_opt("ANDROID_HELP_URL").unwrap_or_else(default_android_help_url),
            domain: env_opt("DOMAIN").unwrap_or_else(default_domain),
            listen_addr: env_opt("LISTEN_ADDR").unwrap_or_else(default_listen_addr),
            price_per_day: env_parse("PRICE_PER_DAY", default_price_per_day())?,
            provisioning_backend: env_parse("PROVISIONING_BACKEND", default_backend())?,
            provisioning_timeout_secs: env_parse(
                "PROVISIONING_TIMEOUT_SECS",
                default_provisioning_timeout_secs(),
            )?,
            sweep_check_interval_secs: env_parse(
                "SWEEP_CHECK_INTERVAL_SECS",
                default_sweep_check_interval_secs(),
            )?,
            min_topup: env_parse("MIN_TOPUP", default_min_topup())?,
            required_channel: env_opt("REQUIRED_CHANNEL"),
            policy_url: env_opt("POLICY_URL"),
            payment_webhook_secret: env_opt("PAYMENT_WEBHOOK_SECRET"),
            webapp_dir: env_opt("WEBAPP_DIR").unwrap_or_else(default_webapp_dir),
        })
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs.max(1))
    }

    pub fn sweep_check_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_check_interval_secs.max(1))
    }

    /// Mini-app URL used in bot keyboards and payment return links.
    pub fn webapp_base(&self) -> String {
        let base = self.webapp_url.trim();
        if base.is_empty() {
            format!("https://{}", self.domain)
        } else {
            base.trim_end_matches('/').to_string()
        }
    }

    pub fn support_url(&self) -> String {
        format!("https://t.me/{}", self.support_username.trim_start_matches('@'))
    }

    pub fn is_admin(&self, telegram_id: &str) -> bool {
        self.admin_tg_id.as_deref().is_some_and(|id| id == telegram_id)
    }
}
