use std::sync::Arc;

use anyhow::{Context, Result};
use onevpn_db::store::SettingsStore;
use tracing::warn;

pub const PRICE_PER_DAY_KEY: &str = "price_per_day";

/// Price of one device for one day, overridable from the admin panel.
#[derive(Clone)]
pub struct PricingStore {
    settings: Arc<dyn SettingsStore>,
    default_price: f64,
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p >= 0.0)
}

impl PricingStore {
    pub fn new(settings: Arc<dyn SettingsStore>, default_price: f64) -> Self {
        Self {
            settings,
            default_price,
        }
    }

    pub async fn get_price(&self) -> f64 {
        match self.settings.get(PRICE_PER_DAY_KEY).await {
            Ok(Some(raw)) => match parse_price(&raw) {
                Some(price) => price,
                None => {
                    warn!(
                        "Stored {} {:?} is not a valid price, using default {}",
                        PRICE_PER_DAY_KEY, raw, self.default_price
                    );
                    self.default_price
                }
            },
            Ok(None) => self.default_price,
            Err(e) => {
                warn!("Failed to read {}: {:#}, using default", PRICE_PER_DAY_KEY, e);
                self.default_price
            }
        }
    }

    pub async fn set_price(&self, raw: &str) -> Result<f64> {
        let price = parse_price(raw)
            .ok_or_else(|| anyhow::anyhow!("Price must be a non-negative number, got {:?}", raw))?;
        self.settings
            .set(PRICE_PER_DAY_KEY, &price.to_string())
            .await
            .context("Failed to store price override")?;
        Ok(price)
    }
}
