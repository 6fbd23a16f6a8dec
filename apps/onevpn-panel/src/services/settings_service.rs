use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use onevpn_db::store::SettingsStore;
use tokio::sync::RwLock;
use tracing::debug;

/// Read-through cache over the `app_settings` table. Entries expire so
/// values written by another process (the CLI) are picked up.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    cache: Arc<RwLock<HashMap<String, (String, Instant)>>>,
    ttl: Duration,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[async_trait]
impl SettingsStore for SettingsService {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let cache = self.cache.read().await;
            if let Some((value, stored_at)) = cache.get(key) {
                if stored_at.elapsed() < self.ttl {
                    return Ok(Some(value.clone()));
                }
            }
        }

        let value = self.store.get(key).await?;
        let mut cache = self.cache.write().await;
        match &value {
            Some(v) => {
                cache.insert(key.to_string(), (v.clone(), Instant::now()));
            }
            None => {
                cache.remove(key);
            }
        }
        debug!("Setting {} loaded from store", key);
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(key, value).await?;
        let mut cache = self.cache.write().await;
        cache.insert(key.to_string(), (value.to_string(), Instant::now()));
        Ok(())
    }
}
