use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use onevpn_db::store::SettingsStore;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::utils::{sign_admin_token, verify_admin_token};

pub const ADMIN_UI_USERNAME_KEY: &str = "admin_ui_username";
pub const ADMIN_UI_PASSWORD_KEY: &str = "admin_ui_password_hash";

/// Lifetime of an admin UI login.
pub const ADMIN_TOKEN_TTL_HOURS: i64 = 12;

/// Admin access: the shared `ADMIN_SECRET`, or a token issued by a password
/// login of the admin web UI. Credentials live in `app_settings`, the
/// password as a bcrypt hash.
pub struct AdminAuthService {
    settings: Arc<dyn SettingsStore>,
    secret: String,
    clock: Arc<dyn Clock>,
    cost: u32,
}

impl AdminAuthService {
    pub fn new(settings: Arc<dyn SettingsStore>, secret: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            secret,
            clock,
            cost: bcrypt::DEFAULT_COST,
        }
    }

    #[cfg(test)]
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Nothing is accepted while no secret is configured.
    pub fn authorizes(&self, token: &str) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        token == self.secret || verify_admin_token(token, &self.secret, self.clock.now()).is_some()
    }

    /// Issues a token for matching credentials; `None` otherwise, including
    /// before any credentials were set.
    pub async fn login(&self, username: &str, password: &str) -> Result<Option<String>> {
        if self.secret.is_empty() {
            return Ok(None);
        }
        let stored_user = self.settings.get(ADMIN_UI_USERNAME_KEY).await?;
        let stored_hash = self.settings.get(ADMIN_UI_PASSWORD_KEY).await?;
        let (Some(stored_user), Some(stored_hash)) = (stored_user, stored_hash) else {
            warn!("Admin UI login attempted before credentials were set");
            return Ok(None);
        };

        let valid = stored_user == username.trim() && bcrypt::verify(password, &stored_hash).unwrap_or(false);
        if !valid {
            warn!("Rejected admin UI login for {:?}", username);
            return Ok(None);
        }

        info!("Admin UI login for {}", stored_user);
        let expires_at = self.clock.now() + Duration::hours(ADMIN_TOKEN_TTL_HOURS);
        Ok(Some(sign_admin_token(&stored_user, expires_at, &self.secret)))
    }

    pub async fn set_credentials(&self, username: &str, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, self.cost).context("Failed to hash admin password")?;
        self.settings.set(ADMIN_UI_USERNAME_KEY, username.trim()).await?;
        self.settings.set(ADMIN_UI_PASSWORD_KEY, &hash).await?;
        info!("Admin UI credentials updated for {}", username.trim());
        Ok(())
    }
}
