//! Provisioning of VPN accounts on the configured backend.
//!
//! The reconciler only sees [`ProvisioningBackend`]. [`Provisioner`] implements
//! it on top of a backend-specific [`PanelApi`] adapter and the stored
//! bindings: it places new users on the first pool with spare capacity and
//! updates existing remote accounts in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onevpn_db::models::provisioning::{BackendKind, Binding, NewBinding, ProvisioningPool};
use onevpn_db::models::user::User;
use onevpn_db::store::BindingStore;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;

pub mod marzban;
pub mod remnawave;
pub mod wireguard;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisioningError {
    #[error("provisioning backend is not configured")]
    NotConfigured,
    #[error("no provisioning pool has free capacity")]
    NoCapacity,
    #[error("provisioning backend timed out")]
    Timeout,
    #[error("provisioning backend returned {0}: {1}")]
    Status(u16, String),
    #[error("provisioning transport error: {0}")]
    Transport(String),
    #[error("malformed provisioning response: {0}")]
    MalformedResponse(String),
    #[error("binding store error: {0}")]
    Store(String),
}

impl ProvisioningError {
    /// Errors an operator has to fix; retrying will not help.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ProvisioningError::NotConfigured | ProvisioningError::NoCapacity)
    }

    fn store(err: anyhow::Error) -> Self {
        ProvisioningError::Store(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for ProvisioningError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProvisioningError::Timeout
        } else if let Some(status) = err.status() {
            ProvisioningError::Status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ProvisioningError::MalformedResponse(err.to_string())
        } else {
            ProvisioningError::Transport(err.to_string())
        }
    }
}

/// Who is being provisioned.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionTarget {
    pub user_id: i64,
    pub telegram_id: String,
    pub username: Option<String>,
    pub link_slug: String,
}

impl From<&User> for ProvisionTarget {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            telegram_id: user.telegram_id.clone(),
            username: user.username.clone(),
            link_slug: user.link_slug.clone(),
        }
    }
}

impl ProvisionTarget {
    /// Account name on remote panels: stable and restricted to `[a-z0-9_]`.
    pub fn remote_username(&self) -> String {
        let id: String = self
            .telegram_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("tg_{}", id.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedAccount {
    pub link: String,
    pub remote_id: String,
}

/// Contract the reconciler drives.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Creates the remote account or updates the existing one in place.
    async fn upsert(
        &self,
        target: &ProvisionTarget,
        device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<ProvisionedAccount, ProvisioningError>;

    /// Like [`upsert`](Self::upsert) but never creates: `Ok(None)` when the
    /// user has no remote account yet.
    async fn update_existing(
        &self,
        target: &ProvisionTarget,
        device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProvisionedAccount>, ProvisioningError>;

    /// No-op for users without a remote account.
    async fn enable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError>;

    /// No-op for users without a remote account.
    async fn disable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError>;
}

/// Desired remote account state.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAccount {
    pub username: String,
    pub link_slug: String,
    pub device_limit: i32,
    pub expires_at: DateTime<Utc>,
}

/// One backend's wire protocol. Responses are returned raw and normalised by
/// [`normalize_account`].
#[async_trait]
pub trait PanelApi: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn create(
        &self,
        pool: &ProvisioningPool,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError>;

    async fn update(
        &self,
        pool: &ProvisioningPool,
        remote_id: &str,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError>;

    async fn set_enabled(
        &self,
        pool: &ProvisioningPool,
        remote_id: &str,
        enabled: bool,
    ) -> Result<(), ProvisioningError>;
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ProvisioningError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ProvisioningError::Transport(e.to_string()))
}

/// Maps non-2xx responses to [`ProvisioningError::Status`], keeping a short
/// slice of the body for the log.
pub(crate) async fn check_status(
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProvisioningError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    Err(ProvisioningError::Status(status.as_u16(), body))
}

fn first_str<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| v.as_str().filter(|s| !s.trim().is_empty()))
}

/// Pulls `(link, remote_id)` out of whatever shape the backend answered with.
pub fn normalize_account(
    payload: &Value,
    api_url: &str,
) -> Result<ProvisionedAccount, ProvisioningError> {
    let obj = match payload.get("response") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };

    let link = first_str(obj, &["subscription_url", "subscriptionUrl", "sub_url", "link"])
        .ok_or_else(|| ProvisioningError::MalformedResponse("missing subscription link".into()))?;
    let remote_id = match first_str(obj, &["uuid", "username", "id"]) {
        Some(id) => id.to_string(),
        None => obj
            .get("id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| ProvisioningError::MalformedResponse("missing account id".into()))?,
    };

    Ok(ProvisionedAccount {
        link: absolutize_link(link, api_url),
        remote_id,
    })
}

/// Relative links (Marzban returns `/sub/<token>`) are resolved against the
/// pool's API origin.
fn absolutize_link(link: &str, api_url: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    match url::Url::parse(api_url).and_then(|base| base.join(link)) {
        Ok(joined) => joined.to_string(),
        Err(_) => link.to_string(),
    }
}

/// [`ProvisioningBackend`] over a [`PanelApi`] and the stored bindings.
pub struct Provisioner {
    api: Arc<dyn PanelApi>,
    bindings: Arc<dyn BindingStore>,
    clock: Arc<dyn Clock>,
}

impl Provisioner {
    pub fn new(api: Arc<dyn PanelApi>, bindings: Arc<dyn BindingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { api, bindings, clock }
    }

    /// First pool, in configured order, with room for one more active user.
    pub async fn place(&self, user_id: i64) -> Result<ProvisioningPool, ProvisioningError> {
        let pools = self
            .bindings
            .pools(self.api.kind())
            .await
            .map_err(ProvisioningError::store)?;
        if pools.is_empty() {
            return Err(ProvisioningError::NotConfigured);
        }

        let now = self.clock.now();
        for pool in pools {
            let active = self
                .bindings
                .active_in_pool(pool.id, now, user_id)
                .await
                .map_err(ProvisioningError::store)?;
            if active < i64::from(pool.capacity) {
                debug!("Placing user {} on pool {} ({}/{})", user_id, pool.name, active, pool.capacity);
                return Ok(pool);
            }
        }
        Err(ProvisioningError::NoCapacity)
    }

    async fn binding_with_pool(
        &self,
        user_id: i64,
    ) -> Result<Option<(Binding, ProvisioningPool)>, ProvisioningError> {
        let Some(binding) = self
            .bindings
            .find_binding(user_id, self.api.kind())
            .await
            .map_err(ProvisioningError::store)?
        else {
            return Ok(None);
        };
        let pool = self
            .bindings
            .get_pool(binding.pool_id)
            .await
            .map_err(ProvisioningError::store)?
            .ok_or(ProvisioningError::NotConfigured)?;
        Ok(Some((binding, pool)))
    }

    async fn update_bound(
        &self,
        binding: Binding,
        pool: &ProvisioningPool,
        account: &RemoteAccount,
    ) -> Result<ProvisionedAccount, ProvisioningError> {
        let value = self.api.update(pool, &binding.remote_id, account).await?;
        let link = match normalize_account(&value, &pool.api_url) {
            Ok(fresh) => fresh.link,
            Err(_) if !binding.link.is_empty() => binding.link.clone(),
            Err(e) => return Err(e),
        };
        // The stored id stays authoritative for an existing binding.
        let provisioned = ProvisionedAccount {
            link,
            remote_id: binding.remote_id.clone(),
        };
        self.save(binding.user_id, pool.id, &provisioned, account.expires_at).await?;
        Ok(provisioned)
    }

    async fn save(
        &self,
        user_id: i64,
        pool_id: i64,
        provisioned: &ProvisionedAccount,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        self.bindings
            .save_binding(&NewBinding {
                user_id,
                pool_id,
                backend: self.api.kind(),
                remote_id: provisioned.remote_id.clone(),
                link: provisioned.link.clone(),
                expires_at: Some(expires_at),
            })
            .await
            .map_err(ProvisioningError::store)
    }

    async fn set_enabled(&self, target: &ProvisionTarget, enabled: bool) -> Result<(), ProvisioningError> {
        match self.binding_with_pool(target.user_id).await? {
            Some((binding, pool)) => self.api.set_enabled(&pool, &binding.remote_id, enabled).await,
            None => Ok(()),
        }
    }
}

fn remote_account(target: &ProvisionTarget, device_limit: i32, expires_at: DateTime<Utc>) -> RemoteAccount {
    RemoteAccount {
        username: target.remote_username(),
        link_slug: target.link_slug.clone(),
        device_limit: device_limit.max(1),
        expires_at,
    }
}

#[async_trait]
impl ProvisioningBackend for Provisioner {
    fn kind(&self) -> BackendKind {
        self.api.kind()
    }

    async fn upsert(
        &self,
        target: &ProvisionTarget,
        device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<ProvisionedAccount, ProvisioningError> {
        let account = remote_account(target, device_limit, expires_at);

        if let Some((binding, pool)) = self.binding_with_pool(target.user_id).await? {
            return self.update_bound(binding, &pool, &account).await;
        }

        let pool = self.place(target.user_id).await?;
        let value = self.api.create(&pool, &account).await?;
        let provisioned = normalize_account(&value, &pool.api_url)?;
        self.save(target.user_id, pool.id, &provisioned, expires_at).await?;
        info!(
            "Provisioned user {} on {} pool {} as {}",
            target.user_id,
            self.api.kind(),
            pool.name,
            provisioned.remote_id
        );
        Ok(provisioned)
    }

    async fn update_existing(
        &self,
        target: &ProvisionTarget,
        device_limit: i32,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<ProvisionedAccount>, ProvisioningError> {
        let Some((binding, pool)) = self.binding_with_pool(target.user_id).await? else {
            return Ok(None);
        };
        let account = remote_account(target, device_limit, expires_at);
        self.update_bound(binding, &pool, &account).await.map(Some)
    }

    async fn enable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError> {
        self.set_enabled(target, true).await
    }

    async fn disable(&self, target: &ProvisionTarget) -> Result<(), ProvisioningError> {
        self.set_enabled(target, false).await.inspect_err(|e| {
            warn!("Failed to disable remote account of user {}: {}", target.user_id, e);
        })
    }
}
