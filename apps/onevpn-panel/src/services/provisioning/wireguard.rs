use async_trait::async_trait;
use onevpn_db::models::provisioning::{BackendKind, ProvisioningPool};
use serde_json::{Value, json};

use super::{PanelApi, ProvisioningError, RemoteAccount};
use crate::utils::make_wireguard_link;

/// Links served by the panel itself: the remote id is the user's slug and
/// there is nothing to call.
pub struct WireguardLinks {
    domain: String,
}

impl WireguardLinks {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    fn account(&self, slug: &str) -> Value {
        json!({
            "id": slug,
            "link": make_wireguard_link(&self.domain, slug),
        })
    }
}

#[async_trait]
impl PanelApi for WireguardLinks {
    fn kind(&self) -> BackendKind {
        BackendKind::Wireguard
    }

    async fn create(
        &self,
        _pool: &ProvisioningPool,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        Ok(self.account(&account.link_slug))
    }

    async fn update(
        &self,
        _pool: &ProvisioningPool,
        remote_id: &str,
        _account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        Ok(self.account(remote_id))
    }

    // Access is checked against the user row when the link is opened.
    async fn set_enabled(
        &self,
        _pool: &ProvisioningPool,
        _remote_id: &str,
        _enabled: bool,
    ) -> Result<(), ProvisioningError> {
        Ok(())
    }
}
