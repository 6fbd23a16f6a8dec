use async_trait::async_trait;
use onevpn_db::models::provisioning::{BackendKind, ProvisioningPool};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{PanelApi, ProvisioningError, RemoteAccount, check_status};

/// Marzban REST API. Accounts are addressed by username.
pub struct MarzbanApi {
    client: reqwest::Client,
}

impl MarzbanApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(pool: &ProvisioningPool, path: &str) -> String {
        format!("{}{}", pool.api_url.trim_end_matches('/'), path)
    }

    async fn modify(
        &self,
        pool: &ProvisioningPool,
        username: &str,
        body: &Value,
    ) -> Result<Value, ProvisioningError> {
        let url = Self::endpoint(pool, &format!("/api/user/{}", urlencoding::encode(username)));
        let resp = self
            .client
            .put(url)
            .bearer_auth(&pool.api_token)
            .json(body)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

fn modify_body(account: &RemoteAccount) -> Value {
    json!({
        "expire": account.expires_at.timestamp(),
        "note": format!("devices:{}", account.device_limit),
    })
}

#[async_trait]
impl PanelApi for MarzbanApi {
    fn kind(&self) -> BackendKind {
        BackendKind::Marzban
    }

    async fn create(
        &self,
        pool: &ProvisioningPool,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        let body = json!({
            "username": account.username,
            "proxies": { "vless": {} },
            "inbounds": {},
            "expire": account.expires_at.timestamp(),
            "data_limit": 0,
            "status": "active",
            "note": format!("devices:{}", account.device_limit),
        });
        let resp = self
            .client
            .post(Self::endpoint(pool, "/api/user"))
            .bearer_auth(&pool.api_token)
            .json(&body)
            .send()
            .await?;

        match check_status(resp).await {
            Ok(resp) => {
                info!("Created Marzban user {} on {}", account.username, pool.name);
                Ok(resp.json().await?)
            }
            // Left over from an earlier run whose binding was never saved.
            Err(ProvisioningError::Status(409, _)) => {
                debug!("Marzban user {} already exists, updating", account.username);
                self.modify(pool, &account.username, &modify_body(account)).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        pool: &ProvisioningPool,
        remote_id: &str,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        self.modify(pool, remote_id, &modify_body(account)).await
    }

    async fn set_enabled(
        &self,
        pool: &ProvisioningPool,
        remote_id: &str,
        enabled: bool,
    ) -> Result<(), ProvisioningError> {
        let status = if enabled { "active" } else { "disabled" };
        self.modify(pool, remote_id, &json!({ "status": status })).await?;
        Ok(())
    }
}
