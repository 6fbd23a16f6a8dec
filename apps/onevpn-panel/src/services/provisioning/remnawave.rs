use async_trait::async_trait;
use chrono::SecondsFormat;
use onevpn_db::models::provisioning::{BackendKind, ProvisioningPool};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{PanelApi, ProvisioningError, RemoteAccount, check_status};

/// Remnawave REST API. Accounts are addressed by uuid; every pool is one
/// internal squad.
pub struct RemnawaveApi {
    client: reqwest::Client,
}

impl RemnawaveApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(pool: &ProvisioningPool, path: &str) -> String {
        format!("{}{}", pool.api_url.trim_end_matches('/'), path)
    }

    async fn send(&self, req: reqwest::RequestBuilder, pool: &ProvisioningPool) -> Result<Value, ProvisioningError> {
        let resp = req.bearer_auth(&pool.api_token).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn find_by_username(
        &self,
        pool: &ProvisioningPool,
        username: &str,
    ) -> Result<Value, ProvisioningError> {
        let url = Self::endpoint(
            pool,
            &format!("/api/users/by-username/{}", urlencoding::encode(username)),
        );
        self.send(self.client.get(url), pool).await
    }
}

fn expire_at(account: &RemoteAccount) -> String {
    account.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn remote_uuid(payload: &Value) -> Option<&str> {
    payload
        .get("response")
        .unwrap_or(payload)
        .get("uuid")
        .and_then(Value::as_str)
}

#[async_trait]
impl PanelApi for RemnawaveApi {
    fn kind(&self) -> BackendKind {
        BackendKind::Remnawave
    }

    async fn create(
        &self,
        pool: &ProvisioningPool,
        account: &RemoteAccount,
    ) -> Result<Value, ProvisioningError> {
        let squad = pool.squad_uuid.as_deref().ok_or(ProvisioningError::NotConfigured)?;
        let body = json!({
            "username": account.username,
            "status": "ACTIVE",
            "expireAt": expire_at(account),
            "hwidDeviceLimit": account.device_limit,
            "activeInternalSquads": [squad],
        });
        let req = self.client.post(Self::endpoint(pool, "/api/users")).json(&body);

        match self.send(req, pool).await {
            Ok(value) => {
                info!("Created Remnawave user {} in squad {}", account.username, squad);
                Ok(value)
            }
            Err(ProvisioningError::Status(400 | 409, _)) => {
                debug!("Remnawave user {} may already exist, looking it up", account.username);
                let existing = self.find_by_username(pool, &account.username).await?;
                let uuid = remote_uuid(&existing)
                    .ok_or_else(|| ProvisioningError::MalformedResponse("user without uuid".into()))?
                    .to_string();
                self.update(pool, &uuid, account).await
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
        let body = json!({
            "uuid": remote_id,
            "expireAt": expire_at(account),
            "hwidDeviceLimit": account.device_limit,
        });
        let req = self.client.patch(Self::endpoint(pool, "/api/users")).json(&body);
        self.send(req, pool).await
    }

    async fn set_enabled(
        &self,
        pool: &ProvisioningPool,
        remote_id: &str,
        enabled: bool,
    ) -> Result<(), ProvisioningError> {
        let action = if enabled { "enable" } else { "disable" };
        let url = Self::endpoint(
            pool,
            &format!("/api/users/{}/actions/{}", urlencoding::encode(remote_id), action),
        );
        match self.send(self.client.post(url), pool).await {
            Ok(_) => Ok(()),
            // Enabling an enabled user (or the reverse) is rejected as a bad request.
            Err(ProvisioningError::Status(400, _)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provisioning::normalize_account;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    fn account() -> RemoteAccount {
        RemoteAccount {
            username: "tg_1".into(),
            link_slug: "s".into(),
            device_limit: 3,
            expires_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn pool_at(url: &str) -> ProvisioningPool {
        let mut pool = crate::testing::pool(1, BackendKind::Remnawave, 10);
        pool.api_url = url.to_string();
        pool
    }

    #[tokio::test]
    async fn existing_username_is_looked_up_and_patched() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/api/users")
            .match_body(Matcher::PartialJson(json!({"activeInternalSquads": ["squad-1"]})))
            .with_status(400)
            .with_body(r#"{"message":"User username already exists"}"#)
            .create_async()
            .await;
        let lookup = server
            .mock("GET", "/api/users/by-username/tg_1")
            .match_header("authorization", "Bearer token")
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":{"uuid":"u-1","username":"tg_1"}}"#)
            .create_async()
            .await;
        let patch = server
            .mock("PATCH", "/api/users")
            .match_body(Matcher::PartialJson(json!({
                "uuid": "u-1",
                "hwidDeviceLimit": 3,
                "expireAt": "2026-03-01T12:00:00.000Z",
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"response":{"uuid":"u-1","subscriptionUrl":"https://sub.example.com/abc"}}"#)
            .create_async()
            .await;

        let pool = pool_at(&server.url());
        let api = RemnawaveApi::new(crate::testing::http_client());
        let value = api.create(&pool, &account()).await.unwrap();

        let provisioned = normalize_account(&value, &pool.api_url).unwrap();
        assert_eq!(provisioned.remote_id, "u-1");
        assert_eq!(provisioned.link, "https://sub.example.com/abc");
        create.assert_async().await;
        lookup.assert_async().await;
        patch.assert_async().await;
    }

    #[tokio::test]
    async fn redundant_toggle_is_accepted() {
        let mut server = mockito::Server::new_async().await;
        let disable = server
            .mock("POST", "/api/users/u-1/actions/disable")
            .with_status(400)
            .with_body(r#"{"message":"User already disabled"}"#)
            .create_async()
            .await;

        let api = RemnawaveApi::new(crate::testing::http_client());
        api.set_enabled(&pool_at(&server.url()), "u-1", false).await.unwrap();
        disable.assert_async().await;
    }

    #[tokio::test]
    async fn toggle_server_error_is_returned() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/users/u-1/actions/enable")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let api = RemnawaveApi::new(crate::testing::http_client());
        let err = api.set_enabled(&pool_at(&server.url()), "u-1", true).await.unwrap_err();
        assert_eq!(err, ProvisioningError::Status(503, "down".into()));
    }

    #[test]
    fn expiry_is_rfc3339_utc() {
        assert_eq!(expire_at(&account()), "2026-03-01T12:00:00.000Z");
    }

    #[test]
    fn uuid_is_read_inside_envelope() {
        assert_eq!(remote_uuid(&json!({"response": {"uuid": "u-1"}})), Some("u-1"));
        assert_eq!(remote_uuid(&json!({"uuid": "u-2"})), Some("u-2"));
        assert_eq!(remote_uuid(&json!({"response": {}})), None);
    }
}
