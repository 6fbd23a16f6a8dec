use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq)]
pub enum InitDataError {
    #[error("initData has no hash")]
    MissingHash,
    #[error("initData hash is not valid hex")]
    MalformedHash,
    #[error("initData signature mismatch")]
    BadSignature,
    #[error("initData has no valid user")]
    MissingUser,
}

/// The `user` object of Telegram WebApp initData.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TelegramIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl TelegramIdentity {
    pub fn telegram_id(&self) -> String {
        self.id.to_string()
    }
}

fn mac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length; the error branch is unreachable.
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    }
}

/// `secret = HMAC("WebAppData", bot_token)`, then HMAC(secret, data-check-string).
fn init_data_mac(pairs: &BTreeMap<String, String>, bot_token: &str) -> HmacSha256 {
    let check_string = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    let secret = mac(b"WebAppData")
        .chain_update(bot_token.as_bytes())
        .finalize()
        .into_bytes();
    mac(&secret).chain_update(check_string.as_bytes())
}

/// Checks the Telegram WebApp signature and returns the signed-in user.
pub fn validate_init_data(init_data: &str, bot_token: &str) -> Result<TelegramIdentity, InitDataError> {
    let mut pairs: BTreeMap<String, String> = url::form_urlencoded::parse(init_data.as_bytes())
        .into_owned()
        .collect();
    let hash = pairs.remove("hash").ok_or(InitDataError::MissingHash)?;
    let expected = hex::decode(hash.trim()).map_err(|_| InitDataError::MalformedHash)?;

    init_data_mac(&pairs, bot_token)
        .verify_slice(&expected)
        .map_err(|_| InitDataError::BadSignature)?;

    pairs
        .get("user")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .ok_or(InitDataError::MissingUser)
}

/// Admin UI session token: `<username>.<expiry unix>.<hex hmac>`.
pub fn sign_admin_token(username: &str, expires_at: DateTime<Utc>, secret: &str) -> String {
    let payload = format!("{}.{}", username, expires_at.timestamp());
    let signature = mac(secret.as_bytes())
        .chain_update(payload.as_bytes())
        .finalize()
        .into_bytes();
    format!("{}.{}", payload, hex::encode(signature))
}

/// Username of a valid, unexpired admin token.
pub fn verify_admin_token(token: &str, secret: &str, now: DateTime<Utc>) -> Option<String> {
    let (payload, signature) = token.trim().rsplit_once('.')?;
    let signature = hex::decode(signature).ok()?;
    mac(secret.as_bytes())
        .chain_update(payload.as_bytes())
        .verify_slice(&signature)
        .ok()?;

    let (username, expires) = payload.rsplit_once('.')?;
    let expires: i64 = expires.parse().ok()?;
    (now.timestamp() < expires && !username.is_empty()).then(|| username.to_string())
}

/// Public link for a slug on the panel's own domain. Full URLs pass through.
pub fn make_wireguard_link(domain: &str, slug: &str) -> String {
    if slug.starts_with("http://") || slug.starts_with("https://") {
        return slug.to_string();
    }
    format!("https://{}/{}#1VPN", domain, slug)
}
