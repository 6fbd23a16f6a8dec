use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Self-hosted WireGuard links served from the panel domain.
    Wireguard,
    Marzban,
    Remnawave,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Wireguard => "wireguard",
            BackendKind::Marzban => "marzban",
            BackendKind::Remnawave => "remnawave",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provisioning backend: {0}")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Ok(BackendKind::Wireguard),
            "marzban" => Ok(BackendKind::Marzban),
            "remnawave" | "rem" => Ok(BackendKind::Remnawave),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

/// A placement target on one backend: WireGuard endpoint, Marzban server or
/// Remnawave squad.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProvisioningPool {
    pub id: i64,
    pub backend: String,
    pub name: String,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_token: String,
    pub squad_uuid: Option<String>,
    pub capacity: i32,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Binding {
    pub id: i64,
    pub user_id: i64,
    pub pool_id: i64,
    pub backend: String,
    pub remote_id: String,
    pub link: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBinding {
    pub user_id: i64,
    pub pool_id: i64,
    pub backend: BackendKind,
    pub remote_id: String,
    pub link: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPool {
    pub backend: BackendKind,
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub api_token: String,
    pub squad_uuid: Option<String>,
    #[serde(default = "default_capacity")]
    pub capacity: i32,
    #[serde(default)]
    pub position: i32,
}

fn default_capacity() -> i32 {
    10
}
