use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub fingerprint: String,
    pub label: String,
    pub last_seen: DateTime<Utc>,
}
