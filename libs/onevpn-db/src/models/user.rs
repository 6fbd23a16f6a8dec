use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: String,
    pub username: Option<String>,
    pub balance: i64,
    pub subscription_end: Option<DateTime<Utc>>,
    pub allowed_devices: i32,
    pub link_slug: String,
    pub banned: bool,
    pub link_suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Active means paid up, not banned and not suspended.
    pub fn has_active_subscription(&self, now: DateTime<Utc>) -> bool {
        !self.banned && !self.link_suspended && self.subscription_end.is_some_and(|end| end > now)
    }
}

/// Short url-safe token used as the public link path.
pub fn generate_link_slug() -> String {
    Uuid::new_v4().simple().to_string().chars().take(10).collect()
}
