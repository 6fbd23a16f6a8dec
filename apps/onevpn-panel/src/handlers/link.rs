use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use onevpn_db::models::user::User;
use onevpn_db::store::BindingStore;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::utils::make_wireguard_link;

/// Expiry of a link that may be served right now.
fn active_until(user: &User, now: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
    match user.subscription_end {
        Some(end) if user.has_active_subscription(now) => Ok(end),
        _ if user.banned || user.link_suspended => Err(ApiError::Forbidden("Link is blocked".into())),
        _ => Err(ApiError::Forbidden("Subscription is not active".into())),
    }
}

/// Profile behind a public `/l/{slug}` link. Only served while the owner's
/// subscription is active.
pub async fn wireguard_profile(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = state
        .accounts
        .users
        .get_by_slug(&slug)
        .await?
        .ok_or_else(|| ApiError::NotFound("Not found".into()))?;

    let expires_at = active_until(&user, Utc::now())?;

    let binding = state
        .provisioning
        .find_binding(user.id, state.config.provisioning_backend)
        .await?;
    let server_endpoint = match &binding {
        Some(b) => state.provisioning.get_pool(b.pool_id).await?.map(|p| p.api_url),
        None => None,
    };
    let link = binding
        .map(|b| b.link)
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| make_wireguard_link(&state.config.domain, &user.link_slug));

    Ok(Json(json!({
        "link": link,
        "server_endpoint": server_endpoint,
        "expires_at": expires_at,
        "devices_allowed": user.allowed_devices,
        "notice": "Import this link into a WireGuard-compatible VPN client.",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_active_links_are_served() {
        let now = crate::testing::epoch();
        let mut user = crate::testing::user(1, 100);
        user.subscription_end = Some(now + Duration::days(2));
        assert_eq!(active_until(&user, now).unwrap(), now + Duration::days(2));

        user.link_suspended = true;
        let err = active_until(&user, now).unwrap_err();
        assert_eq!(err.to_string(), "Link is blocked");

        user.link_suspended = false;
        user.subscription_end = Some(now - Duration::seconds(1));
        let err = active_until(&user, now).unwrap_err();
        assert_eq!(err.to_string(), "Subscription is not active");
    }
}
