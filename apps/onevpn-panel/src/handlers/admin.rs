use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use onevpn_db::models::provisioning::{BackendKind, NewPool, ProvisioningPool};
use onevpn_db::models::user::User;
use onevpn_db::store::BindingStore;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::AdminAuth;
use crate::error::{ApiError, ApiResult};
use crate::services::daily_billing_service::SweepReport;
use crate::services::notification_service::Notice;
use crate::services::subscription_service::Reconciled;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UserSelector {
    pub telegram_id: Option<String>,
    pub username: Option<String>,
}

async fn find_user(state: &AppState, who: &UserSelector) -> ApiResult<User> {
    let users = &state.accounts.users;
    let found = match (who.telegram_id.as_deref(), who.username.as_deref()) {
        (Some(tg), _) if !tg.trim().is_empty() => users.get_by_telegram_id(tg.trim()).await?,
        (_, Some(name)) if !name.trim().is_empty() => {
            users.get_by_username(name.trim().trim_start_matches('@')).await?
        }
        _ => return Err(ApiError::BadRequest("telegram_id or username required".into())),
    };
    found.ok_or_else(|| ApiError::NotFound("User not found".into()))
}

fn summary(reconciled: &Reconciled) -> Value {
    json!({
        "ok": true,
        "balance": reconciled.user.balance,
        "banned": reconciled.user.banned,
        "subscription_end": reconciled.user.subscription_end,
        "link_suspended": reconciled.outcome.link_suspended,
        "estimated_days": reconciled.outcome.estimated_days,
    })
}

#[derive(Deserialize)]
pub struct BalanceRequest {
    #[serde(flatten)]
    pub who: UserSelector,
    pub amount: i64,
}

pub async fn topup(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<BalanceRequest>,
) -> ApiResult<Json<Value>> {
    let user = find_user(&state, &req.who).await?;
    let reconciled = state.accounts.adjust_balance(user.id, req.amount).await?;
    Ok(Json(summary(&reconciled)))
}

fn banned_default() -> bool {
    true
}

#[derive(Deserialize)]
pub struct BanRequest {
    #[serde(flatten)]
    pub who: UserSelector,
    #[serde(default = "banned_default")]
    pub banned: bool,
}

pub async fn ban(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<BanRequest>,
) -> ApiResult<Json<Value>> {
    let user = find_user(&state, &req.who).await?;
    let reconciled = state.accounts.set_banned(user.id, req.banned).await?;
    Ok(Json(summary(&reconciled)))
}

pub async fn reconcile(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(who): Json<UserSelector>,
) -> ApiResult<Json<Value>> {
    let user = find_user(&state, &who).await?;
    let reconciled = state
        .subscriptions
        .recalc_subscription(user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
    Ok(Json(summary(&reconciled)))
}

/// Drops the settings cache first so a price set from the CLI shows up at once.
pub async fn get_price(_: AdminAuth, State(state): State<AppState>) -> Json<Value> {
    state.settings.invalidate().await;
    Json(json!({ "price_per_day": state.pricing.get_price().await }))
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
pub struct PriceRequest {
    pub price_per_day: RawPrice,
}

pub async fn set_price(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<PriceRequest>,
) -> ApiResult<Json<Value>> {
    let raw = match req.price_per_day {
        RawPrice::Number(n) => n.to_string(),
        RawPrice::Text(s) => s,
    };
    let price = state
        .pricing
        .set_price(&raw)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    info!("Price per day set to {}", price);
    Ok(Json(json!({ "ok": true, "price_per_day": price })))
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

pub async fn broadcast(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> ApiResult<Json<Value>> {
    if state.bot.is_none() {
        return Err(ApiError::ServiceUnavailable("Bot is not configured".into()));
    }
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Message is empty".into()));
    }

    let users = state.accounts.users.get_all().await?;
    let mut sent = 0;
    for user in users.iter().filter(|u| !u.banned) {
        state
            .notifier
            .notify(&user.telegram_id, Notice::Broadcast(message.to_string()))
            .await;
        sent += 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("Broadcast delivered to {} users", sent);
    Ok(Json(json!({ "sent": sent })))
}

#[derive(Deserialize)]
pub struct PoolQuery {
    pub backend: Option<BackendKind>,
}

pub async fn list_pools(
    _: AdminAuth,
    State(state): State<AppState>,
    Query(query): Query<PoolQuery>,
) -> ApiResult<Json<Vec<ProvisioningPool>>> {
    let backend = query.backend.unwrap_or(state.config.provisioning_backend);
    Ok(Json(state.provisioning.pools(backend).await?))
}

fn validate_pool(pool: &NewPool) -> Result<(), String> {
    if pool.name.trim().is_empty() {
        return Err("Pool name is required".into());
    }
    if pool.capacity < 0 {
        return Err("Capacity must not be negative".into());
    }
    if pool.backend != BackendKind::Wireguard && url::Url::parse(&pool.api_url).is_err() {
        return Err(format!("Invalid api_url {:?}", pool.api_url));
    }
    if pool.backend == BackendKind::Remnawave && pool.squad_uuid.as_deref().is_none_or(str::is_empty) {
        return Err("Remnawave pools need squad_uuid".into());
    }
    Ok(())
}

pub async fn create_pool(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<NewPool>,
) -> ApiResult<Json<ProvisioningPool>> {
    validate_pool(&req).map_err(ApiError::BadRequest)?;
    let pool = state.provisioning.create_pool(&req).await?;
    info!("Added {} pool {} (capacity {})", pool.backend, pool.name, pool.capacity);
    Ok(Json(pool))
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

const MIN_PASSWORD_LEN: usize = 8;

fn validate_credentials(creds: &Credentials) -> Result<(), String> {
    let username = creds.username.trim();
    if username.is_empty() || username.len() > 64 {
        return Err("Username must be 1 to 64 characters".into());
    }
    if creds.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!("Password must be at least {} characters", MIN_PASSWORD_LEN));
    }
    Ok(())
}

/// Exchanges admin UI credentials for a session token.
pub async fn ui_login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> ApiResult<Json<Value>> {
    match state.admin.login(&req.username, &req.password).await? {
        Some(token) => Ok(Json(json!({ "token": token }))),
        None => Err(ApiError::Unauthorized("Invalid credentials".into())),
    }
}

pub async fn ui_credentials(
    _: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> ApiResult<Json<Value>> {
    validate_credentials(&req).map_err(ApiError::BadRequest)?;
    state.admin.set_credentials(&req.username, &req.password).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn sweep(_: AdminAuth, State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.biller.run_daily_sweep_once().await?))
}
