use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use onevpn_db::models::device::Device;
use onevpn_db::models::user::User;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{INIT_DATA_HEADER, TelegramAuth, authenticate};
use crate::error::{ApiError, ApiResult};
use crate::services::billing_service::daily_cost;
use crate::services::subscription_service::Reconciled;
use crate::state::AppState;
use crate::utils::TelegramIdentity;

const NO_CAPACITY: &str = "No free servers right now. Please contact support.";

async fn current_user(state: &AppState, identity: &TelegramIdentity) -> ApiResult<User> {
    let user = state
        .accounts
        .get_or_create_user(&identity.telegram_id(), identity.username.as_deref())
        .await?;
    if user.banned {
        return Err(ApiError::Forbidden("You are banned".into()));
    }
    Ok(user)
}

async fn reconcile(state: &AppState, user_id: i64) -> ApiResult<Reconciled> {
    state
        .subscriptions
        .recalc_subscription(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))
}

#[derive(Deserialize)]
pub struct InitRequest {
    #[serde(default, rename = "initData")]
    pub init_data: Option<String>,
}

pub async fn init(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitRequest>,
) -> ApiResult<Json<Value>> {
    let init_data = req
        .init_data
        .filter(|d| !d.trim().is_empty())
        .or_else(|| {
            headers
                .get(INIT_DATA_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::BadRequest("initData required".into()))?;

    let identity = authenticate(&state, &init_data)?;
    let user = current_user(&state, &identity).await?;
    let reconciled = reconcile(&state, user.id).await?;
    if reconciled.outcome.provisioning.is_unavailable() {
        return Err(ApiError::ServiceUnavailable(NO_CAPACITY.into()));
    }

    Ok(Json(json!({ "ok": true, "link": reconciled.outcome.link })))
}

#[derive(Serialize)]
pub struct UserState {
    pub balance: i64,
    pub subscription_end: Option<DateTime<Utc>>,
    pub allowed_devices: i32,
    pub estimated_days: i64,
    pub link: String,
    pub devices: Vec<Device>,
    pub banned: bool,
    pub link_suspended: bool,
    pub price_per_day: f64,
    pub daily_cost: f64,
    pub service_available: bool,
    pub ios_help_url: String,
    pub android_help_url: String,
    pub support_url: String,
    pub is_admin: bool,
}

pub async fn state(State(state): State<AppState>, TelegramAuth(identity): TelegramAuth) -> ApiResult<Json<UserState>> {
    let user = current_user(&state, &identity).await?;
    let Reconciled { user, outcome } = reconcile(&state, user.id).await?;
    let devices = state.accounts.devices.list_for_user(user.id).await?;
    let price = state.pricing.get_price().await;

    Ok(Json(UserState {
        balance: user.balance,
        subscription_end: user.subscription_end,
        allowed_devices: outcome.allowed_devices,
        estimated_days: outcome.estimated_days,
        link: outcome.link,
        devices,
        banned: user.banned,
        link_suspended: outcome.link_suspended,
        price_per_day: price,
        daily_cost: daily_cost(price, outcome.allowed_devices),
        service_available: !outcome.provisioning.is_unavailable(),
        ios_help_url: state.config.ios_help_url.clone(),
        android_help_url: state.config.android_help_url.clone(),
        support_url: state.config.support_url(),
        is_admin: state.config.is_admin(&user.telegram_id),
    }))
}

/// Matches the `devices.fingerprint` column width.
const MAX_FINGERPRINT_LEN: usize = 128;
const MAX_LABEL_LEN: usize = 64;

/// Trimmed fingerprint and label, or why the fingerprint is unusable.
fn device_fields(req: &DeviceRequest) -> Result<(&str, String), ApiError> {
    let fingerprint = req.fingerprint.trim();
    if fingerprint.is_empty() || fingerprint.chars().count() > MAX_FINGERPRINT_LEN {
        return Err(ApiError::BadRequest("Invalid device fingerprint".into()));
    }
    let label = req.label.trim().chars().take(MAX_LABEL_LEN).collect();
    Ok((fingerprint, label))
}

fn default_label() -> String {
    "device".to_string()
}

#[derive(Deserialize)]
pub struct DeviceRequest {
    pub fingerprint: String,
    #[serde(default = "default_label")]
    pub label: String,
}

pub async fn register_device(
    State(state): State<AppState>,
    TelegramAuth(identity): TelegramAuth,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Json<Value>> {
    let (fingerprint, label) = device_fields(&req)?;

    let user = current_user(&state, &identity).await?;
    let (device, reconciled) = state
        .accounts
        .register_device(user.id, fingerprint, &label)
        .await?;
    info!("Device {} registered for user {}", device.id, user.id);

    Ok(Json(json!({
        "ok": true,
        "devices": reconciled.outcome.allowed_devices,
        "daily_cost": daily_cost(state.pricing.get_price().await, reconciled.outcome.allowed_devices),
        "estimated_days": reconciled.outcome.estimated_days,
        "link_suspended": reconciled.outcome.link_suspended,
    })))
}

pub async fn delete_device(
    State(state): State<AppState>,
    TelegramAuth(identity): TelegramAuth,
    Path(device_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &identity).await?;
    let (deleted, reconciled) = state.accounts.delete_device(user.id, device_id).await?;
    if !deleted {
        return Err(ApiError::NotFound("Device not found".into()));
    }
    Ok(Json(json!({
        "ok": true,
        "devices": reconciled.outcome.allowed_devices,
        "estimated_days": reconciled.outcome.estimated_days,
    })))
}

#[derive(Deserialize)]
pub struct TopupRequest {
    pub amount: i64,
}

pub async fn topup(
    State(state): State<AppState>,
    TelegramAuth(identity): TelegramAuth,
    Json(req): Json<TopupRequest>,
) -> ApiResult<Json<Value>> {
    if req.amount < state.config.min_topup {
        return Err(ApiError::BadRequest(format!(
            "Minimum top-up is {}₽",
            state.config.min_topup
        )));
    }
    let user = current_user(&state, &identity).await?;
    let payment = state.accounts.create_topup(user.id, req.amount).await?;
    info!("Pending top-up {} of {} for user {}", payment.id, payment.amount, user.id);

    Ok(Json(json!({
        "confirmation_url": format!(
            "https://yoomoney.ru/quickpay/confirm.xml?label={}",
            payment.id
        ),
        "payment_id": payment.id,
    })))
}

#[derive(Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

fn webhook_payment_id(body: &Value) -> Option<i64> {
    let raw = body.get("object")?.get("metadata")?.get("payment_id")?;
    raw.as_i64().or_else(|| raw.as_str()?.trim().parse().ok())
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        if query.token.as_deref() != Some(secret) {
            return Err(ApiError::Unauthorized("Invalid webhook token".into()));
        }
    }

    let Some(payment_id) = webhook_payment_id(&body) else {
        return Ok(Json(json!({ "ok": false })));
    };
    let status = body
        .get("object")
        .and_then(|o| o.get("status"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status.is_empty() {
        return Ok(Json(json!({ "ok": false })));
    }

    match state.accounts.payments.get_by_id(payment_id).await? {
        Some(payment) if !payment.is_settled() => {
            if let Some(provider_id) = body.get("object").and_then(|o| o.get("id")).and_then(Value::as_str) {
                state.accounts.payments.set_provider_id(payment_id, provider_id).await?;
            }
            state.accounts.apply_payment_status(payment_id, status).await?;
        }
        Some(_) => {}
        None => warn!("Webhook for unknown payment {}", payment_id),
    }
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_id_accepts_number_or_string() {
        let numeric = json!({"object": {"status": "succeeded", "metadata": {"payment_id": 17}}});
        let textual = json!({"object": {"status": "succeeded", "metadata": {"payment_id": "18"}}});
        assert_eq!(webhook_payment_id(&numeric), Some(17));
        assert_eq!(webhook_payment_id(&textual), Some(18));
        assert_eq!(webhook_payment_id(&json!({"object": {}})), None);
    }

    #[test]
    fn fingerprint_fits_the_column() {
        let req = |fingerprint: String| DeviceRequest {
            fingerprint,
            label: format!("  {}  ", "l".repeat(80)),
        };

        let max_req = req("a".repeat(128));
        let (fp, label) = device_fields(&max_req).unwrap();
        assert_eq!(fp.len(), 128);
        assert_eq!(label.chars().count(), 64);

        assert!(device_fields(&req("a".repeat(129))).is_err());
        assert!(device_fields(&req("   ".into())).is_err());
    }
}
