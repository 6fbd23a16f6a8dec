use std::path::Path;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;
use crate::utils::{TelegramIdentity, validate_init_data};

pub mod admin;
pub mod api;
pub mod link;

pub const INIT_DATA_HEADER: &str = "X-Telegram-Init";
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/init", post(api::init))
        .route("/state", get(api::state))
        .route("/device", post(api::register_device))
        .route("/device/{id}", delete(api::delete_device))
        .route("/topup", post(api::topup))
        .route("/webhooks/payment", post(api::payment_webhook));

    let admin_routes = Router::new()
        .route("/topup", post(admin::topup))
        .route("/ban", post(admin::ban))
        .route("/price", get(admin::get_price).post(admin::set_price))
        .route("/broadcast", post(admin::broadcast))
        .route("/pools", get(admin::list_pools).post(admin::create_pool))
        .route("/sweep", post(admin::sweep))
        .route("/reconcile", post(admin::reconcile))
        .route("/ui/login", post(admin::ui_login))
        .route("/ui/creds", post(admin::ui_credentials));

    let webapp = Path::new(&state.config.webapp_dir).to_path_buf();

    Router::new()
        .route_service("/", ServeFile::new(webapp.join("index.html")))
        .route_service("/admin-ui", ServeFile::new(webapp.join("admin.html")))
        .nest_service("/static", ServeDir::new(&webapp))
        .route("/health", get(|| async { "ok" }))
        .nest("/api", api_routes)
        .nest("/admin", admin_routes)
        .route("/l/{slug}", get(link::wireguard_profile))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Validates raw initData against the bot token.
pub fn authenticate(state: &AppState, init_data: &str) -> Result<TelegramIdentity, ApiError> {
    let token = state
        .config
        .bot_token
        .as_deref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Bot token is not configured".into()))?;
    validate_init_data(init_data, token).map_err(|e| {
        warn!("Rejected initData: {}", e);
        ApiError::BadRequest(format!("Invalid initData: {}", e))
    })
}

/// Mini-app caller, authenticated by the `X-Telegram-Init` header.
pub struct TelegramAuth(pub TelegramIdentity);

impl FromRequestParts<AppState> for TelegramAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let init_data = header(parts, INIT_DATA_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("Missing X-Telegram-Init header".into()))?;
        authenticate(state, init_data).map(TelegramAuth)
    }
}

/// Operator request carrying the shared admin secret or an admin UI token.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match header(parts, ADMIN_TOKEN_HEADER) {
            Some(token) if state.admin.authorizes(token) => Ok(AdminAuth),
            _ => Err(ApiError::Unauthorized("Invalid admin token".into())),
        }
    }
}
