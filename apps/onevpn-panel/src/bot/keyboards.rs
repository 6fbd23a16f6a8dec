use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, WebAppInfo};
use url::Url;

use crate::config::PanelConfig;

fn url_button(text: &str, raw: &str) -> Option<InlineKeyboardButton> {
    Url::parse(raw).ok().map(|url| InlineKeyboardButton::url(text, url))
}

/// Mini-app launcher plus the support chat.
pub fn webapp_keyboard(config: &PanelConfig) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Ok(url) = Url::parse(&config.webapp_base()) {
        rows.push(vec![InlineKeyboardButton::web_app(
            "🚀 Open 1VPN",
            WebAppInfo { url },
        )]);
    }
    if let Some(button) = url_button("💬 Support", &config.support_url()) {
        rows.push(vec![button]);
    }
    InlineKeyboardMarkup::new(rows)
}

pub fn subscribe_keyboard(config: &PanelConfig) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Some(channel) = config.required_channel.as_deref() {
        let link = format!("https://t.me/{}", channel.trim_start_matches('@'));
        if let Some(button) = url_button("📢 Subscribe", &link) {
            rows.push(vec![button]);
        }
    }
    rows.push(vec![InlineKeyboardButton::callback("✅ I've subscribed", "check_sub")]);
    if let Some(button) = config.policy_url.as_deref().and_then(|u| url_button("📜 Privacy policy", u)) {
        rows.push(vec![button]);
    }
    InlineKeyboardMarkup::new(rows)
}

pub fn policy_keyboard(config: &PanelConfig) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Some(button) = config.policy_url.as_deref().and_then(|u| url_button("📜 Privacy policy", u)) {
        rows.push(vec![button]);
    }
    rows.push(vec![InlineKeyboardButton::callback("✅ Accept", "accept_policy")]);
    InlineKeyboardMarkup::new(rows)
}
