use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, ParseMode};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Balance covers at most this many more days.
    LowBalance { days: i64 },
    SubscriptionPaused,
    BalanceCredited { amount: i64 },
    Broadcast(String),
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::LowBalance { days } => format!(
                "⚠️ <b>Low balance</b>\n\nYour balance covers less than 3 days of VPN access \
                 ({} left). Top up in the app to keep your link working.",
                days
            ),
            Notice::SubscriptionPaused => "⏸ <b>Subscription paused</b>\n\n\
                 Your balance no longer covers a day of access, so your VPN link is suspended. \
                 It resumes as soon as you top up."
                .to_string(),
            Notice::BalanceCredited { amount } => {
                format!("✅ Payment received: <b>{}</b> ₽ added to your balance.", amount)
            }
            Notice::Broadcast(text) => text.clone(),
        }
    }

    /// Broadcasts are admin-written plain text; everything else is HTML
    /// with the mini-app keyboard.
    pub fn is_html(&self) -> bool {
        !matches!(self, Notice::Broadcast(_))
    }
}

/// Best-effort delivery: implementations log failures and never return them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, telegram_id: &str, notice: Notice);
}

pub struct TelegramNotifier {
    bot: Bot,
    keyboard: InlineKeyboardMarkup,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, keyboard: InlineKeyboardMarkup) -> Self {
        Self { bot, keyboard }
    }
}

/// Every send runs in its own task; `notify` returns immediately.
#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, telegram_id: &str, notice: Notice) {
        let chat_id = match telegram_id.parse::<i64>() {
            Ok(id) => ChatId(id),
            Err(_) => {
                warn!("Cannot notify non-numeric telegram id {:?}", telegram_id);
                return;
            }
        };

        let bot = self.bot.clone();
        let keyboard = self.keyboard.clone();
        let telegram_id = telegram_id.to_string();
        tokio::spawn(async move {
            let mut request = bot.send_message(chat_id, notice.text());
            if notice.is_html() {
                request = request.parse_mode(ParseMode::Html).reply_markup(keyboard);
            }
            match request.await {
                Ok(_) => debug!("Sent {:?} to {}", notice, telegram_id),
                Err(e) => warn!("Failed to notify {}: {}", telegram_id, e),
            }
        });
    }
}

/// Used when no bot token is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, telegram_id: &str, notice: Notice) {
        debug!("Bot disabled, dropping {:?} for {}", notice, telegram_id);
    }
}
