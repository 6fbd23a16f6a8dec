use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, ParseMode, Recipient, UserId};
use teloxide::{dptree, types::Update};
use tracing::{error, info, warn};

use crate::bot::keyboards::{policy_keyboard, subscribe_keyboard, webapp_keyboard};
use crate::state::AppState;

pub mod keyboards;

const WELCOME_TEXT: &str = "👋 <b>Welcome to 1VPN!</b>\n\n\
    Open the app below to add a device, top up your balance and get your connection link.";

const SUPPORT_TEXT: &str = "💬 Questions about payments or setup? Our support team will help.";

const SUBSCRIBE_TEXT: &str = "📢 To use 1VPN, please subscribe to our channel first.";

const POLICY_TEXT: &str = "📜 Thanks for subscribing! Please review and accept the privacy policy to continue.";

fn channel_recipient(channel: &str) -> Recipient {
    match channel.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => {
            let name = channel.trim().trim_start_matches('@');
            Recipient::ChannelUsername(format!("@{}", name))
        }
    }
}

/// `true` when no channel is required. Lookup failures count as not subscribed.
async fn is_subscribed(bot: &Bot, state: &AppState, user_id: UserId) -> bool {
    let Some(channel) = state.config.required_channel.as_deref() else {
        return true;
    };
    match bot.get_chat_member(channel_recipient(channel), user_id).await {
        Ok(member) => member.is_present(),
        Err(e) => {
            warn!("Failed to check membership of {} in {}: {}", user_id, channel, e);
            false
        }
    }
}

pub async fn message_handler(bot: Bot, msg: Message, state: AppState) -> Result<(), teloxide::RequestError> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };

    if text.starts_with("/start") {
        let telegram_id = from.id.0.to_string();
        if let Err(e) = state
            .accounts
            .get_or_create_user(&telegram_id, from.username.as_deref())
            .await
        {
            error!("Failed to register tg {}: {:#}", telegram_id, e);
        }

        if !is_subscribed(&bot, &state, from.id).await {
            bot.send_message(msg.chat.id, SUBSCRIBE_TEXT)
                .reply_markup(subscribe_keyboard(&state.config))
                .await?;
            return Ok(());
        }

        bot.send_message(msg.chat.id, WELCOME_TEXT)
            .parse_mode(ParseMode::Html)
            .reply_markup(webapp_keyboard(&state.config))
            .await?;
    } else if text.to_lowercase().contains("support") {
        bot.send_message(msg.chat.id, SUPPORT_TEXT)
            .reply_markup(webapp_keyboard(&state.config))
            .await?;
    }
    Ok(())
}

pub async fn callback_handler(bot: Bot, q: CallbackQuery, state: AppState) -> Result<(), teloxide::RequestError> {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };

    match data {
        "check_sub" => {
            if !is_subscribed(&bot, &state, q.from.id).await {
                bot.answer_callback_query(q.id.clone())
                    .text("You are not subscribed to the channel yet.")
                    .show_alert(true)
                    .await?;
                return Ok(());
            }
            bot.answer_callback_query(q.id.clone()).await?;
            if let Some(msg) = q.message.as_ref() {
                bot.edit_message_text(msg.chat().id, msg.id(), POLICY_TEXT)
                    .reply_markup(policy_keyboard(&state.config))
                    .await?;
            }
        }
        "accept_policy" => {
            bot.answer_callback_query(q.id.clone()).await?;
            if let Some(msg) = q.message.as_ref() {
                bot.edit_message_text(msg.chat().id, msg.id(), WELCOME_TEXT)
                    .parse_mode(ParseMode::Html)
                    .reply_markup(webapp_keyboard(&state.config))
                    .await?;
            }
        }
        other => {
            info!("Unknown callback {:?} from {}", other, q.from.id);
            bot.answer_callback_query(q.id.clone()).await?;
        }
    }
    Ok(())
}

pub async fn run_bot(bot: Bot, state: AppState) {
    info!("Bot identity check...");
    match bot.get_me().await {
        Ok(me) => {
            let username = me.username.clone().unwrap_or_else(|| "unknown".into());
            info!("Bot connected as: @{}", username);
        }
        Err(e) => {
            error!("Bot failed to connect to Telegram: {}", e);
            return;
        }
    }

    let messages = Update::filter_message().endpoint(message_handler);
    let callbacks = Update::filter_callback_query().endpoint(callback_handler);

    Dispatcher::builder(bot, dptree::entry().branch(messages).branch(callbacks))
        .dependencies(dptree::deps![state])
        .default_handler(|upd: std::sync::Arc<Update>| async move {
            info!("Unhandled update: {:?}", upd.id);
        })
        .build()
        .dispatch()
        .await;

    info!("Bot dispatcher exited");
}
