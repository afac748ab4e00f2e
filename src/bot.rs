use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MessagesConfig;
use crate::error::TelegramError;
use crate::telegram::{BotApi, Update};

const LONG_POLL_SECS: u64 = 50;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the bot answers to an incoming update.
#[derive(Debug, Clone, PartialEq)]
pub enum BotAction {
    Welcome { chat_id: i64 },
    AcknowledgeRequest { chat_id: i64 },
    UsageHint { chat_id: i64 },
    AnswerPreCheckout { query_id: String, ok: bool },
    ThankForPayment { chat_id: i64 },
    Ignore,
}

/// Everything the update handlers need besides the API client.
pub struct BotContext {
    pub messages: MessagesConfig,
    pub payment_payload: String,
    pub web_app_url: Option<String>,
}

pub fn classify(update: &Update, payment_payload: &str) -> BotAction {
    if let Some(query) = &update.pre_checkout_query {
        return BotAction::AnswerPreCheckout {
            query_id: query.id.clone(),
            ok: query.invoice_payload == payment_payload,
        };
    }

    let Some(message) = &update.message else {
        return BotAction::Ignore;
    };
    let chat_id = message.chat.id;

    if message.successful_payment.is_some() {
        return BotAction::ThankForPayment { chat_id };
    }
    if message.web_app_data.is_some() {
        return BotAction::AcknowledgeRequest { chat_id };
    }
    match message.text.as_deref() {
        Some(text) if is_start_command(text) => BotAction::Welcome { chat_id },
        Some(_) => BotAction::UsageHint { chat_id },
        None => BotAction::Ignore,
    }
}

/// `/start`, `/start payload` and `/start@botname` all count.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}

fn web_app_keyboard(button: &str, url: &str) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [[{ "text": button, "web_app": { "url": url } }]]
    })
}

pub async fn handle_update(bot: &BotApi, ctx: &BotContext, update: Update) -> Result<(), TelegramError> {
    let action = classify(&update, &ctx.payment_payload);
    debug!(update_id = update.update_id, ?action, "handling update");

    match action {
        BotAction::Welcome { chat_id } => {
            let markup = ctx
                .web_app_url
                .as_deref()
                .map(|url| web_app_keyboard(&ctx.messages.start_button, url));
            bot.send_message(chat_id, &ctx.messages.welcome, markup).await
        }
        BotAction::AcknowledgeRequest { chat_id } => {
            info!(chat_id, "web app data received");
            bot.send_message(chat_id, &ctx.messages.request_received, None).await
        }
        BotAction::UsageHint { chat_id } => bot.send_message(chat_id, &ctx.messages.usage_hint, None).await,
        BotAction::AnswerPreCheckout { query_id, ok } => {
            if !ok {
                warn!(query_id = %query_id, "pre-checkout payload mismatch, rejecting");
            }
            let error_message = (!ok).then_some(ctx.messages.payment_error.as_str());
            bot.answer_pre_checkout_query(&query_id, ok, error_message).await
        }
        BotAction::ThankForPayment { chat_id } => {
            info!(chat_id, "payment confirmed");
            bot.send_message(chat_id, &ctx.messages.payment_thanks, None).await
        }
        BotAction::Ignore => Ok(()),
    }
}

/// Point Telegram at our webhook endpoint.
pub async fn register_webhook(bot: &BotApi, web_app_url: &str, secret: &str) -> Result<(), TelegramError> {
    let url = format!("{}/telegram-webhook", web_app_url.trim_end_matches('/'));
    bot.set_webhook(&url, secret).await
}

/// Long-polling loop for deployments without a public URL.
pub async fn polling_loop(bot: Arc<BotApi>, ctx: Arc<BotContext>, cancel: CancellationToken) {
    if let Err(e) = bot.delete_webhook().await {
        warn!(error = %e, "failed to delete webhook before polling");
    }
    info!("Telegram long polling started");

    let mut offset: Option<i64> = None;
    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Telegram polling shutting down");
                return;
            }
            res = bot.get_updates(offset, LONG_POLL_SECS) => res,
        };

        let updates = match updates {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, "getUpdates failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                continue;
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            let update_id = update.update_id;
            if let Err(e) = handle_update(&bot, &ctx, update).await {
                warn!(update_id, error = %e, "failed to handle update");
            }
        }
    }
}
