use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BillingError, TelegramError};
use crate::pipeline::{Billing, ChatTransport, Invoice};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub pre_checkout_query: Option<PreCheckoutQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub web_app_data: Option<WebAppData>,
    #[serde(default)]
    pub successful_payment: Option<SuccessfulPayment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebAppData {
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessfulPayment {
    pub currency: String,
    pub total_amount: i64,
    pub invoice_payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreCheckoutQuery {
    pub id: String,
    pub from: User,
    pub invoice_payload: String,
}

#[derive(Debug, Serialize)]
struct LabeledPrice<'a> {
    label: &'a str,
    amount: u32,
}

/// Telegram Bot API over HTTPS.
pub struct BotApi {
    client: reqwest::Client,
    base: String,
}

impl BotApi {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(API_BASE, token)
    }

    pub fn with_base_url(api_base: &str, token: &str) -> Result<Self> {
        // long polling holds requests open for up to 50s
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("creating Bot API HTTP client")?;
        Ok(Self {
            client,
            base: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base)
    }

    async fn decode<T: DeserializeOwned>(method: &'static str, resp: reqwest::Response) -> Result<T, TelegramError> {
        let body: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|source| TelegramError::Http { method, source })?;
        match body {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TelegramError::Api {
                method,
                description: description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let resp = self
            .client
            .post(self.url(method))
            .json(params)
            .send()
            .await
            .map_err(|source| TelegramError::Http { method, source })?;
        Self::decode(method, resp).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<(), TelegramError> {
        let mut params = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup;
        }
        let _: serde_json::Value = self.call("sendMessage", &params).await?;
        debug!(chat_id, "message sent");
        Ok(())
    }

    pub async fn send_document_file(&self, chat_id: i64, path: &Path, caption: &str) -> Result<(), TelegramError> {
        const METHOD: &str = "sendDocument";
        let bytes = tokio::fs::read(path).await.map_err(|e| TelegramError::Api {
            method: METHOD,
            description: format!("reading {}: {e}", path.display()),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|source| TelegramError::Http { method: METHOD, source })?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let resp = self
            .client
            .post(self.url(METHOD))
            .multipart(form)
            .send()
            .await
            .map_err(|source| TelegramError::Http { method: METHOD, source })?;
        let _: serde_json::Value = Self::decode(METHOD, resp).await?;
        Ok(())
    }

    pub async fn send_invoice(&self, invoice: &Invoice, provider_token: &str) -> Result<(), TelegramError> {
        let prices = [LabeledPrice {
            label: &invoice.title,
            amount: invoice.price,
        }];
        let params = serde_json::json!({
            "chat_id": invoice.chat_id,
            "title": invoice.title,
            "description": invoice.description,
            "payload": invoice.payload,
            "provider_token": provider_token,
            "currency": invoice.currency,
            "prices": prices,
            "start_parameter": "premium_content",
            "need_name": false,
            "need_phone_number": false,
            "need_email": false,
            "need_shipping_address": false,
            "is_flexible": false,
        });
        let _: serde_json::Value = self.call("sendInvoice", &params).await?;
        Ok(())
    }

    pub async fn answer_pre_checkout_query(
        &self,
        query_id: &str,
        ok: bool,
        error_message: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut params = serde_json::json!({ "pre_checkout_query_id": query_id, "ok": ok });
        if let Some(msg) = error_message {
            params["error_message"] = msg.into();
        }
        let _: bool = self.call("answerPreCheckoutQuery", &params).await?;
        Ok(())
    }

    pub async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<(), TelegramError> {
        let params = serde_json::json!({ "url": url, "secret_token": secret_token });
        let _: bool = self.call("setWebhook", &params).await?;
        info!(url, "Telegram webhook registered");
        Ok(())
    }

    pub async fn delete_webhook(&self) -> Result<(), TelegramError> {
        let _: bool = self.call("deleteWebhook", &serde_json::json!({})).await?;
        Ok(())
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        let mut params = serde_json::json!({ "timeout": timeout_secs });
        if let Some(offset) = offset {
            params["offset"] = offset.into();
        }
        self.call("getUpdates", &params).await
    }
}

#[async_trait]
impl ChatTransport for BotApi {
    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<(), TelegramError> {
        self.send_document_file(chat_id, path, caption).await
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        self.send_message(chat_id, text, None).await
    }
}

/// Invoices through the bot's payment provider.
pub struct TelegramBilling {
    bot: Arc<BotApi>,
    provider_token: String,
}

impl TelegramBilling {
    pub fn new(bot: Arc<BotApi>, provider_token: String) -> Self {
        Self { bot, provider_token }
    }
}

#[async_trait]
impl Billing for TelegramBilling {
    async fn send_invoice(&self, invoice: &Invoice) -> Result<(), BillingError> {
        self.bot.send_invoice(invoice, &self.provider_token).await?;
        info!(chat_id = invoice.chat_id, payload = %invoice.payload, "invoice sent");
        Ok(())
    }
}
