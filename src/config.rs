use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::render::DEFAULT_WATERMARK;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pamphlet: PamphletConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
}

#[derive(Debug, Deserialize)]
pub struct PamphletConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_free_daily_requests")]
    pub free_daily_requests: u64,
    #[serde(default = "default_quota_window")]
    pub quota_window: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
}

impl Default for PamphletConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            free_daily_requests: default_free_daily_requests(),
            quota_window: default_quota_window(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_free_daily_requests() -> u64 {
    1
}
fn default_quota_window() -> String {
    "24h".to_string()
}
fn default_cache_ttl() -> String {
    "1h".to_string()
}

/// Without a URL the quota store and the cache live in process memory.
#[derive(Debug, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout: default_llm_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_llm_timeout() -> String {
    "60s".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct TelegramConfig {
    /// Without a token there is no chat transport: documents go back to the HTTP caller.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Public base URL. When set the bot runs on a webhook, otherwise it long-polls.
    #[serde(default)]
    pub web_app_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Payment provider token. Without it quota overruns are rejected with 402.
    #[serde(default)]
    pub provider_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    #[serde(default = "default_payment_title")]
    pub title: String,
    /// `{length}` and `{topic}` are substituted.
    #[serde(default = "default_payment_description")]
    pub description: String,
    #[serde(default = "default_payment_payload")]
    pub payload: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_price")]
    pub price: u32,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            title: default_payment_title(),
            description: default_payment_description(),
            payload: default_payment_payload(),
            currency: default_currency(),
            price: default_price(),
        }
    }
}

fn default_payment_title() -> String {
    "Premium content".to_string()
}
fn default_payment_description() -> String {
    "Get {length} content about {topic}".to_string()
}
fn default_payment_payload() -> String {
    "brochure_premium_content".to_string()
}
fn default_currency() -> String {
    "XTR".to_string()
}
fn default_price() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// TrueType font for non-Latin scripts.
    #[serde(default)]
    pub font: Option<PathBuf>,
    #[serde(default = "default_watermark")]
    pub watermark: String,
    /// Where delivery artifacts are written, system temp dir when unset.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            template: None,
            font: None,
            watermark: default_watermark(),
            artifact_dir: None,
        }
    }
}

fn default_watermark() -> String {
    DEFAULT_WATERMARK.to_string()
}

/// User-facing strings. Internal errors never reach the user verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub success: String,
    pub payment_required: String,
    pub payment_unavailable: String,
    pub validation_failed: String,
    pub generation_failed: String,
    pub render_failed: String,
    pub delivery_failed: String,
    pub billing_failed: String,
    pub document_caption: String,
    pub welcome: String,
    pub start_button: String,
    pub request_received: String,
    pub usage_hint: String,
    pub payment_thanks: String,
    pub payment_error: String,
    pub health: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            success: "Your content was generated and sent successfully!".to_string(),
            payment_required: "Please complete the payment to receive premium content.".to_string(),
            payment_unavailable: "This feature requires payment. Upgrade your plan or use the free very-brief content."
                .to_string(),
            validation_failed: "The request is invalid. Check the topic, content type and length.".to_string(),
            generation_failed: "The AI service failed to generate your content. Please try again later.".to_string(),
            render_failed: "An error occurred while building the PDF file.".to_string(),
            delivery_failed: "Sorry, an error occurred while sending the PDF file. Please try again.".to_string(),
            billing_failed: "The payment request could not be sent. Please try again later.".to_string(),
            document_caption: "Your requested content is ready!".to_string(),
            welcome: "Welcome to the AI content creator! Press the button below to create a leaflet or research paper."
                .to_string(),
            start_button: "🚀 Start a new project".to_string(),
            request_received: "Your data was received. Processing your request...".to_string(),
            usage_hint: "I am a content creation bot. Use the \"Start a new project\" button to begin.".to_string(),
            payment_thanks: "Thank you! Payment successful. You can now create premium content.".to_string(),
            payment_error: "An error occurred during payment.".to_string(),
            health: "AI Content Creator is running!".to_string(),
        }
    }
}

impl Config {
    pub fn quota_window(&self) -> std::time::Duration {
        humantime::parse_duration(&self.pamphlet.quota_window).unwrap_or(std::time::Duration::from_secs(24 * 3600))
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        humantime::parse_duration(&self.pamphlet.cache_ttl).unwrap_or(std::time::Duration::from_secs(3600))
    }

    /// Fill unset secrets from the environment.
    fn apply_env(&mut self) {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if self.llm.api_key.is_none() {
            self.llm.api_key = env("OPENAI_API_KEY");
        }
        if self.telegram.bot_token.is_none() {
            self.telegram.bot_token = env("TELEGRAM_BOT_TOKEN");
        }
        if self.telegram.provider_token.is_none() {
            self.telegram.provider_token = env("TELEGRAM_PROVIDER_TOKEN");
        }
        if self.redis.url.is_none() {
            self.redis.url = env("REDIS_URL");
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let mut config = parse_config(&content)?;
    config.apply_env();
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    config.pamphlet.listen.parse::<SocketAddr>().map_err(|e| {
        ConfigError::Validation(format!("listen address '{}': {}", config.pamphlet.listen, e))
    })?;

    for (name, value) in [
        ("pamphlet.quota_window", &config.pamphlet.quota_window),
        ("pamphlet.cache_ttl", &config.pamphlet.cache_ttl),
        ("llm.timeout", &config.llm.timeout),
        ("redis.connect_timeout", &config.redis.connect_timeout),
    ] {
        let d = humantime::parse_duration(value)
            .map_err(|e| ConfigError::Validation(format!("{name} '{value}': {e}")))?;
        if d.is_zero() {
            return Err(ConfigError::Validation(format!("{name} must be greater than zero")).into());
        }
    }

    if let Some(url) = &config.redis.url
        && !(url.starts_with("redis://") || url.starts_with("rediss://"))
    {
        return Err(ConfigError::Validation(format!(
            "redis url '{url}' must start with redis:// or rediss://"
        ))
        .into());
    }

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        return Err(ConfigError::Validation(format!(
            "llm temperature {} out of range [0, 2]",
            config.llm.temperature
        ))
        .into());
    }
    if config.llm.max_tokens == 0 {
        return Err(ConfigError::Validation("llm max_tokens must be greater than zero".to_string()).into());
    }

    if config.payment.price == 0 {
        return Err(ConfigError::Validation("payment price must be greater than zero".to_string()).into());
    }
    if config.payment.currency.len() != 3 || !config.payment.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ConfigError::Validation(format!(
            "payment currency '{}' must be a 3-letter uppercase code",
            config.payment.currency
        ))
        .into());
    }
    if config.payment.payload.is_empty() || config.payment.payload.len() > 128 {
        return Err(ConfigError::Validation("payment payload must be 1-128 bytes".to_string()).into());
    }

    if let Some(url) = &config.telegram.web_app_url
        && !url.starts_with("https://")
    {
        return Err(ConfigError::Validation(format!(
            "telegram web_app_url '{url}' must be an https:// URL"
        ))
        .into());
    }
    if let Some(secret) = &config.telegram.webhook_secret
        && (secret.is_empty()
            || secret.len() > 256
            || !secret.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
    {
        return Err(ConfigError::Validation(
            "telegram webhook_secret must be 1-256 characters of A-Z, a-z, 0-9, _ and -".to_string(),
        )
        .into());
    }

    if config.render.watermark.is_empty() {
        return Err(ConfigError::Validation("render watermark must not be empty".to_string()).into());
    }

    Ok(())
}
