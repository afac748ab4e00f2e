use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Client input that never reaches gating.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("main topic must not be blank")]
    BlankTopic,
    #[error("main topic must be between {min} and {max} characters (got {len})")]
    TopicLength { len: usize, min: usize, max: usize },
    #[error("unknown content type '{0}'")]
    ContentType(String),
    #[error("unknown content length '{0}'")]
    ContentLength(String),
}

/// Backing key-value store failure. Absorbed by the quota store and the cache.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored value for '{key}' is not a counter: {value}")]
    NotACounter { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("LLM provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("failed to parse LLM response: {0}")]
    ResponseParse(String),
    #[error("LLM returned empty content")]
    EmptyContent,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("malformed template: {0}")]
    Template(String),
    #[error("failed to read template: {0}")]
    TemplateRead(#[from] std::io::Error),
    #[error("failed to convert markup to text: {0}")]
    Markup(String),
    #[error("failed to build PDF: {0}")]
    Pdf(String),
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Bot API request '{method}' failed: {source}")]
    Http { method: &'static str, source: reqwest::Error },
    #[error("Bot API method '{method}' returned an error: {description}")]
    Api { method: &'static str, description: String },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to write delivery artifact: {0}")]
    Artifact(#[from] std::io::Error),
    #[error("transport rejected the document: {0}")]
    Transport(#[from] TelegramError),
}

#[derive(Debug, Error)]
#[error("failed to send invoice: {0}")]
pub struct BillingError(#[from] pub TelegramError);

/// Terminal outcome of a request that did not succeed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("daily free quota exhausted and no payment provider is available")]
    PaymentRequired,
    #[error(transparent)]
    Billing(#[from] BillingError),
    /// Shared between identical requests that waited on the same generation.
    #[error(transparent)]
    Generation(#[from] Arc<GenerationError>),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl PipelineError {
    /// Stable machine-readable code reported to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::PaymentRequired => "payment_required",
            PipelineError::Billing(_) => "billing_error",
            PipelineError::Generation(_) => "generation_error",
            PipelineError::Render(_) => "render_error",
            PipelineError::Delivery(_) => "delivery_error",
        }
    }
}
