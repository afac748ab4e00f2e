use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::error::GenerationError;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

/// Opaque text-generation service. Stateless; no retries, no caching.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, params: &ModelParams) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.timeout).unwrap_or(Duration::from_secs(60));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pamphlet/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating LLM HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, prompt: &str, params: &ModelParams) -> Result<String, GenerationError> {
        let body = ChatRequest {
            model: &params.model,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        info!(model = %params.model, prompt_chars = prompt.chars().count(), "calling LLM");

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(GenerationError::Provider {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        extract_content(&text)
    }
}

fn extract_content(body: &str) -> Result<String, GenerationError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| GenerationError::ResponseParse(e.to_string()))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        return Err(GenerationError::EmptyContent);
    }

    debug!(chars = content.chars().count(), "LLM content received");
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> OpenAiClient {
        OpenAiClient::from_config(&LlmConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn resolves_endpoint() {
        assert_eq!(
            client("https://api.openai.com/v1/").endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            client("http://localhost:1234").endpoint(),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            client("http://proxy/openai/chat/completions").endpoint(),
            "http://proxy/openai/chat/completions"
        );
    }

    #[test]
    fn extracts_trimmed_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  # Title\n\nBody \n"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "# Title\n\nBody");
    }

    #[test]
    fn empty_or_null_content_is_an_error() {
        assert!(matches!(
            extract_content(r#"{"choices":[]}"#),
            Err(GenerationError::EmptyContent)
        ));
        assert!(matches!(
            extract_content(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(GenerationError::EmptyContent)
        ));
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        assert!(matches!(
            extract_content("<html>bad gateway</html>"),
            Err(GenerationError::ResponseParse(_))
        ));
    }

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "gpt-3.5-turbo",
            messages: [Message {
                role: "user",
                content: "hi",
            }],
            temperature: 0.5,
            max_tokens: 1000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["max_tokens"], 1000);
    }
}
