use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::{MessagesConfig, PaymentConfig};
use crate::error::{BillingError, DeliveryError, PipelineError, RenderError, TelegramError};
use crate::llm::{ModelParams, TextGenerator};
use crate::models::{ContentLength, ContentRequest, ContentSource, Outcome, Tier, ValidatedRequest};
use crate::prompt::{build_prompt, fingerprint};
use crate::quota::QuotaStore;
use crate::render::{DocumentRenderer, Template};

/// Chat session the finished document goes back to.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<(), TelegramError>;
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;
}

/// External payment provider. Confirmation arrives out of band.
#[async_trait]
pub trait Billing: Send + Sync {
    async fn send_invoice(&self, invoice: &Invoice) -> Result<(), BillingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub chat_id: i64,
    pub title: String,
    pub description: String,
    pub payload: String,
    pub currency: String,
    pub price: u32,
}

/// Result of the quota check for an identified requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// very-brief requests are never counted
    Free,
    /// under the allowance; counts against it
    WithinQuota,
    QuotaExhausted,
}

pub fn decide(length: ContentLength, daily_count: u64, allowance: u64) -> GateDecision {
    if length == ContentLength::VeryBrief {
        GateDecision::Free
    } else if daily_count < allowance {
        GateDecision::WithinQuota
    } else {
        GateDecision::QuotaExhausted
    }
}

/// Gate, generate, render, deliver. Collaborators are injected so every
/// stage can be replaced in tests.
pub struct Pipeline {
    pub quota: Arc<QuotaStore>,
    pub cache: Arc<ContentCache>,
    pub generator: Arc<dyn TextGenerator>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub template: Arc<Template>,
    pub transport: Option<Arc<dyn ChatTransport>>,
    pub billing: Option<Arc<dyn Billing>>,
    pub params: ModelParams,
    pub free_daily_requests: u64,
    pub payment: PaymentConfig,
    pub messages: MessagesConfig,
    /// Where delivery artifacts are written. System temp dir when unset.
    pub artifact_dir: Option<PathBuf>,
}

impl Pipeline {
    pub async fn run(&self, request: &ContentRequest) -> Result<Outcome, PipelineError> {
        let request = request.validate().inspect_err(|e| {
            warn!(error = %e, "request rejected by validation");
        })?;

        if let Some(user_id) = request.user_id
            && let Some(outcome) = self.gate(user_id, &request).await?
        {
            return Ok(outcome);
        }

        let prompt = build_prompt(&request);
        info!(prompt = %prompt, "prompt built");

        let (content, source) = self.obtain_content(&prompt).await?;
        let pdf = self.render(content, Tier::for_length(request.length)).await?;

        let transport = match (request.chat_id, &self.transport) {
            (Some(chat_id), Some(transport)) => Some((chat_id, transport)),
            (Some(chat_id), None) => {
                warn!(chat_id, "no chat transport configured, returning document to caller");
                None
            }
            (None, _) => None,
        };

        match transport {
            Some((chat_id, transport)) => {
                self.deliver(&**transport, chat_id, &pdf).await?;
                Ok(Outcome::Delivered { source })
            }
            None => Ok(Outcome::Document { pdf, source }),
        }
    }

    /// `Some` ends the request early with a payment outcome.
    async fn gate(&self, user_id: i64, request: &ValidatedRequest) -> Result<Option<Outcome>, PipelineError> {
        let count = self.quota.daily_count(user_id).await;
        match decide(request.length, count, self.free_daily_requests) {
            GateDecision::Free => {
                info!(user_id, "very-brief request, quota not consulted");
                Ok(None)
            }
            GateDecision::WithinQuota => {
                self.quota.increment(user_id).await;
                info!(user_id, used = count + 1, allowance = self.free_daily_requests, "request within free quota");
                Ok(None)
            }
            GateDecision::QuotaExhausted => match (&self.billing, request.chat_id) {
                (Some(billing), Some(chat_id)) => {
                    let invoice = self.invoice_for(chat_id, request);
                    billing.send_invoice(&invoice).await.inspect_err(|e| {
                        error!(stage = "billing", user_id, error = %e, "invoice could not be sent");
                    })?;
                    info!(user_id, chat_id, "free quota exhausted, invoice sent");
                    Ok(Some(Outcome::PaymentRequested))
                }
                _ => {
                    info!(user_id, count, "free quota exhausted and no payment route, rejecting");
                    Err(PipelineError::PaymentRequired)
                }
            },
        }
    }

    fn invoice_for(&self, chat_id: i64, request: &ValidatedRequest) -> Invoice {
        let description = self
            .payment
            .description
            .replace("{length}", request.length.label())
            .replace("{topic}", &request.topic);
        Invoice {
            chat_id,
            title: self.payment.title.clone(),
            description,
            payload: self.payment.payload.clone(),
            currency: self.payment.currency.clone(),
            price: self.payment.price,
        }
    }

    async fn obtain_content(&self, prompt: &str) -> Result<(String, ContentSource), PipelineError> {
        let fp = fingerprint(prompt);
        let (content, source) = self
            .cache
            .get_or_fill(&fp, self.generator.generate(prompt, &self.params))
            .await
            .inspect_err(|e| error!(stage = "generation", error = %e, "content generation failed"))?;
        match source {
            ContentSource::CacheHit => info!(fingerprint = %fp, "content served from cache"),
            ContentSource::Generated => info!(fingerprint = %fp, "content generated and cached"),
        }
        Ok((content, source))
    }

    async fn render(&self, content: String, tier: Tier) -> Result<Vec<u8>, PipelineError> {
        let renderer = self.renderer.clone();
        let template = self.template.clone();
        let pdf = tokio::task::spawn_blocking(move || renderer.render(&content, &template, tier))
            .await
            .map_err(|e| RenderError::Pdf(format!("render task failed: {e}")))?
            .inspect_err(|e| error!(stage = "render", error = %e, "PDF rendering failed"))?;
        Ok(pdf)
    }

    /// Send the PDF through a temporary file that is removed whatever the
    /// outcome. Any failure, including writing the file, gets the requester a
    /// fallback text message; quota and cache are left as they are.
    async fn deliver(&self, transport: &dyn ChatTransport, chat_id: i64, pdf: &[u8]) -> Result<(), DeliveryError> {
        let sent = match self.write_artifact(pdf).await {
            Ok(artifact) => {
                let sent = transport
                    .send_document(chat_id, artifact.path(), &self.messages.document_caption)
                    .await
                    .map_err(DeliveryError::from);
                if let Err(e) = artifact.close() {
                    warn!(error = %e, "failed to remove delivery artifact");
                }
                sent
            }
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                info!(chat_id, bytes = pdf.len(), "PDF delivered");
                Ok(())
            }
            Err(e) => {
                error!(stage = "delivery", chat_id, error = %e, "failed to send PDF");
                if let Err(fallback) = transport.send_text(chat_id, &self.messages.delivery_failed).await {
                    warn!(chat_id, error = %fallback, "fallback message also failed");
                }
                Err(e)
            }
        }
    }

    async fn write_artifact(&self, pdf: &[u8]) -> Result<tempfile::NamedTempFile, DeliveryError> {
        let prefix = format!("content_{}", Uuid::new_v4().simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".pdf").rand_bytes(0);
        let artifact = match &self.artifact_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        // dropped on error, which removes the file
        tokio::fs::write(artifact.path(), pdf).await?;
        Ok(artifact)
    }
}
