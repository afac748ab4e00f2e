use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bot::{self, BotContext};
use crate::cache::ContentCache;
use crate::config::Config;
use crate::kv::{KvBackend, MemoryBackend, RedisBackend};
use crate::llm::{ModelParams, OpenAiClient};
use crate::pipeline::{Billing, ChatTransport, Pipeline};
use crate::quota::QuotaStore;
use crate::render::{PdfRenderer, Template};
use crate::telegram::{BotApi, TelegramBilling};
use crate::server;

/// Storage selected at startup. Without Redis, counters and cache live in
/// an in-process store that evicts expired entries on its own.
pub struct Storage {
    pub kv: Arc<dyn KvBackend>,
}

pub async fn connect_storage(config: &Config) -> Storage {
    let memory = || Storage {
        kv: Arc::new(MemoryBackend::new()),
    };

    let Some(url) = &config.redis.url else {
        info!("no Redis configured, using in-process store");
        return memory();
    };

    let timeout = humantime::parse_duration(&config.redis.connect_timeout).unwrap_or(Duration::from_secs(5));
    match tokio::time::timeout(timeout, RedisBackend::connect(url)).await {
        Ok(Ok(redis)) => Storage { kv: Arc::new(redis) },
        Ok(Err(e)) => {
            warn!(error = %e, "Redis unavailable, using in-process store (counters and cache are lost on restart)");
            memory()
        }
        Err(_) => {
            warn!(timeout = ?timeout, "Redis connect timed out, using in-process store");
            memory()
        }
    }
}

/// Wire the pipeline from config. Transport and billing are optional
/// collaborators decided by the caller.
pub async fn build_pipeline(
    config: &Config,
    kv: Arc<dyn KvBackend>,
    transport: Option<Arc<dyn ChatTransport>>,
    billing: Option<Arc<dyn Billing>>,
) -> Result<Pipeline> {
    let template = match &config.render.template {
        Some(path) => Template::load(path)
            .await
            .with_context(|| format!("loading PDF template {}", path.display()))?,
        None => Template::builtin(),
    };
    let font = match &config.render.font {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("reading font {}", path.display()))?,
        ),
        None => None,
    };

    if config.llm.api_key.is_none() {
        warn!("no LLM API key configured, generation requests will likely be refused");
    }
    let generator = OpenAiClient::from_config(&config.llm).context("creating LLM client")?;

    Ok(Pipeline {
        quota: Arc::new(QuotaStore::new(kv.clone(), config.quota_window())),
        cache: Arc::new(ContentCache::new(kv, config.cache_ttl())),
        generator: Arc::new(generator),
        renderer: Arc::new(PdfRenderer::new(config.render.watermark.clone(), font)),
        template: Arc::new(template),
        transport,
        billing,
        params: ModelParams {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        },
        free_daily_requests: config.pamphlet.free_daily_requests,
        payment: config.payment.clone(),
        messages: config.messages.clone(),
        artifact_dir: config.render.artifact_dir.clone(),
    })
}

pub async fn run(config: Config) -> Result<()> {
    let storage = connect_storage(&config).await;
    let cancel = CancellationToken::new();

    let bot = match &config.telegram.bot_token {
        Some(token) => Some(Arc::new(BotApi::new(token).context("creating Telegram client")?)),
        None => {
            warn!("no Telegram bot token, documents are returned to the HTTP caller");
            None
        }
    };

    let transport = bot.clone().map(|b| b as Arc<dyn ChatTransport>);
    let billing = match (&bot, &config.telegram.provider_token) {
        (Some(bot), Some(provider_token)) => {
            Some(Arc::new(TelegramBilling::new(bot.clone(), provider_token.clone())) as Arc<dyn Billing>)
        }
        _ => {
            info!("no payment provider, quota overruns are rejected");
            None
        }
    };

    let pipeline = build_pipeline(&config, storage.kv.clone(), transport, billing).await?;

    let mut poller_handle = None;
    let telegram = match bot {
        Some(bot) => {
            let ctx = Arc::new(BotContext {
                messages: config.messages.clone(),
                payment_payload: config.payment.payload.clone(),
                web_app_url: config.telegram.web_app_url.clone(),
            });
            let webhook_secret = match &config.telegram.web_app_url {
                Some(url) => {
                    let secret = config.telegram.webhook_secret.clone().unwrap_or_else(generate_token);
                    bot::register_webhook(&bot, url, &secret)
                        .await
                        .context("registering Telegram webhook")?;
                    Some(secret)
                }
                None => {
                    poller_handle = Some(tokio::spawn(bot::polling_loop(bot.clone(), ctx.clone(), cancel.clone())));
                    None
                }
            };
            Some(server::TelegramState {
                bot,
                ctx,
                webhook_secret,
            })
        }
        None => None,
    };

    let app_state = server::AppState {
        pipeline: Arc::new(pipeline),
        messages: config.messages.clone(),
        telegram,
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.pamphlet.listen)
        .await
        .with_context(|| format!("binding to {}", config.pamphlet.listen))?;

    info!(listen = %config.pamphlet.listen, backend = storage.kv.name(), "HTTP server listening");

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await?;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        if let Some(h) = poller_handle {
            let _ = h.await;
        }
        let _ = server_handle.await;
    })
    .await;

    info!("shutdown complete");
    Ok(())
}

/// Webhook secret used when none is configured. Valid for this process only.
fn generate_token() -> String {
    use rand::distr::Alphanumeric;
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn generated_token_is_valid_webhook_secret() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn without_redis_uses_volatile_store() {
        let config = parse_config("").unwrap();
        let storage = connect_storage(&config).await;
        assert_eq!(storage.kv.name(), "memory");
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back() {
        let config = parse_config("[redis]\nurl = \"redis://127.0.0.1:1\"\nconnect_timeout = \"1s\"").unwrap();
        let storage = connect_storage(&config).await;
        assert_eq!(storage.kv.name(), "memory");
    }

    #[tokio::test]
    async fn pipeline_from_default_config() {
        let config = parse_config("[pamphlet]\nfree_daily_requests = 2").unwrap();
        let storage = connect_storage(&config).await;
        let pipeline = build_pipeline(&config, storage.kv, None, None).await.unwrap();
        assert_eq!(pipeline.free_daily_requests, 2);
        assert!(pipeline.transport.is_none() && pipeline.billing.is_none());
        assert_eq!(pipeline.params.model, "gpt-3.5-turbo");
        assert_eq!(pipeline.artifact_dir, None);
    }

    #[tokio::test]
    async fn artifact_dir_reaches_pipeline() {
        let config = parse_config("[render]\nartifact_dir = \"/var/tmp/pamphlet\"").unwrap();
        let storage = connect_storage(&config).await;
        let pipeline = build_pipeline(&config, storage.kv, None, None).await.unwrap();
        assert_eq!(pipeline.artifact_dir.as_deref(), Some(std::path::Path::new("/var/tmp/pamphlet")));
    }

    #[tokio::test]
    async fn missing_template_is_an_error() {
        let config = parse_config("[render]\ntemplate = \"/nonexistent/template.html\"").unwrap();
        let storage = connect_storage(&config).await;
        assert!(build_pipeline(&config, storage.kv, None, None).await.is_err());
    }
}
