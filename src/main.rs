mod bot;
mod cache;
mod cli;
mod config;
mod daemon;
mod error;
mod kv;
mod llm;
mod models;
mod pipeline;
mod prompt;
mod quota;
mod render;
mod server;
mod telegram;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::{load_config, validate_config};
use crate::models::{ContentRequest, Outcome};
use crate::quota::QuotaStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.pamphlet.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Generate {
            topic,
            content_type,
            length,
            styles,
            fields,
            output,
        }) => {
            let storage = daemon::connect_storage(&config).await;
            let pipeline = daemon::build_pipeline(&config, storage.kv, None, None).await?;

            let request = ContentRequest {
                main_topic: topic,
                content_type: content_type.as_str().to_string(),
                content_length: length.as_str().to_string(),
                style_options: styles.iter().map(|s| (s.as_str().to_string(), true)).collect(),
                custom_fields: fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect(),
                ..Default::default()
            };

            match pipeline.run(&request).await.context("generating content")? {
                Outcome::Document { pdf, source } => {
                    std::fs::write(&output, &pdf).with_context(|| format!("writing PDF to {}", output.display()))?;
                    info!(path = %output.display(), bytes = pdf.len(), ?source, "wrote PDF");
                    println!("Document written to: {}", output.display());
                }
                other => anyhow::bail!("unexpected outcome without a requester: {other:?}"),
            }
        }
        Some(Commands::Usage { user_id }) => {
            let storage = daemon::connect_storage(&config).await;
            let quota = QuotaStore::new(storage.kv, config.quota_window());
            let usage = quota.usage(user_id).await;
            let reset = usage
                .reset_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "no active window".to_string());
            println!(
                "user {}: {}/{} free requests used, resets at {}",
                usage.user_id, usage.count, config.pamphlet.free_daily_requests, reset
            );
        }
        None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}
