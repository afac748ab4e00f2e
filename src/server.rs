use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

use crate::bot::{self, BotContext};
use crate::config::MessagesConfig;
use crate::error::PipelineError;
use crate::models::{ContentRequest, DeliveryOutcome, Outcome, OutcomeStatus};
use crate::pipeline::Pipeline;
use crate::telegram::{BotApi, Update};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub messages: MessagesConfig,
    pub telegram: Option<TelegramState>,
}

#[derive(Clone)]
pub struct TelegramState {
    pub bot: Arc<BotApi>,
    pub ctx: Arc<BotContext>,
    pub webhook_secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate-content", post(generate_handler))
        .route("/telegram-webhook", post(webhook_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "message": state.messages.health }))
}

async fn generate_handler(State(state): State<AppState>, Json(request): Json<ContentRequest>) -> Response {
    // Detached so a client disconnect does not abort delivery halfway.
    let pipeline = state.pipeline.clone();
    let result = match tokio::spawn(async move { pipeline.run(&request).await }).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "pipeline task failed");
            return outcome_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                OutcomeStatus::Error,
                state.messages.generation_failed.clone(),
                Some("internal_error"),
                None,
            );
        }
    };

    match result {
        Ok(Outcome::Delivered { source }) => {
            debug!(?source, "request delivered");
            outcome_response(
                StatusCode::OK,
                OutcomeStatus::Success,
                state.messages.success.clone(),
                None,
                None,
            )
        }
        Ok(Outcome::Document { pdf, .. }) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/pdf"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"content.pdf\""),
            ],
            pdf,
        )
            .into_response(),
        Ok(Outcome::PaymentRequested) => outcome_response(
            StatusCode::OK,
            OutcomeStatus::PaymentRequired,
            state.messages.payment_required.clone(),
            None,
            Some(true),
        ),
        Err(e) => error_response(&state.messages, &e),
    }
}

fn error_response(messages: &MessagesConfig, err: &PipelineError) -> Response {
    let (status, outcome, message) = match err {
        PipelineError::Validation(_) => (
            StatusCode::BAD_REQUEST,
            OutcomeStatus::Rejected,
            &messages.validation_failed,
        ),
        PipelineError::PaymentRequired => (
            StatusCode::PAYMENT_REQUIRED,
            OutcomeStatus::Rejected,
            &messages.payment_unavailable,
        ),
        PipelineError::Billing(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeStatus::Error,
            &messages.billing_failed,
        ),
        PipelineError::Generation(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeStatus::Error,
            &messages.generation_failed,
        ),
        PipelineError::Render(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeStatus::Error,
            &messages.render_failed,
        ),
        PipelineError::Delivery(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeStatus::Error,
            &messages.delivery_failed,
        ),
    };
    outcome_response(status, outcome, message.clone(), Some(err.code()), None)
}

fn outcome_response(
    status: StatusCode,
    outcome: OutcomeStatus,
    message: String,
    code: Option<&'static str>,
    invoice_sent: Option<bool>,
) -> Response {
    let body = DeliveryOutcome {
        status: outcome,
        message,
        code,
        invoice_sent,
    };
    (status, Json(body)).into_response()
}

/// The secret is checked before the body is looked at, so unauthenticated
/// callers learn nothing from parse errors.
async fn webhook_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(telegram) = state.telegram else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    if let Some(secret) = &telegram.webhook_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
        if !constant_time_eq(presented, secret) {
            warn!("webhook call with invalid secret token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "malformed webhook update");
            return (StatusCode::BAD_REQUEST, "Bad request").into_response();
        }
    };

    let update_id = update.update_id;
    tokio::spawn(async move {
        if let Err(e) = bot::handle_update(&telegram.bot, &telegram.ctx, update).await {
            warn!(update_id, error = %e, "failed to handle update");
        }
    });

    (StatusCode::OK, "ok").into_response()
}

/// Constant-time string comparison to prevent timing attacks on token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
