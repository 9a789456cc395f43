//! Telegram webhook relay.
//!
//! Accepts Telegram updates over HTTP, stores each message as a document and,
//! for private text chats, answers through the Bot API.

pub mod memory;
pub mod telegram;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use teloxide::Bot;
use tracing::{error, info, warn};

use crate::llm::LlmRegistry;
use crate::store::DocumentStore;
use memory::Intent;
use telegram::{ReplySender, TelegramMessage, TelegramReplies};

pub const DEFAULT_COLLECTION: &str = "telegram_messages";

// ── Shared state ───────────────────────────────────────────────────────────────

pub struct WebhookState {
    pub store: DocumentStore,
    pub collection: String,
    pub llm: LlmRegistry,
    /// `None` disables replies; messages are still stored.
    pub replies: Option<Arc<dyn ReplySender>>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(receive_update))
        .route("/", post(receive_update))
        .route("/health", get(health))
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "telegram_webhook"}))
}

async fn receive_update(
    State(state): State<Arc<WebhookState>>,
    Json(update): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match process_update(&state, &update).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            error!("Error processing webhook: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "detail": format!("{e:#}")})),
            )
        }
    }
}

async fn process_update(state: &WebhookState, update: &Value) -> Result<()> {
    let record = match TelegramMessage::from_update(update) {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(()),
        Err(e) => {
            // Telegram redelivers on non-2xx, so unreadable updates are acknowledged.
            warn!("Skipping update: {:#}", e);
            return Ok(());
        }
    };

    info!(
        "Message {} from chat {} ({}): {:?}",
        record.message_id, record.chat_id, record.chat_type, record.text
    );

    state
        .store
        .set(&state.collection, &record.document_id(), &record.to_document()?)
        .await?;

    if record.is_private() {
        if let Some(text) = record.text.as_deref() {
            respond(state, &record, text).await;
        }
    }
    Ok(())
}

async fn respond(state: &WebhookState, record: &TelegramMessage, text: &str) {
    let reply = match (memory::classify(text), record.user_id) {
        (Intent::ListMemories, Some(user_id)) => memory::list_memories(&state.store, user_id).await,
        (Intent::Remember(content), Some(user_id)) => {
            memory::remember(
                &state.store,
                &state.llm,
                user_id,
                content,
                &record.timestamp.to_rfc3339(),
            )
            .await
        }
        _ => memory::personalized_reply(&state.store, &state.llm, record.user_id, text).await,
    };
    telegram::reply(state.replies.as_deref(), record.chat_id, &reply).await;
}

// ── Server ─────────────────────────────────────────────────────────────────────

pub struct WebhookSettings {
    pub token: String,
    pub webhook_url: String,
    pub collection: String,
    pub host: String,
    pub port: u16,
    pub register: bool,
}

/// Validate settings, bind, register the webhook, and serve until Ctrl-C.
///
/// The webhook is only registered once the listener is bound, and is removed
/// again however serving ends.
pub async fn serve(settings: WebhookSettings, store: DocumentStore, llm: LlmRegistry) -> Result<()> {
    telegram::validate_bot_token(&settings.token)?;
    let url = telegram::validate_webhook_url(&settings.webhook_url)?;

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", settings.host, settings.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let bot = Bot::new(&settings.token);
    let state = Arc::new(WebhookState {
        store,
        collection: settings.collection,
        llm,
        replies: Some(Arc::new(TelegramReplies::new(bot.clone()))),
    });

    if settings.register {
        telegram::register_webhook(&bot, url.clone()).await?;
    } else {
        info!("Skipping webhook registration");
    }

    info!("Webhook server listening on http://{}", addr);
    info!("Telegram delivers updates to {}", url);

    let served = serve_on(listener, router(state), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutting down webhook server...");
    })
    .await;

    if settings.register {
        if let Err(e) = telegram::remove_webhook(&bot).await {
            error!("{:#}", e);
        }
    }
    served
}

/// Serve `app` on an already bound listener until `shutdown` completes.
pub async fn serve_on<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

// ── Tests ──────────────────────────────────────────────────────────────────────
