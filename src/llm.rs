use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ConfigError, LlmProviderEntry, ProviderKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// A chat-completion backend that turns one prompt into one reply.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// The configuration entry picked for chat, with its credential resolved.
#[derive(Debug, Clone)]
pub struct SelectedProvider {
    pub id: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

/// Resolve which provider entry to use.
///
/// With no explicit identifier the first enabled entry in declaration order
/// wins. The entry's credential is read through `env`.
pub fn select_provider(
    entries: &[LlmProviderEntry],
    requested: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SelectedProvider, ConfigError> {
    let entry = match requested {
        Some(id) => {
            let entry = entries
                .iter()
                .find(|e| e.id == id)
                .ok_or_else(|| ConfigError::UnknownProvider(id.to_string()))?;
            if !entry.enabled {
                return Err(ConfigError::ProviderDisabled(id.to_string()));
            }
            entry
        }
        None => entries
            .iter()
            .find(|e| e.enabled)
            .ok_or(ConfigError::NoEnabledProvider)?,
    };

    let kind: ProviderKind = entry.provider.parse()?;

    let api_key = env(&entry.api_key_env)
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingCredential {
            provider: entry.id.clone(),
            var: entry.api_key_env.clone(),
        })?;

    Ok(SelectedProvider {
        id: entry.id.clone(),
        kind,
        api_key,
        model: entry.default_model.clone(),
        base_url: entry
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string()),
        max_tokens: entry.max_tokens,
    })
}

/// OpenAI-compatible chat-completions client.
pub struct LlmClient {
    client: reqwest::Client,
    provider: SelectedProvider,
}

impl LlmClient {
    pub fn new(provider: SelectedProvider) -> Self {
        info!(
            "LLM provider '{}' ({}) initialized with model: {}",
            provider.id, provider.kind, provider.model
        );
        Self {
            client: reqwest::Client::new(),
            provider,
        }
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        let request = ChatRequest {
            model: &self.provider.model,
            messages,
            max_tokens: self.provider.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            self.provider.base_url.trim_end_matches('/')
        );
        let label = self.provider.kind;

        debug!("Sending request to {}: {}", label, url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.provider.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {label}"))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error ({}): {}", label, status, error_body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {label} response"))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .with_context(|| format!("No response from {label}"))
    }
}

#[async_trait]
impl ChatProvider for LlmClient {
    fn name(&self) -> &str {
        &self.provider.id
    }

    fn model(&self) -> &str {
        &self.provider.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let reply = self.chat(&[ChatMessage::user(prompt)]).await?;
        reply
            .content
            .filter(|c| !c.trim().is_empty())
            .with_context(|| format!("Empty response from {}", self.provider.kind))
    }
}

/// Holds the default provider, if one could be configured.
#[derive(Clone, Default)]
pub struct LlmRegistry {
    default: Option<Arc<dyn ChatProvider>>,
}

impl LlmRegistry {
    pub fn from_entries(
        entries: &[LlmProviderEntry],
        requested: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let selected = select_provider(entries, requested, |var| std::env::var(var).ok())?;
        info!("Set '{}' as the default LLM provider", selected.id);
        Ok(Self::with_provider(Arc::new(LlmClient::new(selected))))
    }

    pub fn with_provider(provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            default: Some(provider),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn has_provider(&self) -> bool {
        self.default.is_some()
    }

    pub fn provider(&self) -> Option<&Arc<dyn ChatProvider>> {
        self.default.as_ref()
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let provider = self
            .default
            .as_ref()
            .context("No LLM provider is configured")?;
        provider.generate(prompt).await
    }
}
