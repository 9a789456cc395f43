//! Per-user memories kept by the Telegram relay.
//!
//! Memories live in `users/{user_id}/memories`, one document per category,
//! each holding a `memories` array.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::llm::LlmRegistry;
use crate::prompts::{categorize_memory, personalized_reply_prompt, MemoryCategory};
use crate::store::{collection_path, DocumentStore};

const MEMORIES_FIELD: &str = "memories";

fn memories_collection(user_id: u64) -> String {
    collection_path(&["users", &user_id.to_string(), "memories"])
}

/// What a private text message asks the relay to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent<'a> {
    Remember(&'a str),
    ListMemories,
    Converse,
}

pub fn classify(text: &str) -> Intent<'_> {
    let trimmed = text.trim();
    if trimmed.starts_with("/listmemory") {
        return Intent::ListMemories;
    }
    if let Some(rest) = trimmed.strip_prefix("/memory") {
        let content = rest.trim().trim_matches('"').trim();
        if !content.is_empty() {
            return Intent::Remember(content);
        }
    }
    Intent::Converse
}

/// Categorise `content` and store it unless it is not worth remembering.
/// Returns the text to send back to the user.
pub async fn remember(
    store: &DocumentStore,
    llm: &LlmRegistry,
    user_id: u64,
    content: &str,
    timestamp: &str,
) -> String {
    let category = match llm.provider() {
        Some(provider) => match categorize_memory(provider.as_ref(), content).await {
            Ok(c) => c.category.unwrap_or(MemoryCategory::NotApplicable),
            Err(e) => {
                warn!("Memory categorization failed: {:#}", e);
                MemoryCategory::NotApplicable
            }
        },
        None => MemoryCategory::NotApplicable,
    };

    if !category.is_storable() {
        return format!("🧠 Memory: \"{content}\"\n❌ Not stored (not applicable for memory)");
    }

    let record = json!({
        "message": content,
        "user_id": user_id,
        "timestamp": timestamp,
        "command_type": "memory",
        "category": category.as_str(),
        "status": "categorized",
    });

    match store
        .append_to_array(
            &memories_collection(user_id),
            category.as_str(),
            MEMORIES_FIELD,
            record,
        )
        .await
    {
        Ok(()) => {
            info!("Stored {} memory for user {}", category, user_id);
            format!(
                "🧠 Memory: \"{content}\"\n✅ Stored as: {}\nI'll remember this information about you for our future conversations.",
                category.as_str().to_uppercase()
            )
        }
        Err(e) => format!("🧠 Memory: \"{content}\"\n❌ Error storing memory: {e:#}"),
    }
}

/// Memory texts grouped by category, in category order.
async fn load_memories(store: &DocumentStore, user_id: u64) -> Result<Vec<(String, Vec<String>)>> {
    let documents = store.list(&memories_collection(user_id)).await?;
    Ok(documents
        .into_iter()
        .map(|(category, doc)| {
            let texts: Vec<String> = doc
                .get(MEMORIES_FIELD)
                .and_then(|m| m.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|m| m.get("message").and_then(|t| t.as_str()))
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            (category, texts)
        })
        .filter(|(_, texts)| !texts.is_empty())
        .collect())
}

/// Reply text for `/listmemory`.
pub async fn list_memories(store: &DocumentStore, user_id: u64) -> String {
    let grouped = match load_memories(store, user_id).await {
        Ok(g) => g,
        Err(e) => return format!("❌ Error retrieving memories: {e:#}"),
    };

    if grouped.is_empty() {
        return "🧠 You don't have any memories stored yet.\n\nUse /memory \"your information\" to store memories!".to_string();
    }

    let mut lines = Vec::new();
    for (category, texts) in grouped {
        lines.push(format!("📁 {}:", category.to_uppercase()));
        lines.extend(texts.into_iter().map(|t| format!("• {t}")));
        lines.push(String::new());
    }
    format!("🧠 Your Memories:\n\n{}", lines.join("\n"))
}

/// The memory block given to the LLM, or `None` when nothing is stored.
pub async fn memory_context(store: &DocumentStore, user_id: u64) -> Option<String> {
    let grouped = match load_memories(store, user_id).await {
        Ok(g) => g,
        Err(e) => {
            warn!("Could not load memories for user {}: {:#}", user_id, e);
            return None;
        }
    };

    let lines: Vec<String> = grouped
        .into_iter()
        .flat_map(|(category, texts)| {
            let label = category.to_uppercase();
            texts.into_iter().map(move |t| format!("• {label}: {t}"))
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(format!("User Memories:\n{}", lines.join("\n")))
    }
}

/// Answer a message with the LLM, using stored memories when there are any.
/// Without a provider the message is echoed back.
pub async fn personalized_reply(
    store: &DocumentStore,
    llm: &LlmRegistry,
    user_id: Option<u64>,
    text: &str,
) -> String {
    if !llm.has_provider() {
        return text.to_string();
    }

    let memories = match user_id {
        Some(id) => memory_context(store, id).await,
        None => None,
    };
    let prompt = personalized_reply_prompt(memories.as_deref(), text);

    match llm.generate(&prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("LLM reply failed: {:#}", e);
            format!(
                "I'm sorry, I'm having trouble processing your request right now. Here's what you said: {text}"
            )
        }
    }
}
