use anyhow::Result;

use crate::llm::ChatProvider;

/// Where a remembered statement about the user belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCategory {
    Profile,
    Preference,
    Context,
    NotApplicable,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 4] = [
        MemoryCategory::Profile,
        MemoryCategory::Preference,
        MemoryCategory::Context,
        MemoryCategory::NotApplicable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Profile => "profile",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Context => "context",
            MemoryCategory::NotApplicable => "not_applicable",
        }
    }

    /// Parse an LLM answer. Tolerates case, surrounding whitespace, quotes and
    /// a trailing period.
    pub fn parse(answer: &str) -> Option<Self> {
        let cleaned = answer
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == cleaned)
    }

    pub fn is_storable(&self) -> bool {
        *self != MemoryCategory::NotApplicable
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn memory_categorization_prompt(user_message: &str) -> String {
    format!(
        r#"You sort statements a user makes about themselves into memory types.

Choose exactly one category for the message below:

1. profile - stable personal facts such as age, birthday, gender, location or job
2. preference - lasting likes, dislikes and habits
3. context - short-lived situations and current activities
4. not_applicable - anything that should not be remembered

Examples:
- "I'm 25 years old" -> profile
- "My birthday is March 15th" -> profile
- "I don't like sweet food" -> preference
- "I prefer rock music" -> preference
- "I'm learning guitar right now" -> context
- "I'm working on a new project" -> context
- "Hello" -> not_applicable
- "How are you?" -> not_applicable

User message: "{user_message}"

Answer with the category name only (profile, preference, context or not_applicable)."#
    )
}

/// Reply prompt for the Telegram relay. `memories` is the formatted memory
/// block, if the user has any.
pub fn personalized_reply_prompt(memories: Option<&str>, user_message: &str) -> String {
    match memories {
        Some(memories) => format!(
            r#"You are a helpful AI assistant. You know a few things about the user; use them only when they matter for the current message.

{memories}

User's message: "{user_message}"

Guidelines:
- Bring up stored information only when it is directly relevant
- Answer greetings like "hi" or "hello" naturally
- Keep the reply conversational and natural"#
        ),
        None => format!(
            r#"You are a helpful AI assistant. The user has sent you a message.

User's message: "{user_message}"

Reply in a helpful, conversational way. Keep it concise and natural."#
        ),
    }
}

/// The LLM's raw answer and the category it maps to, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorization {
    pub answer: String,
    pub category: Option<MemoryCategory>,
}

pub async fn categorize_memory(provider: &dyn ChatProvider, message: &str) -> Result<Categorization> {
    let answer = provider
        .generate(&memory_categorization_prompt(message))
        .await?;
    let category = MemoryCategory::parse(&answer);
    Ok(Categorization {
        answer: answer.trim().to_string(),
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::ScriptedProvider;

    #[test]
    fn test_parse_category() {
        assert_eq!(MemoryCategory::parse("profile"), Some(MemoryCategory::Profile));
        assert_eq!(
            MemoryCategory::parse("  Preference.\n"),
            Some(MemoryCategory::Preference)
        );
        assert_eq!(
            MemoryCategory::parse("\"NOT_APPLICABLE\""),
            Some(MemoryCategory::NotApplicable)
        );
        assert_eq!(MemoryCategory::parse("it is a profile fact"), None);
        assert_eq!(MemoryCategory::parse(""), None);
    }

    #[test]
    fn test_storable() {
        assert!(MemoryCategory::Context.is_storable());
        assert!(!MemoryCategory::NotApplicable.is_storable());
    }

    #[test]
    fn test_prompts_embed_message() {
        let p = memory_categorization_prompt("I like jazz");
        assert!(p.contains("User message: \"I like jazz\""));

        let with = personalized_reply_prompt(Some("User Memories:\n• PROFILE: engineer"), "hi");
        assert!(with.contains("PROFILE: engineer"));
        assert!(with.contains("User's message: \"hi\""));

        let without = personalized_reply_prompt(None, "hi");
        assert!(!without.contains("User Memories"));
    }

    #[tokio::test]
    async fn test_categorize_memory() {
        let provider = ScriptedProvider::new(&["preference", "banana"]);
        let first = categorize_memory(provider.as_ref(), "I prefer tea").await.unwrap();
        assert_eq!(first.category, Some(MemoryCategory::Preference));

        let second = categorize_memory(provider.as_ref(), "whatever").await.unwrap();
        assert_eq!(second.category, None);
        assert_eq!(second.answer, "banana");

        assert!(provider.prompts()[0].contains("I prefer tea"));
    }
}
