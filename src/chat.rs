//! Interactive terminal chat: slash-commands go to MCP servers, everything
//! else to the default LLM provider.

use std::future::Future;
use std::io::Write;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::commands::{parse_input, Address, Command, Input, HELP};
use crate::llm::LlmRegistry;
use crate::mcp::{McpManager, ResourceBody};
use crate::prompts::{categorize_memory, memory_categorization_prompt, MemoryCategory};
use crate::routing::{build_routing_prompt, parse_decision, validate_arguments};

const RULE: &str = "----------------------------------------";
const NO_PROVIDER: &str = "LLM provider is not configured. Please check your 'config/llm_providers.yml' and ensure API keys are set.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct ChatSession<W: Write> {
    mcp: McpManager,
    llm: LlmRegistry,
    out: W,
}

impl<W: Write> ChatSession<W> {
    pub fn new(mcp: McpManager, llm: LlmRegistry, out: W) -> Self {
        Self { mcp, llm, out }
    }

    pub fn banner(&mut self) -> Result<()> {
        let line = "=".repeat(50);
        writeln!(self.out, "\n{line}")?;
        writeln!(self.out, "Simpli5 Chat Interface")?;
        writeln!(self.out, "{line}")?;
        match self.llm.provider() {
            Some(p) => writeln!(self.out, "LLM: {} ({})", p.name(), p.model())?,
            None => writeln!(self.out, "LLM: not configured (commands still work)")?,
        }
        let servers = self.mcp.server_ids();
        if servers.is_empty() {
            writeln!(self.out, "MCP servers: none connected")?;
        } else {
            writeln!(self.out, "MCP servers: {}", servers.join(", "))?;
        }
        writeln!(self.out, "Type a message to chat with the AI, or /help for commands.")?;
        writeln!(self.out, "Type /exit to quit")?;
        writeln!(self.out, "{line}")?;
        Ok(())
    }

    /// Read lines until EOF, `/exit` or Ctrl-C, then close MCP connections.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        self.run_until(input, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`run`](Self::run), but stops when `interrupt` completes, whether
    /// the session is waiting for input or busy with a command.
    pub async fn run_until<R, F>(&mut self, input: R, interrupt: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let result = self.read_loop(input, interrupt).await;
        writeln!(self.out, "\nShutting down chat interface...")?;
        self.mcp.shutdown().await;
        writeln!(self.out, "Chat interface stopped.")?;
        result
    }

    async fn read_loop<R, F>(&mut self, input: R, interrupt: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        // One listener for the whole session, so a signal during a slow
        // command is not lost between iterations.
        tokio::pin!(interrupt);
        let mut lines = input.lines();
        loop {
            write!(self.out, "\n> ")?;
            self.out.flush()?;

            let line = tokio::select! {
                line = lines.next_line() => Some(line.context("Failed to read input")?),
                _ = &mut interrupt => None,
            };
            let line = match line {
                Some(Some(line)) => line,
                Some(None) => return Ok(()),
                None => {
                    writeln!(self.out)?;
                    return Ok(());
                }
            };

            let flow = tokio::select! {
                flow = self.handle_line(&line) => Some(flow?),
                _ = &mut interrupt => None,
            };
            match flow {
                Some(Flow::Continue) => {}
                Some(Flow::Exit) => return Ok(()),
                None => {
                    writeln!(self.out, "\nInterrupted.")?;
                    return Ok(());
                }
            }
        }
    }

    /// Handle one input line. Only output failures are returned as errors;
    /// everything else is reported to the user and the session continues.
    pub async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        match parse_input(line) {
            Ok(Input::Empty) => {}
            Ok(Input::Chat(text)) => self.converse(&text).await?,
            Ok(Input::Command(command)) => return self.run_command(command).await,
            Err(e) => writeln!(self.out, "{e}")?,
        }
        Ok(Flow::Continue)
    }

    async fn run_command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Help => writeln!(self.out, "\n{HELP}")?,
            Command::Tools => self.show_tools()?,
            Command::Resources => self.show_resources()?,
            Command::Prompts => self.show_prompts()?,
            Command::Call { target, arguments } => self.call_tool(&target, &arguments).await?,
            Command::Read { uri } => self.read_resource(&uri).await?,
            Command::Generate { target, arguments } => {
                self.generate_prompt(&target, &arguments).await?
            }
            Command::Memory { text } => self.categorize(&text).await?,
            Command::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    // ── Listings ───────────────────────────────────────────────────────────────

    fn show_tools(&mut self) -> Result<()> {
        if !self.mcp.is_connected() {
            writeln!(self.out, "Not connected to any servers.")?;
            return Ok(());
        }
        let count = self.mcp.tools().count();
        if count == 0 {
            writeln!(self.out, "No tools available.")?;
            return Ok(());
        }

        writeln!(self.out, "\nAvailable Tools ({count} total):")?;
        for (key, provided) in self.mcp.tools() {
            writeln!(self.out, "{RULE}")?;
            writeln!(self.out, "• {key}")?;
            writeln!(self.out, "  (from: {})", provided.server_id)?;
            if let Some(desc) = &provided.info.description {
                writeln!(self.out, "\n  {desc}")?;
            }
            let arguments = provided.info.arguments();
            if !arguments.is_empty() {
                writeln!(self.out, "\n  Arguments:")?;
                for arg in arguments {
                    let required = if arg.required { " (required)" } else { "" };
                    let default = arg
                        .default
                        .map(|d| format!(" (default: {d})"))
                        .unwrap_or_default();
                    writeln!(self.out, "    - {} [{}]{required}{default}", arg.name, arg.kind)?;
                    writeln!(
                        self.out,
                        "      {}",
                        arg.description.as_deref().unwrap_or("No description.")
                    )?;
                }
            }
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn show_resources(&mut self) -> Result<()> {
        if !self.mcp.is_connected() {
            writeln!(self.out, "Not connected to any servers.")?;
            return Ok(());
        }
        let count = self.mcp.resources().count();
        if count == 0 {
            writeln!(self.out, "No resources available.")?;
            return Ok(());
        }

        writeln!(self.out, "\nAvailable Resources ({count} total):")?;
        writeln!(self.out, "{RULE}")?;
        for (uri, provided) in self.mcp.resources() {
            writeln!(self.out, "• {uri}")?;
            if !provided.info.name.is_empty() {
                writeln!(self.out, "  {}", provided.info.name)?;
            }
            if let Some(desc) = &provided.info.description {
                writeln!(self.out, "  {desc}")?;
            }
            if let Some(mime) = &provided.info.mime_type {
                writeln!(self.out, "  MIME: {mime}")?;
            }
            writeln!(self.out, "  Server: {}", provided.server_id)?;
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn show_prompts(&mut self) -> Result<()> {
        if !self.mcp.is_connected() {
            writeln!(self.out, "Not connected to any servers.")?;
            return Ok(());
        }
        let count = self.mcp.prompts().count();
        if count == 0 {
            writeln!(self.out, "No prompts available.")?;
            return Ok(());
        }

        writeln!(self.out, "\nAvailable Prompts ({count} total):")?;
        writeln!(self.out, "{RULE}")?;
        for (key, provided) in self.mcp.prompts() {
            writeln!(self.out, "• {key}")?;
            if let Some(desc) = &provided.info.description {
                writeln!(self.out, "  {desc}")?;
            }
            for arg in &provided.info.arguments {
                let required = if arg.required { " (required)" } else { "" };
                match &arg.description {
                    Some(desc) => writeln!(self.out, "    - {}{required}: {desc}", arg.name)?,
                    None => writeln!(self.out, "    - {}{required}", arg.name)?,
                }
            }
        }
        Ok(())
    }

    // ── MCP operations ─────────────────────────────────────────────────────────

    async fn call_tool(&mut self, target: &Address, arguments: &Value) -> Result<()> {
        let key = target.to_string();
        if self.mcp.tool(&key).is_none() {
            writeln!(self.out, "❌ Tool '{key}' not found.")?;
            writeln!(self.out, "Available tools:")?;
            let keys: Vec<String> = self.mcp.tools().map(|(k, _)| k.to_string()).collect();
            for k in keys {
                writeln!(self.out, "  - {k}")?;
            }
            writeln!(
                self.out,
                "\n💡 Tip: Make sure the server with this tool is running."
            )?;
            return Ok(());
        }

        match self.mcp.call_tool(&key, arguments).await {
            Ok(output) => {
                let label = if output.is_error { "Tool Error" } else { "Tool Result" };
                writeln!(self.out, "\n{label}:")?;
                writeln!(self.out, "{}", output.text())?;
            }
            Err(e) => writeln!(self.out, "Error calling tool: {e:#}")?,
        }
        Ok(())
    }

    async fn read_resource(&mut self, uri: &str) -> Result<()> {
        let contents = match self.mcp.read_resource(uri).await {
            Ok(c) => c,
            Err(e) => {
                writeln!(self.out, "Error reading resource: {e:#}")?;
                return Ok(());
            }
        };

        for content in contents {
            let mime = content.mime_type.as_deref().unwrap_or("unknown");
            writeln!(self.out, "\nResource Content (MIME: {mime}):")?;
            writeln!(self.out, "{RULE}")?;
            match content.body {
                ResourceBody::Text(text) => writeln!(self.out, "{text}")?,
                ResourceBody::Blob(blob) => {
                    writeln!(self.out, "(binary content, {} base64 characters)", blob.len())?
                }
            }
        }
        Ok(())
    }

    async fn generate_prompt(&mut self, target: &Address, arguments: &Value) -> Result<()> {
        match self.mcp.get_prompt(&target.to_string(), arguments).await {
            Ok(prompt) => {
                writeln!(self.out, "\nGenerated Prompt:")?;
                writeln!(self.out, "{RULE}")?;
                if let Some(desc) = &prompt.description {
                    writeln!(self.out, "{desc}")?;
                }
                for message in prompt.messages {
                    writeln!(self.out, "[{}]", message.role.to_uppercase())?;
                    writeln!(self.out, "{}", message.text)?;
                }
            }
            Err(e) => writeln!(self.out, "Error generating prompt: {e:#}")?,
        }
        Ok(())
    }

    // ── LLM ────────────────────────────────────────────────────────────────────

    /// Categorise a memory with the LLM. Chat mode only reports the result.
    async fn categorize(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "\n🧠 Processing memory: \"{text}\"")?;
        writeln!(self.out, "📋 Generated prompt:")?;
        writeln!(self.out, "{RULE}")?;
        writeln!(self.out, "{}", memory_categorization_prompt(text))?;
        writeln!(self.out, "{RULE}")?;

        let Some(provider) = self.llm.provider().cloned() else {
            writeln!(self.out, "❌ {NO_PROVIDER}")?;
            return Ok(());
        };

        writeln!(self.out, "🤖 Sending to LLM for categorization...")?;
        match categorize_memory(provider.as_ref(), text).await {
            Ok(result) => match result.category {
                Some(MemoryCategory::NotApplicable) => {
                    writeln!(self.out, "✅ Memory categorized as: NOT_APPLICABLE")?;
                    writeln!(
                        self.out,
                        "ℹ️  Message categorized as 'not_applicable' - not stored (not applicable)"
                    )?;
                }
                Some(category) => {
                    writeln!(
                        self.out,
                        "✅ Memory categorized as: {}",
                        category.as_str().to_uppercase()
                    )?;
                    writeln!(self.out, "🏷️  Category: {category}")?;
                    writeln!(
                        self.out,
                        "💾 Would store in: users/{{user_id}}/memories/{category}/"
                    )?;
                }
                None => {
                    writeln!(
                        self.out,
                        "⚠️  LLM returned invalid category: '{}'",
                        result.answer
                    )?;
                    let valid: Vec<&str> = MemoryCategory::ALL.iter().map(|c| c.as_str()).collect();
                    writeln!(self.out, "🔍 Valid categories: {}", valid.join(", "))?;
                }
            },
            Err(e) => writeln!(self.out, "❌ Error processing memory: {e:#}")?,
        }
        Ok(())
    }

    async fn converse(&mut self, text: &str) -> Result<()> {
        if !self.llm.has_provider() {
            writeln!(self.out, "\n{NO_PROVIDER}")?;
            writeln!(self.out, "You can still use commands like /help, /tools, etc.")?;
            return Ok(());
        }

        writeln!(self.out, "\n🤔 Thinking...")?;
        if self.mcp.tools().next().is_some() && self.route_through_tools(text).await? {
            return Ok(());
        }
        self.direct_reply(text).await
    }

    /// Ask the LLM which tools to call and run them. Returns `false` when
    /// the request should be answered directly instead.
    async fn route_through_tools(&mut self, text: &str) -> Result<bool> {
        let prompt = build_routing_prompt(self.mcp.tools().map(|(k, p)| (k, &p.info)), text);

        let answer = match self.llm.generate(&prompt).await {
            Ok(a) => a,
            Err(e) => {
                warn!("Tool routing failed: {:#}", e);
                writeln!(self.out, "❌ Error in tool routing: {e:#}")?;
                writeln!(self.out, "🔄 Falling back to direct LLM response...")?;
                return Ok(false);
            }
        };

        let decision = match parse_decision(&answer) {
            Ok(d) => d,
            Err(e) => {
                debug!("Unparsable routing answer {:?}: {:#}", answer, e);
                writeln!(
                    self.out,
                    "❌ Failed to parse LLM routing response, falling back to direct response..."
                )?;
                return Ok(false);
            }
        };

        if decision.tool_calls.is_empty() {
            if let Some(reason) = decision.fallback {
                writeln!(self.out, "ℹ️  {reason}")?;
            }
            writeln!(self.out, "🔄 Falling back to direct LLM response...")?;
            return Ok(false);
        }

        writeln!(self.out, "🔧 Executing tools...")?;
        for call in decision.tool_calls {
            writeln!(self.out, "📞 Calling tool: {}", call.tool_name)?;
            writeln!(self.out, "📝 Arguments: {}", call.arguments)?;

            let Some(tool) = self.mcp.tool(&call.tool_name) else {
                writeln!(self.out, "❌ Tool '{}' not found in available tools", call.tool_name)?;
                continue;
            };
            if let Err(e) = validate_arguments(tool, &call.arguments) {
                writeln!(self.out, "❌ Tool arguments validation failed for {}: {e}", call.tool_name)?;
                continue;
            }

            match self.mcp.call_tool(&call.tool_name, &call.arguments).await {
                Ok(output) => writeln!(self.out, "✅ Tool result: {}", output.text())?,
                Err(e) => writeln!(self.out, "❌ Tool call failed: {e:#}")?,
            }
        }
        writeln!(
            self.out,
            "\n✅ Tool execution completed. You can ask another question or request."
        )?;
        Ok(true)
    }

    async fn direct_reply(&mut self, text: &str) -> Result<()> {
        match self.llm.generate(text).await {
            Ok(reply) => writeln!(self.out, "\n🤖 AI:\n{reply}")?,
            Err(e) => writeln!(self.out, "❌ LLM error: {e:#}")?,
        }
        Ok(())
    }

    #[cfg(test)]
    fn output(&self) -> &W {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::ScriptedProvider;
    use crate::mcp::tests::{calculator_tool, FakeSession};
    use crate::mcp::{PromptInfo, ResourceInfo};
    use serde_json::json;
    use std::sync::{Arc, Mutex as StdMutex};

    async fn manager_with_calculator() -> (McpManager, Arc<FakeSession>) {
        let session = FakeSession::with_tools(vec![calculator_tool()]);
        let mut manager = McpManager::new();
        manager.add_session("local", session.clone()).await.unwrap();
        (manager, session)
    }

    fn text(session: &ChatSession<Vec<u8>>) -> String {
        String::from_utf8(session.output().clone()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_session_running() {
        let mut chat = ChatSession::new(McpManager::new(), LlmRegistry::unavailable(), Vec::new());
        let flow = chat.handle_line("/frobnicate").await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(text(&chat).contains("Unknown command: /frobnicate"));
    }

    #[tokio::test]
    async fn test_exit_and_quit() {
        let mut chat = ChatSession::new(McpManager::new(), LlmRegistry::unavailable(), Vec::new());
        assert_eq!(chat.handle_line("/exit").await.unwrap(), Flow::Exit);
        assert_eq!(chat.handle_line("/quit").await.unwrap(), Flow::Exit);
        assert_eq!(chat.handle_line("").await.unwrap(), Flow::Continue);
    }

    #[tokio::test]
    async fn test_free_text_without_provider() {
        let mut chat = ChatSession::new(McpManager::new(), LlmRegistry::unavailable(), Vec::new());
        chat.handle_line("hello there").await.unwrap();
        assert!(text(&chat).contains("LLM provider is not configured"));
    }

    #[tokio::test]
    async fn test_call_tool_by_address() {
        let (manager, session) = manager_with_calculator().await;
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());

        chat.handle_line(r#"/call local:calculator {"operation": "add", "a": 5, "b": 3}"#)
            .await
            .unwrap();

        assert_eq!(
            session.calls(),
            vec![(
                "calculator".to_string(),
                json!({"operation": "add", "a": 5, "b": 3})
            )]
        );
        assert!(text(&chat).contains("Tool Result:\ncalculator ok"));
    }

    #[tokio::test]
    async fn test_call_unknown_tool_lists_available() {
        let (manager, session) = manager_with_calculator().await;
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());

        chat.handle_line("/call local:weather {}").await.unwrap();

        let out = text(&chat);
        assert!(out.contains("❌ Tool 'local:weather' not found."));
        assert!(out.contains("  - local:calculator"));
        assert!(session.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tools_listing_shows_arguments() {
        let (manager, _) = manager_with_calculator().await;
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());
        chat.handle_line("/tools").await.unwrap();

        let out = text(&chat);
        assert!(out.contains("Available Tools (1 total):"));
        assert!(out.contains("• local:calculator"));
        assert!(out.contains("    - a [number] (required)"));
        assert!(out.contains("    - b [number] (default: 0)"));
    }

    #[tokio::test]
    async fn test_listings_when_not_connected() {
        let mut chat = ChatSession::new(McpManager::new(), LlmRegistry::unavailable(), Vec::new());
        chat.handle_line("/tools").await.unwrap();
        chat.handle_line("/resources").await.unwrap();
        chat.handle_line("/prompts").await.unwrap();
        assert_eq!(text(&chat).matches("Not connected to any servers.").count(), 3);
    }

    #[tokio::test]
    async fn test_read_and_generate() {
        let session = Arc::new(FakeSession {
            tools: Vec::new(),
            resources: Some(vec![ResourceInfo {
                uri: "system://info".to_string(),
                name: "System info".to_string(),
                description: None,
                mime_type: Some("text/plain".to_string()),
            }]),
            prompts: Some(vec![PromptInfo {
                name: "summary".to_string(),
                description: Some("Summarize a topic".to_string()),
                arguments: Vec::new(),
            }]),
            calls: StdMutex::new(Vec::new()),
            reads: StdMutex::new(Vec::new()),
            closed: StdMutex::new(false),
        });
        let mut manager = McpManager::new();
        manager.add_session("local", session).await.unwrap();
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());

        chat.handle_line("/resources").await.unwrap();
        chat.handle_line("/read system://info").await.unwrap();
        chat.handle_line(r#"/generate local:summary {"topic": "rust"}"#)
            .await
            .unwrap();
        chat.handle_line("/generate local:missing").await.unwrap();

        let out = text(&chat);
        assert!(out.contains("• system://info\n  System info\n  MIME: text/plain\n  Server: local"));
        assert!(out.contains("Resource Content (MIME: text/plain):"));
        assert!(out.contains("contents of system://info"));
        assert!(out.contains("[USER]\nsummary: {\"topic\":\"rust\"}"));
        assert!(out.contains("Error generating prompt: Prompt 'local:missing' not found"));
    }

    #[tokio::test]
    async fn test_free_text_routes_to_tool() {
        let (manager, session) = manager_with_calculator().await;
        let provider = ScriptedProvider::new(&[
            r#"```json
{"tool_calls": [{"tool_name": "local:calculator", "arguments": {"operation": "add", "a": 2, "b": 3}}]}
```"#,
        ]);
        let mut chat = ChatSession::new(manager, LlmRegistry::with_provider(provider), Vec::new());

        chat.handle_line("what is 2 plus 3?").await.unwrap();

        assert_eq!(session.calls().len(), 1);
        assert!(text(&chat).contains("✅ Tool result: calculator ok"));
    }

    #[tokio::test]
    async fn test_invalid_routed_arguments_are_not_called() {
        let (manager, session) = manager_with_calculator().await;
        let provider = ScriptedProvider::new(&[
            r#"{"tool_calls": [{"tool_name": "local:calculator", "arguments": {"a": "two"}}]}"#,
        ]);
        let mut chat = ChatSession::new(manager, LlmRegistry::with_provider(provider), Vec::new());

        chat.handle_line("add two").await.unwrap();

        assert!(session.calls().is_empty());
        assert!(text(&chat).contains("validation failed for local:calculator"));
    }

    #[tokio::test]
    async fn test_routing_fallback_to_direct_reply() {
        let (manager, session) = manager_with_calculator().await;
        let provider = ScriptedProvider::new(&[
            r#"{"tool_calls": [], "fallback": "small talk"}"#,
            "Hi! How can I help?",
        ]);
        let mut chat =
            ChatSession::new(manager, LlmRegistry::with_provider(provider.clone()), Vec::new());

        chat.handle_line("hello").await.unwrap();

        let out = text(&chat);
        assert!(out.contains("ℹ️  small talk"));
        assert!(out.contains("🤖 AI:\nHi! How can I help?"));
        assert!(session.calls().is_empty());
        assert_eq!(provider.prompts()[1], "hello");
    }

    #[tokio::test]
    async fn test_unparsable_routing_falls_back() {
        let (manager, _) = manager_with_calculator().await;
        let provider = ScriptedProvider::new(&["not json at all", "direct answer"]);
        let mut chat = ChatSession::new(manager, LlmRegistry::with_provider(provider), Vec::new());

        chat.handle_line("hello").await.unwrap();
        assert!(text(&chat).contains("🤖 AI:\ndirect answer"));
    }

    #[tokio::test]
    async fn test_no_tools_means_direct_reply() {
        let provider = ScriptedProvider::new(&["pong"]);
        let mut chat = ChatSession::new(
            McpManager::new(),
            LlmRegistry::with_provider(provider.clone()),
            Vec::new(),
        );
        chat.handle_line("ping").await.unwrap();
        assert!(text(&chat).contains("🤖 AI:\npong"));
        assert_eq!(provider.prompts(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_llm_error_does_not_end_session() {
        let provider = ScriptedProvider::new(&[]);
        let mut chat =
            ChatSession::new(McpManager::new(), LlmRegistry::with_provider(provider), Vec::new());
        let flow = chat.handle_line("ping").await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(text(&chat).contains("❌ LLM error"));
    }

    #[tokio::test]
    async fn test_memory_categorization_in_chat() {
        let provider = ScriptedProvider::new(&["profile", "maybe"]);
        let mut chat =
            ChatSession::new(McpManager::new(), LlmRegistry::with_provider(provider), Vec::new());

        chat.handle_line("/memory \"I'm a software engineer\"").await.unwrap();
        chat.handle_line("/memory hmm").await.unwrap();

        let out = text(&chat);
        assert!(out.contains("✅ Memory categorized as: PROFILE"));
        assert!(out.contains("⚠️  LLM returned invalid category: 'maybe'"));
    }

    #[tokio::test]
    async fn test_run_until_eof_shuts_down_servers() {
        let (manager, session) = manager_with_calculator().await;
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());

        let input: &[u8] = b"/help\n/tools\n";
        chat.run(input).await.unwrap();

        let out = text(&chat);
        assert!(out.contains("Available Commands:"));
        assert!(out.contains("Chat interface stopped."));
        assert!(*session.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_at_exit() {
        let (manager, session) = manager_with_calculator().await;
        let mut chat = ChatSession::new(manager, LlmRegistry::unavailable(), Vec::new());

        let input: &[u8] = b"/exit\n/call local:calculator {\"operation\": \"add\", \"a\": 1}\n";
        chat.run(input).await.unwrap();

        assert!(session.calls().is_empty());
        assert!(*session.closed.lock().unwrap());
    }

    /// Never answers, like a provider behind a dead connection.
    struct StalledProvider;

    #[async_trait::async_trait]
    impl crate::llm::ChatProvider for StalledProvider {
        fn name(&self) -> &str {
            "stalled"
        }

        fn model(&self) -> &str {
            "stalled-model"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_interrupt_during_slow_reply() {
        let (manager, session) = manager_with_calculator().await;
        let llm = LlmRegistry::with_provider(Arc::new(StalledProvider));
        let mut chat = ChatSession::new(manager, llm, Vec::new());

        let input: &[u8] = b"what is 2 + 2?\n/tools\n";
        chat.run_until(input, tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await
            .unwrap();

        let out = text(&chat);
        assert!(out.contains("Interrupted."));
        assert!(!out.contains("Available Tools"));
        assert!(out.contains("Chat interface stopped."));
        assert!(*session.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_interrupt_while_waiting_for_input() {
        let (reader, _writer) = tokio::io::duplex(64);
        let mut chat = ChatSession::new(McpManager::new(), LlmRegistry::unavailable(), Vec::new());

        chat.run_until(
            tokio::io::BufReader::new(reader),
            tokio::time::sleep(std::time::Duration::from_millis(20)),
        )
        .await
        .unwrap();

        assert!(text(&chat).contains("Chat interface stopped."));
    }
}
