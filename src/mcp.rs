use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParams, GetPromptRequestParams, PromptMessageContent,
        ReadResourceRequestParams, ResourceContents,
    },
    service::{RoleClient, RunningService},
    transport::{ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess},
    ServiceExt,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{McpServerEntry, McpTransport};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// One argument described by a tool's JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolArgument {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<Value>,
}

impl ToolInfo {
    /// Arguments listed under `properties`, in schema order.
    pub fn arguments(&self) -> Vec<ToolArgument> {
        let Some(properties) = self.input_schema.get("properties").and_then(Value::as_object)
        else {
            return Vec::new();
        };
        let required = self.required_arguments();

        properties
            .iter()
            .map(|(name, details)| ToolArgument {
                name: name.clone(),
                kind: details
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any")
                    .to_string(),
                required: required.iter().any(|r| r == name),
                description: details
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                default: details.get("default").filter(|d| !d.is_null()).cloned(),
            })
            .collect()
    }

    pub fn required_arguments(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptArgumentInfo {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptInfo {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgumentInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub parts: Vec<String>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(&self) -> String {
        self.parts.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceBody {
    Text(String),
    /// Base64 payload as delivered by the server.
    Blob(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: Option<String>,
    pub body: ResourceBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptLine {
    pub role: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPrompt {
    pub description: Option<String>,
    pub messages: Vec<PromptLine>,
}

/// Operations the chat host needs from one MCP server.
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;
    async fn list_resources(&self) -> Result<Vec<ResourceInfo>>;
    async fn list_prompts(&self) -> Result<Vec<PromptInfo>>;
    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<ToolOutput>;
    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>>;
    async fn get_prompt(&self, name: &str, arguments: &Value) -> Result<GeneratedPrompt>;
    async fn shutdown(&self) -> Result<()>;
}

type ClientService = RunningService<RoleClient, ()>;

/// Start a fresh MCP client for the given entry.
async fn start_client(entry: &McpServerEntry) -> Result<ClientService> {
    match &entry.transport {
        McpTransport::Stdio {
            command,
            args,
            env,
            working_dir,
        } => {
            let args = args.clone();
            let env = env.clone();
            let working_dir = working_dir.clone();

            let transport = TokioChildProcess::new(Command::new(command).configure(move |cmd| {
                for arg in &args {
                    cmd.arg(arg);
                }
                for (key, value) in &env {
                    cmd.env(key, value);
                }
                if let Some(dir) = &working_dir {
                    cmd.current_dir(dir);
                }
            }))
            .with_context(|| format!("Failed to start MCP server process: {}", entry.id))?;

            ().serve(transport)
                .await
                .with_context(|| format!("Failed to initialize MCP connection: {}", entry.id))
        }
        McpTransport::Http { url } => {
            let transport = StreamableHttpClientTransport::from_uri(url.clone());
            ().serve(transport)
                .await
                .with_context(|| format!("Failed to connect to MCP server '{}' at {}", entry.id, url))
        }
    }
}

/// A live rmcp client connection to one server.
pub struct RmcpSession {
    /// Serializes requests so a stdio server never sees interleaved calls.
    client: Mutex<Option<ClientService>>,
    /// Kept for reconnecting after a crashed subprocess.
    entry: McpServerEntry,
}

impl RmcpSession {
    pub async fn connect(entry: &McpServerEntry) -> Result<Self> {
        info!(
            "Connecting to {} MCP server '{}'",
            entry.transport_label(),
            entry.id
        );
        let client = start_client(entry).await?;
        info!(
            "Connected to MCP server '{}': {:?}",
            entry.id,
            client.peer_info()
        );
        Ok(Self {
            client: Mutex::new(Some(client)),
            entry: entry.clone(),
        })
    }

    fn closed(&self) -> anyhow::Error {
        anyhow::anyhow!("MCP connection to '{}' is closed", self.entry.id)
    }
}

fn convert_tool(tool: &rmcp::model::Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: tool.schema_as_json_value(),
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| self.closed())?;
        let tools = client
            .list_all_tools()
            .await
            .with_context(|| format!("Failed to list tools from MCP server: {}", self.entry.id))?;
        Ok(tools.iter().map(convert_tool).collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| self.closed())?;
        let resources = client.list_all_resources().await.with_context(|| {
            format!("Failed to list resources from MCP server: {}", self.entry.id)
        })?;
        Ok(resources
            .into_iter()
            .map(|r| ResourceInfo {
                uri: r.raw.uri,
                name: r.raw.name,
                description: r.raw.description,
                mime_type: r.raw.mime_type,
            })
            .collect())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptInfo>> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| self.closed())?;
        let prompts = client.list_all_prompts().await.with_context(|| {
            format!("Failed to list prompts from MCP server: {}", self.entry.id)
        })?;
        Ok(prompts
            .into_iter()
            .map(|p| PromptInfo {
                name: p.name,
                description: p.description,
                arguments: p
                    .arguments
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| PromptArgumentInfo {
                        name: a.name,
                        description: a.description,
                        required: a.required.unwrap_or(false),
                    })
                    .collect(),
            })
            .collect())
    }

    /// Call a tool. If the first attempt fails on a stdio server (usually a
    /// crashed subprocess) the connection is restarted and the call retried
    /// once.
    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        let make_params = || CallToolRequestParams {
            meta: None,
            name: std::borrow::Cow::Owned(name.to_string()),
            arguments: arguments.as_object().cloned(),
            task: None,
        };

        let mut guard = self.client.lock().await;
        let first = {
            let client = guard.as_ref().ok_or_else(|| self.closed())?;
            client.call_tool(make_params()).await
        };

        let result = match first {
            Ok(r) => r,
            Err(first_err) if matches!(self.entry.transport, McpTransport::Stdio { .. }) => {
                warn!(
                    "MCP tool '{}' on server '{}' failed: {}. Reconnecting...",
                    name, self.entry.id, first_err
                );
                let fresh = start_client(&self.entry).await.with_context(|| {
                    format!("MCP server '{}' crashed and reconnect failed", self.entry.id)
                })?;
                let client = guard.insert(fresh);
                client.call_tool(make_params()).await.with_context(|| {
                    format!(
                        "Failed to call MCP tool '{}' on server '{}' after reconnect",
                        name, self.entry.id
                    )
                })?
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to call MCP tool '{}' on server '{}'", name, self.entry.id)
                })
            }
        };

        let parts = result
            .content
            .iter()
            .map(|c| match c.raw.as_text() {
                Some(t) => t.text.clone(),
                None => serde_json::to_string(&c.raw)
                    .unwrap_or_else(|_| "<unprintable content>".to_string()),
            })
            .collect();

        Ok(ToolOutput {
            parts,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| self.closed())?;
        let result = client
            .read_resource(ReadResourceRequestParams {
                meta: None,
                uri: uri.to_string(),
            })
            .await
            .with_context(|| format!("Failed to read resource '{}' from '{}'", uri, self.entry.id))?;

        Ok(result
            .contents
            .into_iter()
            .map(|c| match c {
                ResourceContents::TextResourceContents {
                    uri,
                    mime_type,
                    text,
                    ..
                } => ResourceContent {
                    uri,
                    mime_type,
                    body: ResourceBody::Text(text),
                },
                ResourceContents::BlobResourceContents {
                    uri,
                    mime_type,
                    blob,
                    ..
                } => ResourceContent {
                    uri,
                    mime_type,
                    body: ResourceBody::Blob(blob),
                },
            })
            .collect())
    }

    async fn get_prompt(&self, name: &str, arguments: &Value) -> Result<GeneratedPrompt> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or_else(|| self.closed())?;
        let result = client
            .get_prompt(GetPromptRequestParams {
                meta: None,
                name: name.to_string(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .with_context(|| format!("Failed to get prompt '{}' from '{}'", name, self.entry.id))?;

        let messages = result
            .messages
            .into_iter()
            .map(|m| {
                let role = serde_json::to_value(&m.role)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                let text = match m.content {
                    PromptMessageContent::Text { text } => text,
                    _ => "(non-text content)".to_string(),
                };
                PromptLine { role, text }
            })
            .collect();

        Ok(GeneratedPrompt {
            description: result.description,
            messages,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            client
                .cancel()
                .await
                .with_context(|| format!("Error shutting down MCP server '{}'", self.entry.id))?;
        }
        Ok(())
    }
}

/// A capability together with the server that provides it.
#[derive(Debug, Clone)]
pub struct Provided<T> {
    pub server_id: String,
    pub info: T,
}

/// Connections to every selected MCP server plus their merged capabilities.
///
/// Tools and prompts are keyed `server:name`; resources are keyed by URI.
#[derive(Default)]
pub struct McpManager {
    sessions: BTreeMap<String, Arc<dyn McpSession>>,
    tools: BTreeMap<String, Provided<ToolInfo>>,
    resources: BTreeMap<String, Provided<ResourceInfo>>,
    prompts: BTreeMap<String, Provided<PromptInfo>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&mut self, entry: &McpServerEntry) -> Result<()> {
        let session = RmcpSession::connect(entry).await?;
        self.add_session(&entry.id, Arc::new(session)).await
    }

    /// Connect to all given servers, logging errors but not failing.
    pub async fn connect_all(&mut self, entries: &[McpServerEntry]) {
        for entry in entries {
            if let Err(e) = self.connect(entry).await {
                error!("Failed to connect to MCP server '{}': {:#}", entry.id, e);
            }
        }
        info!(
            "Loaded {} tools, {} resources and {} prompts from {} servers",
            self.tools.len(),
            self.resources.len(),
            self.prompts.len(),
            self.sessions.len()
        );
    }

    /// Register a connected session and load its capabilities.
    ///
    /// Tools are required; servers that cannot list resources or prompts
    /// simply contribute none.
    pub async fn add_session(&mut self, server_id: &str, session: Arc<dyn McpSession>) -> Result<()> {
        let tools = session.list_tools().await?;
        info!("MCP server '{}' provides {} tools", server_id, tools.len());
        for tool in tools {
            info!("  Tool: {}:{}", server_id, tool.name);
            self.tools.insert(
                format!("{}:{}", server_id, tool.name),
                Provided {
                    server_id: server_id.to_string(),
                    info: tool,
                },
            );
        }

        match session.list_resources().await {
            Ok(resources) => {
                for resource in resources {
                    self.resources.insert(
                        resource.uri.clone(),
                        Provided {
                            server_id: server_id.to_string(),
                            info: resource,
                        },
                    );
                }
            }
            Err(e) => warn!("MCP server '{}' did not list resources: {:#}", server_id, e),
        }

        match session.list_prompts().await {
            Ok(prompts) => {
                for prompt in prompts {
                    self.prompts.insert(
                        format!("{}:{}", server_id, prompt.name),
                        Provided {
                            server_id: server_id.to_string(),
                            info: prompt,
                        },
                    );
                }
            }
            Err(e) => warn!("MCP server '{}' did not list prompts: {:#}", server_id, e),
        }

        self.sessions.insert(server_id.to_string(), session);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn server_ids(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    pub fn tools(&self) -> impl Iterator<Item = (&str, &Provided<ToolInfo>)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn resources(&self) -> impl Iterator<Item = (&str, &Provided<ResourceInfo>)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn prompts(&self) -> impl Iterator<Item = (&str, &Provided<PromptInfo>)> {
        self.prompts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn tool(&self, key: &str) -> Option<&ToolInfo> {
        self.tools.get(key).map(|p| &p.info)
    }

    fn session(&self, server_id: &str) -> Result<&Arc<dyn McpSession>> {
        self.sessions
            .get(server_id)
            .with_context(|| format!("Server '{server_id}' is not connected"))
    }

    pub async fn call_tool(&self, key: &str, arguments: &Value) -> Result<ToolOutput> {
        let provided = self
            .tools
            .get(key)
            .with_context(|| format!("Tool '{key}' not found"))?;
        info!("Calling MCP tool '{}' on server '{}'", provided.info.name, provided.server_id);
        self.session(&provided.server_id)?
            .call_tool(&provided.info.name, arguments)
            .await
    }

    /// Read a listed resource, or route an unlisted `server://...` URI to the
    /// server whose identifier matches the scheme.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>> {
        let server_id = match self.resources.get(uri) {
            Some(provided) => provided.server_id.as_str(),
            None => uri
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .filter(|scheme| self.sessions.contains_key(*scheme))
                .with_context(|| format!("Resource '{uri}' not found"))?,
        };
        self.session(server_id)?.read_resource(uri).await
    }

    pub async fn get_prompt(&self, key: &str, arguments: &Value) -> Result<GeneratedPrompt> {
        let provided = self
            .prompts
            .get(key)
            .with_context(|| format!("Prompt '{key}' not found"))?;
        self.session(&provided.server_id)?
            .get_prompt(&provided.info.name, arguments)
            .await
    }

    /// Shut down all MCP connections.
    pub async fn shutdown(&mut self) {
        for (id, session) in std::mem::take(&mut self.sessions) {
            info!("Shutting down MCP server: {}", id);
            if let Err(e) = session.shutdown().await {
                error!("{:#}", e);
            }
        }
        self.tools.clear();
        self.resources.clear();
        self.prompts.clear();
    }
}
