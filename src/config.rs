use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

pub const LLM_PROVIDERS_FILE: &str = "llm_providers.yml";
pub const MCP_SERVERS_FILE: &str = "mcp_servers.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid entry '{id}' in {}: {reason}", path.display())]
    InvalidEntry {
        path: PathBuf,
        id: String,
        reason: String,
    },

    #[error("no LLM provider is enabled")]
    NoEnabledProvider,

    #[error("unknown LLM provider '{0}'")]
    UnknownProvider(String),

    #[error("LLM provider '{0}' is disabled")]
    ProviderDisabled(String),

    #[error("unsupported provider module '{0}' (expected groq, openai, openrouter or ollama)")]
    UnsupportedProvider(String),

    #[error("environment variable '{var}' for LLM provider '{provider}' is not set")]
    MissingCredential { provider: String, var: String },
}

/// Provider modules that can back an LLM entry. All of them accept the
/// OpenAI-compatible chat-completions request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Groq,
    Openai,
    Openrouter,
    Ollama,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::Openai => "https://api.openai.com/v1",
            ProviderKind::Openrouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "openai" => Ok(ProviderKind::Openai),
            "openrouter" => Ok(ProviderKind::Openrouter),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(ConfigError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Groq => write!(f, "groq"),
            ProviderKind::Openai => write!(f, "openai"),
            ProviderKind::Openrouter => write!(f, "openrouter"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// One entry of `llm_providers.yml`, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmProviderEntry {
    pub id: String,
    /// Provider module reference, resolved to a [`ProviderKind`] on selection.
    pub provider: String,
    pub api_key_env: String,
    pub default_model: String,
    pub enabled: bool,
    pub base_url: Option<String>,
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    provider: String,
    api_key_env: String,
    default_model: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
}

#[derive(Debug, Deserialize, Default)]
struct ProvidersFile {
    #[serde(default)]
    llm_providers: serde_yaml::Mapping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum McpTransport {
    Http {
        url: String,
    },
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
    },
}

/// One entry of `mcp_servers.yml`, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct McpServerEntry {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub transport: McpTransport,
}

impl McpServerEntry {
    /// Ad-hoc HTTP entry for commands that take a server URL directly.
    pub fn http(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            enabled: true,
            transport: McpTransport::Http {
                url: url.to_string(),
            },
        }
    }

    pub fn transport_label(&self) -> &'static str {
        match self.transport {
            McpTransport::Http { .. } => "http",
            McpTransport::Stdio { .. } => "stdio",
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
enum TransportKind {
    #[default]
    Http,
    Stdio,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    transport: TransportKind,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ServersFile {
    #[serde(default)]
    servers: serde_yaml::Mapping,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_enabled() -> bool {
    true
}

/// Locations of the YAML files inside a configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub llm_providers: PathBuf,
    pub mcp_servers: PathBuf,
}

impl ConfigPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            llm_providers: dir.join(LLM_PROVIDERS_FILE),
            mcp_servers: dir.join(MCP_SERVERS_FILE),
        }
    }
}

/// Read a config file, treating a missing file as empty.
fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file not found: {}", path.display());
            Ok(None)
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parse YAML and expand `${VAR}` placeholders in every string value.
fn parse_interpolated<T: serde::de::DeserializeOwned>(
    content: &str,
    path: &Path,
) -> Result<T, ConfigError> {
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let raw: serde_yaml::Value = serde_yaml::from_str(content).map_err(parse_err)?;
    if raw.is_null() {
        // An empty file is a valid, empty configuration.
        return serde_yaml::from_value(serde_yaml::Value::Mapping(Default::default()))
            .map_err(parse_err);
    }
    let expanded = interpolate_env(raw, &|name| std::env::var(name).ok());
    serde_yaml::from_value(expanded).map_err(parse_err)
}

fn entry_id(key: &serde_yaml::Value, path: &Path) -> Result<String, ConfigError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(ConfigError::InvalidEntry {
            path: path.to_path_buf(),
            id: format!("{other:?}"),
            reason: "identifier must be a string".to_string(),
        }),
    }
}

pub fn load_llm_providers(path: &Path) -> Result<Vec<LlmProviderEntry>, ConfigError> {
    match read_optional(path)? {
        Some(content) => parse_llm_providers(&content, path),
        None => Ok(Vec::new()),
    }
}

pub fn parse_llm_providers(
    content: &str,
    path: &Path,
) -> Result<Vec<LlmProviderEntry>, ConfigError> {
    let file: ProvidersFile = parse_interpolated(content, path)?;

    let mut entries = Vec::with_capacity(file.llm_providers.len());
    for (key, value) in file.llm_providers {
        let id = entry_id(&key, path)?;
        let raw: RawProvider =
            serde_yaml::from_value(value).map_err(|e| ConfigError::InvalidEntry {
                path: path.to_path_buf(),
                id: id.clone(),
                reason: e.to_string(),
            })?;
        debug!("LLM provider '{}' ({}), enabled={}", id, raw.provider, raw.enabled);
        entries.push(LlmProviderEntry {
            id,
            provider: raw.provider,
            api_key_env: raw.api_key_env,
            default_model: raw.default_model,
            enabled: raw.enabled,
            base_url: raw.base_url.filter(|u| !u.is_empty()),
            max_tokens: raw.max_tokens,
        });
    }

    Ok(entries)
}

pub fn load_mcp_servers(path: &Path) -> Result<Vec<McpServerEntry>, ConfigError> {
    match read_optional(path)? {
        Some(content) => parse_mcp_servers(&content, path),
        None => Ok(Vec::new()),
    }
}

pub fn parse_mcp_servers(content: &str, path: &Path) -> Result<Vec<McpServerEntry>, ConfigError> {
    let file: ServersFile = parse_interpolated(content, path)?;

    let mut entries = Vec::with_capacity(file.servers.len());
    for (key, value) in file.servers {
        let id = entry_id(&key, path)?;
        let invalid = |reason: String| ConfigError::InvalidEntry {
            path: path.to_path_buf(),
            id: id.clone(),
            reason,
        };

        let raw: RawServer = serde_yaml::from_value(value).map_err(|e| invalid(e.to_string()))?;

        let transport = match raw.transport {
            TransportKind::Http => match raw.url.filter(|u| !u.trim().is_empty()) {
                Some(url) => McpTransport::Http { url },
                None => return Err(invalid("http transport requires 'url'".to_string())),
            },
            TransportKind::Stdio => match raw.command.filter(|c| !c.trim().is_empty()) {
                Some(command) => McpTransport::Stdio {
                    command,
                    args: raw.args,
                    env: raw.env,
                    working_dir: raw.working_dir,
                },
                None => return Err(invalid("stdio transport requires 'command'".to_string())),
            },
        };

        entries.push(McpServerEntry {
            name: raw.name.unwrap_or_else(|| id.clone()),
            id,
            description: raw.description.filter(|d| !d.is_empty()),
            enabled: raw.enabled,
            transport,
        });
    }

    Ok(entries)
}

/// Pick the servers a chat session should connect to.
///
/// With no explicit list every enabled server is used. Requested identifiers
/// that are unknown or disabled are skipped with a warning.
pub fn select_servers(entries: &[McpServerEntry], requested: Option<&[String]>) -> Vec<McpServerEntry> {
    let Some(requested) = requested else {
        return entries.iter().filter(|e| e.enabled).cloned().collect();
    };

    let mut selected = Vec::new();
    for id in requested {
        match entries.iter().find(|e| &e.id == id) {
            Some(entry) if entry.enabled => {
                if !selected.iter().any(|s: &McpServerEntry| s.id == entry.id) {
                    selected.push(entry.clone());
                }
            }
            Some(_) => warn!("Skipping disabled server '{}'", id),
            None => warn!("No configuration found for server '{}'", id),
        }
    }
    selected
}

/// Recursively expand `${VAR}` placeholders in all YAML strings.
fn interpolate_env(
    value: serde_yaml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(expand_env_vars(&s, lookup)),
        serde_yaml::Value::Sequence(items) => serde_yaml::Value::Sequence(
            items
                .into_iter()
                .map(|v| interpolate_env(v, lookup))
                .collect(),
        ),
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, interpolate_env(v, lookup)))
                .collect(),
        ),
        other => other,
    }
}

/// `${VAR}` expansion without defaults. Unset variables become empty; an
/// unterminated `${` is kept literally.
pub fn expand_env_vars(s: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&lookup(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
