mod chat;
mod commands;
mod config;
mod llm;
mod mcp;
mod prompts;
mod routing;
mod store;
mod webhook;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::ChatSession;
use crate::config::{load_llm_providers, load_mcp_servers, select_servers, ConfigPaths, McpServerEntry};
use crate::llm::LlmRegistry;
use crate::mcp::{McpManager, McpSession, ResourceBody, RmcpSession};
use crate::store::DocumentStore;
use crate::webhook::{WebhookSettings, DEFAULT_COLLECTION};

#[derive(Parser)]
#[command(name = "simpli5", version, about = "Chat with LLMs and MCP servers, relay Telegram messages")]
struct Cli {
    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error, off)
    #[arg(long, global = true, value_parser = parse_log_level)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Comma-separated server identifiers (default: every enabled server)
        #[arg(long, value_delimiter = ',')]
        servers: Option<Vec<String>>,

        /// LLM provider identifier (default: first enabled provider)
        #[arg(long)]
        provider: Option<String>,

        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
    },

    /// Run the Telegram webhook relay
    Webhook {
        #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
        telegram_token: String,

        /// Public HTTPS URL Telegram should deliver updates to
        #[arg(long, env = "WEBHOOK_URL")]
        webhook_url: String,

        #[arg(long, default_value = DEFAULT_COLLECTION)]
        collection_name: String,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// SQLite file backing the document store
        #[arg(long, env = "SIMPLI5_DATABASE", default_value = "simpli5.db")]
        database: PathBuf,

        /// Do not call setWebhook/deleteWebhook
        #[arg(long)]
        skip_register: bool,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
    },

    /// List tools of one HTTP MCP server
    ListTools {
        #[arg(long)]
        server: String,
    },

    /// Call a tool on one HTTP MCP server
    CallTool {
        #[arg(long)]
        server: String,

        #[arg(long)]
        tool: String,

        /// JSON object of arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// List resources of one HTTP MCP server
    ListResources {
        #[arg(long)]
        server: String,
    },

    /// Read a resource from one HTTP MCP server
    ReadResource {
        #[arg(long)]
        server: String,

        #[arg(long)]
        uri: String,
    },
}

/// Accepts tracing level names as well as `WARNING` and `CRITICAL`.
fn parse_log_level(value: &str) -> Result<LevelFilter, String> {
    let normalized = match value.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    LevelFilter::from_str(&normalized).map_err(|_| {
        format!("unknown log level '{value}' (expected trace, debug, info, warn, error or off)")
    })
}

fn init_logging(level: LevelFilter) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so env-backed flags see it
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Webhook { .. } => LevelFilter::INFO,
        _ => LevelFilter::WARN,
    };
    init_logging(cli.log_level.unwrap_or(default_level));

    match cli.command {
        Commands::Chat {
            servers,
            provider,
            config_dir,
        } => run_chat(servers, provider, &config_dir).await,
        Commands::Webhook {
            telegram_token,
            webhook_url,
            collection_name,
            host,
            port,
            database,
            skip_register,
            provider,
            config_dir,
        } => {
            let settings = WebhookSettings {
                token: telegram_token,
                webhook_url,
                collection: collection_name,
                host,
                port,
                register: !skip_register,
            };
            run_webhook(settings, &database, provider, &config_dir).await
        }
        Commands::ListTools { server } => list_tools(&server).await,
        Commands::CallTool { server, tool, args } => call_tool(&server, &tool, &args).await,
        Commands::ListResources { server } => list_resources(&server).await,
        Commands::ReadResource { server, uri } => read_resource(&server, &uri).await,
    }
}

/// Build the LLM registry. An explicitly requested provider must work; the
/// implicit default may be missing, in which case LLM features are disabled.
fn load_llm(paths: &ConfigPaths, requested: Option<&str>) -> Result<LlmRegistry> {
    let providers = load_llm_providers(&paths.llm_providers)?;
    match LlmRegistry::from_entries(&providers, requested) {
        Ok(registry) => Ok(registry),
        Err(e) if requested.is_none() => {
            warn!("LLM disabled: {}", e);
            Ok(LlmRegistry::unavailable())
        }
        Err(e) => Err(e).context("Failed to configure the requested LLM provider"),
    }
}

async fn run_chat(servers: Option<Vec<String>>, provider: Option<String>, config_dir: &Path) -> Result<()> {
    let paths = ConfigPaths::in_dir(config_dir);

    println!("Initializing LLM providers...");
    let llm = load_llm(&paths, provider.as_deref())?;

    let entries = load_mcp_servers(&paths.mcp_servers)?;
    let selected = select_servers(&entries, servers.as_deref());

    let mut mcp = McpManager::new();
    if selected.is_empty() {
        println!("No servers configured. Please check your config/mcp_servers.yml file.");
    } else {
        let ids: Vec<&str> = selected.iter().map(|e| e.id.as_str()).collect();
        println!("Connecting to servers: {}", ids.join(", "));
        mcp.connect_all(&selected).await;
    }

    let mut session = ChatSession::new(mcp, llm, std::io::stdout());
    session.banner()?;
    session
        .run(tokio::io::BufReader::new(tokio::io::stdin()))
        .await
}

async fn run_webhook(
    settings: WebhookSettings,
    database: &Path,
    provider: Option<String>,
    config_dir: &Path,
) -> Result<()> {
    if std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS").is_some() {
        warn!(
            "GOOGLE_APPLICATION_CREDENTIALS is set but ignored; messages are stored in {}",
            database.display()
        );
    }

    let llm = load_llm(&ConfigPaths::in_dir(config_dir), provider.as_deref())?;
    if !llm.has_provider() {
        warn!("No LLM provider available; memory categorization is disabled and replies echo the message");
    }

    let store = DocumentStore::open(database)?;
    info!(
        "Storing Telegram messages in collection '{}'",
        settings.collection
    );
    webhook::serve(settings, store, llm).await
}

// ── Single-server utilities ────────────────────────────────────────────────────

async fn connect_single(url: &str) -> Result<RmcpSession> {
    RmcpSession::connect(&McpServerEntry::http("cli", url))
        .await
        .with_context(|| format!("Failed to connect to {url}"))
}

async fn list_tools(url: &str) -> Result<()> {
    let session = connect_single(url).await?;
    let result = session.list_tools().await;
    session.shutdown().await?;

    let tools = result?;
    println!("Available tools ({}):", tools.len());
    for tool in tools {
        println!(
            "  - {}: {}",
            tool.name,
            tool.description.as_deref().unwrap_or("No description.")
        );
    }
    Ok(())
}

async fn call_tool(url: &str, tool: &str, args: &str) -> Result<()> {
    let arguments: Value = serde_json::from_str(args).context("Invalid JSON in --args")?;
    if !arguments.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }

    let session = connect_single(url).await?;
    let result = session.call_tool(tool, &arguments).await;
    session.shutdown().await?;

    let output = result?;
    if output.is_error {
        println!("Tool returned an error:");
    }
    println!("{}", output.text());
    Ok(())
}

async fn list_resources(url: &str) -> Result<()> {
    let session = connect_single(url).await?;
    let result = session.list_resources().await;
    session.shutdown().await?;

    let resources = result?;
    println!("Available resources ({}):", resources.len());
    for resource in resources {
        println!("  - {} ({})", resource.uri, resource.name);
    }
    Ok(())
}

async fn read_resource(url: &str, uri: &str) -> Result<()> {
    let session = connect_single(url).await?;
    let result = session.read_resource(uri).await;
    session.shutdown().await?;

    for content in result? {
        println!(
            "Resource Content (MIME: {}):",
            content.mime_type.as_deref().unwrap_or("unknown")
        );
        match content.body {
            ResourceBody::Text(text) => println!("{text}"),
            ResourceBody::Blob(blob) => println!("(binary content, {} base64 characters)", blob.len()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_chat_flags() {
        let cli = Cli::try_parse_from([
            "simpli5",
            "chat",
            "--servers",
            "local,remote",
            "--provider",
            "groq",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
        match cli.command {
            Commands::Chat {
                servers,
                provider,
                config_dir,
            } => {
                assert_eq!(servers, Some(vec!["local".to_string(), "remote".to_string()]));
                assert_eq!(provider.as_deref(), Some("groq"));
                assert_eq!(config_dir, PathBuf::from("config"));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(parse_log_level("WARNING"), Ok(LevelFilter::WARN));
        assert_eq!(parse_log_level("critical"), Ok(LevelFilter::ERROR));
        assert_eq!(parse_log_level("Info"), Ok(LevelFilter::INFO));
        assert!(parse_log_level("loud").is_err());

        let cli = Cli::try_parse_from([
            "simpli5",
            "--log-level",
            "DEBUG",
            "list-tools",
            "--server",
            "x",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
        assert!(
            Cli::try_parse_from(["simpli5", "--log-level", "loud", "list-tools", "--server", "x"])
                .is_err()
        );
    }

    #[test]
    fn test_webhook_defaults() {
        let cli = Cli::try_parse_from([
            "simpli5",
            "webhook",
            "--telegram-token",
            "123:abc",
            "--webhook-url",
            "https://example.com/webhook",
        ])
        .unwrap();
        match cli.command {
            Commands::Webhook {
                collection_name,
                host,
                port,
                skip_register,
                ..
            } => {
                assert_eq!(collection_name, "telegram_messages");
                assert_eq!(host, "0.0.0.0");
                assert_eq!(port, 8000);
                assert!(!skip_register);
            }
            _ => panic!("expected webhook"),
        }
    }

    #[test]
    fn test_explicit_provider_must_resolve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("llm_providers.yml"),
            "llm_providers:\n  groq:\n    provider: groq\n    api_key_env: SIMPLI5_TEST_UNSET_KEY\n    default_model: m\n    enabled: true\n",
        )
        .unwrap();
        let paths = ConfigPaths::in_dir(dir.path());

        let implicit = load_llm(&paths, None).unwrap();
        assert!(!implicit.has_provider());
        assert!(load_llm(&paths, Some("groq")).is_err());
    }
}
