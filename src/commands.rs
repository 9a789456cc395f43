//! Parsing of chat input into free text or a slash command.

use serde_json::{Map, Value};
use thiserror::Error;

pub const HELP: &str = "\
Available Commands:
  /help       - Show this help
  /tools      - List all available tools
  /resources  - List all available resources
  /prompts    - List all available prompts
  /call <server:tool> <json_args>
              - Call a tool (e.g. /call local:calculator '{\"operation\": \"add\", \"a\": 5, \"b\": 3}')
  /read <uri> - Read a resource (e.g. /read system://info)
  /generate <server:prompt> <json_args>
              - Generate a prompt
  /memory <message>
              - Categorize a message as a memory (e.g. /memory I'm a software engineer)
  /exit       - Exit the chat";

const CALL_USAGE: &str = "/call <server:tool> <json_arguments>";
const READ_USAGE: &str = "/read <resource_uri>";
const GENERATE_USAGE: &str = "/generate <server:prompt> <json_arguments>";
const MEMORY_USAGE: &str = "/memory <message>";

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: {0}. Type /help for available commands.")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid target '{0}': expected <server>:<name>")]
    InvalidAddress(String),

    #[error("Invalid JSON in arguments: {0}")]
    InvalidArguments(String),
}

/// A `server:name` reference to a tool or prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub server: String,
    pub name: String,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        match raw.split_once(':') {
            Some((server, name)) if !server.is_empty() && !name.is_empty() => Ok(Self {
                server: server.to_string(),
                name: name.to_string(),
            }),
            _ => Err(CommandError::InvalidAddress(raw.to_string())),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Tools,
    Resources,
    Prompts,
    Call { target: Address, arguments: Value },
    Read { uri: String },
    Generate { target: Address, arguments: Value },
    Memory { text: String },
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Chat(String),
    Command(Command),
}

pub fn parse_input(line: &str) -> Result<Input, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    if !line.starts_with('/') {
        return Ok(Input::Chat(line.to_string()));
    }
    parse_command(line).map(Input::Command)
}

fn parse_command(line: &str) -> Result<Command, CommandError> {
    let (name, rest) = split_first_word(line);
    let rest = rest.trim();

    match name.to_ascii_lowercase().as_str() {
        "/help" => Ok(Command::Help),
        "/tools" => Ok(Command::Tools),
        "/resources" => Ok(Command::Resources),
        "/prompts" => Ok(Command::Prompts),
        "/exit" | "/quit" => Ok(Command::Exit),
        "/call" => {
            let (target, arguments) = parse_target_and_arguments(rest, CALL_USAGE)?;
            Ok(Command::Call { target, arguments })
        }
        "/generate" => {
            let (target, arguments) = parse_target_and_arguments(rest, GENERATE_USAGE)?;
            Ok(Command::Generate { target, arguments })
        }
        "/read" => {
            let (uri, extra) = split_first_word(rest);
            if uri.is_empty() || !extra.trim().is_empty() {
                return Err(CommandError::Usage(READ_USAGE));
            }
            Ok(Command::Read {
                uri: uri.to_string(),
            })
        }
        "/memory" => {
            let text = strip_quotes(rest, '"');
            if text.trim().is_empty() {
                return Err(CommandError::Usage(MEMORY_USAGE));
            }
            Ok(Command::Memory {
                text: text.trim().to_string(),
            })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

fn strip_quotes(s: &str, quote: char) -> &str {
    let s = s.trim();
    s.strip_prefix(quote)
        .and_then(|inner| inner.strip_suffix(quote))
        .unwrap_or(s)
}

fn parse_target_and_arguments(
    rest: &str,
    usage: &'static str,
) -> Result<(Address, Value), CommandError> {
    let (target, json) = split_first_word(rest);
    if target.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    let target = Address::parse(target)?;
    Ok((target, parse_arguments(json)?))
}

/// Parse a JSON object of arguments. Empty input means no arguments; a
/// shell-style single-quoted object is accepted.
pub fn parse_arguments(raw: &str) -> Result<Value, CommandError> {
    let raw = strip_quotes(raw, '\'');
    if raw.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(CommandError::InvalidArguments(
            "expected a JSON object".to_string(),
        )),
        Err(e) => Err(CommandError::InvalidArguments(e.to_string())),
    }
}
