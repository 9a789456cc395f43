//! LLM-driven routing of free text to MCP tools.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::mcp::ToolInfo;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlannedCall {
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RoutingDecision {
    #[serde(default)]
    pub tool_calls: Vec<PlannedCall>,
    #[serde(default)]
    pub fallback: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Error, PartialEq)]
pub enum ArgumentError {
    #[error("arguments must be a JSON object")]
    NotAnObject,

    #[error("missing required argument '{0}'")]
    MissingRequired(String),

    #[error("argument '{name}' should be {expected}, got {found}")]
    WrongType {
        name: String,
        expected: String,
        found: &'static str,
    },
}

pub fn build_routing_prompt<'a>(
    tools: impl IntoIterator<Item = (&'a str, &'a ToolInfo)>,
    user_input: &str,
) -> String {
    let mut listing = String::new();
    for (key, tool) in tools {
        listing.push_str(&format!(
            "- {}: {}\n",
            key,
            tool.description.as_deref().unwrap_or("No description.")
        ));
        let arguments = tool.arguments();
        if !arguments.is_empty() {
            listing.push_str("  Input schema:\n");
            for arg in arguments {
                let marker = if arg.required { "required" } else { "optional" };
                listing.push_str(&format!("    - {}: {} ({})", arg.name, arg.kind, marker));
                if let Some(desc) = arg.description {
                    listing.push_str(&format!(" - {desc}"));
                }
                listing.push('\n');
            }
        }
    }

    format!(
        r#"You have access to the following tools with their input schemas:

{listing}
User request: "{user_input}"

Decide which tool(s) to call, if any, and with what arguments.
Use only the exact tool names and argument names listed above.

If tools can handle the request, respond with JSON like:
{{
    "tool_calls": [
        {{
            "tool_name": "exact_tool_name_from_list",
            "arguments": {{"exact_arg_name": "value"}}
        }}
    ]
}}

If no tool can handle it, respond with:
{{
    "tool_calls": [],
    "fallback": "why no tool applies"
}}

Respond with the JSON only."#
    )
}

/// Parse the router's answer, accepting a Markdown code fence around the JSON.
pub fn parse_decision(answer: &str) -> Result<RoutingDecision> {
    let trimmed = answer.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).context("Failed to parse routing response")
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check arguments against a tool's input schema: required keys must be
/// present and primitive types must match. Unknown keys and untyped
/// properties are allowed.
pub fn validate_arguments(tool: &ToolInfo, arguments: &Value) -> Result<(), ArgumentError> {
    let args = arguments.as_object().ok_or(ArgumentError::NotAnObject)?;

    for required in tool.required_arguments() {
        if !args.contains_key(&required) {
            return Err(ArgumentError::MissingRequired(required));
        }
    }

    for arg in tool.arguments() {
        let Some(value) = args.get(&arg.name) else {
            continue;
        };
        let ok = match arg.kind.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            return Err(ArgumentError::WrongType {
                name: arg.name,
                expected: arg.kind,
                found: json_type_name(value),
            });
        }
    }

    Ok(())
}
