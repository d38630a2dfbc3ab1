//! MCP tool definitions and handlers.
//!
//! Each tool is defined as a JSON schema (returned by [`tool_definitions`])
//! and handled by a function dispatched from [`handle_tool_call`].
//!
//! **Machine tools** go through [`RelayForwarder`] and return the listener's
//! raw JSON body as text:
//! - `start_machine`, `stop_machine`, `get_machine_status`
//!
//! **Local tools**:
//! - `echo`

use relayctl::{MachineRoute, RelayForwarder};
use serde_json::{json, Value};
use tracing::warn;

const INVALID_MACHINE: &str = "Invalid machine name.";

/// Returns every tool definition.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        machine_tool_definition(
            "start_machine",
            "Starts the machine with the name that is provided.",
        ),
        machine_tool_definition(
            "stop_machine",
            "Stops the machine with the name that is provided.",
        ),
        machine_tool_definition(
            "get_machine_status",
            "Gets the current status of the machine with the name that is provided.",
        ),
        json!({
            "name": "echo",
            "description": "Echoes the message back to the client.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Text to echo back."
                    }
                },
                "required": ["message"],
                "additionalProperties": false
            }
        }),
    ]
}

fn machine_tool_definition(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": {
                "machineName": {
                    "type": "string",
                    "description": "Machine identifier, matched case-insensitively."
                }
            },
            "required": ["machineName"],
            "additionalProperties": false
        }
    })
}

/// Handle a tool call and return MCP content.
pub async fn handle_tool_call(name: &str, args: &Value, forwarder: &RelayForwarder) -> ToolResult {
    match name {
        "start_machine" => handle_machine(MachineRoute::Start, args, forwarder).await,
        "stop_machine" => handle_machine(MachineRoute::Stop, args, forwarder).await,
        "get_machine_status" => handle_machine(MachineRoute::GetStatus, args, forwarder).await,
        "echo" => handle_echo(args),
        _ => ToolResult::error(format!("Unknown tool: {name}")),
    }
}

/// Result of an MCP tool call, ready to be serialized into a JSON-RPC response.
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Maps to `isError` in the MCP response.
    pub is_error: bool,
}

impl ToolResult {
    fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            is_error: false,
        }
    }

    fn error(message: String) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message })],
            is_error: true,
        }
    }
}

fn string_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

async fn handle_machine(route: MachineRoute, args: &Value, forwarder: &RelayForwarder) -> ToolResult {
    let machine = string_arg(args, "machineName");
    if machine.trim().is_empty() {
        return ToolResult::text(INVALID_MACHINE);
    }
    match forwarder.send(route, machine).await {
        Ok(body) => ToolResult::text(body),
        Err(e) => {
            warn!(route = %route, machine, "Relay call failed: {e}");
            ToolResult::error(e.to_string())
        }
    }
}

fn handle_echo(args: &Value) -> ToolResult {
    let message = string_arg(args, "message");
    if message.trim().is_empty() {
        ToolResult::text("No message provided.")
    } else {
        ToolResult::text(format!("Echo: {message}"))
    }
}
