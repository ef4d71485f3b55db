//! Operator command parsing.
//!
//! Commands arrive as `{"type":"command","command":<name>,"params":{…}}`.

use serde_json::Value;
use thiserror::Error;

use switchyard_core::{InstanceId, LoadBalancingStrategy};

/// A validated operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ScaleUp { count: usize },
    ScaleDown { count: usize },
    SetStrategy(LoadBalancingStrategy),
    RemoveInstance(InstanceId),
}

impl Command {
    /// Wire name, echoed back in `command-result`.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ScaleUp { .. } => "scaleUp",
            Command::ScaleDown { .. } => "scaleDown",
            Command::SetStrategy(_) => "setStrategy",
            Command::RemoveInstance(_) => "removeInstance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid params for {command}: {reason}")]
    InvalidParams {
        command: &'static str,
        reason: String,
    },
}

/// Upper bound on instances a single scale command may touch.
pub const MAX_SCALE_STEP: usize = 100;

/// Parse an operator frame.
pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let Ok(Value::Object(frame)) = serde_json::from_str::<Value>(text) else {
        return Err(CommandError::InvalidFormat);
    };
    match frame.get("type").and_then(Value::as_str) {
        Some("command") => {}
        Some(other) => return Err(CommandError::UnknownType(other.to_string())),
        None => return Err(CommandError::InvalidFormat),
    }
    let name = frame
        .get("command")
        .and_then(Value::as_str)
        .ok_or(CommandError::InvalidFormat)?;
    let params = frame.get("params").cloned().unwrap_or(Value::Null);

    match name {
        "scaleUp" => Ok(Command::ScaleUp {
            count: count_param("scaleUp", &params)?,
        }),
        "scaleDown" => Ok(Command::ScaleDown {
            count: count_param("scaleDown", &params)?,
        }),
        "setStrategy" => {
            let raw = string_param(&params, &["type", "strategy"]).ok_or_else(|| {
                CommandError::InvalidParams {
                    command: "setStrategy",
                    reason: "missing type".to_string(),
                }
            })?;
            LoadBalancingStrategy::parse(raw)
                .map(Command::SetStrategy)
                .ok_or_else(|| CommandError::InvalidParams {
                    command: "setStrategy",
                    reason: format!("unknown strategy {raw:?}"),
                })
        }
        "removeInstance" => string_param(&params, &["id", "instanceId"])
            .map(|id| Command::RemoveInstance(id.to_string()))
            .ok_or_else(|| CommandError::InvalidParams {
                command: "removeInstance",
                reason: "missing id".to_string(),
            }),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

/// `params.count`, defaulting to 1.
fn count_param(command: &'static str, params: &Value) -> Result<usize, CommandError> {
    let Some(raw) = params.get("count") else {
        return Ok(1);
    };
    match raw.as_u64() {
        Some(n) if n >= 1 && n as usize <= MAX_SCALE_STEP => Ok(n as usize),
        _ => Err(CommandError::InvalidParams {
            command,
            reason: format!("count must be an integer between 1 and {MAX_SCALE_STEP}"),
        }),
    }
}

fn string_param<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}
