//! Envelope validation.
//!
//! Text frames are parsed as loose JSON first so that a correlation `id` can
//! be recovered even when the rest of the envelope is malformed.

use serde_json::{Map, Value};
use statelink_core::protocol::{MessageType, PreferencesPatch};

use crate::errors::RouterError;
use crate::types::{ClientConfigUpdate, CommandRequest, InboundMessage, OperationRequest};

/// Maximum length of a command or operation name.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum length of a correlation id.
pub const MAX_ID_LENGTH: usize = 256;

/// A message that could not be accepted.
#[derive(Debug)]
pub struct Rejection {
    /// Correlation id, when it could be read.
    pub id: Option<String>,
    /// Why the message was rejected.
    pub error: RouterError,
}

impl Rejection {
    fn new(id: Option<String>, error: RouterError) -> Self {
        Self { id, error }
    }
}

/// Validate that a string field does not exceed `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), RouterError> {
    if value.len() > max_len {
        return Err(RouterError::validation(format!(
            "Field '{name}' exceeds maximum length ({} > {max_len})",
            value.len()
        )));
    }
    Ok(())
}

/// Parse and validate one text frame.
pub fn decode_message(text: &str) -> Result<InboundMessage, Rejection> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Rejection::new(None, RouterError::protocol(format!("Invalid JSON: {e}"))))?;

    let Value::Object(obj) = value else {
        return Err(Rejection::new(
            None,
            RouterError::protocol("Message must be a JSON object"),
        ));
    };

    let id = read_id(&obj);
    if let Some(id) = &id {
        validate_string_param(id, "id", MAX_ID_LENGTH).map_err(|error| Rejection::new(Some(id.clone()), error))?;
    }
    decode_object(obj, id.clone()).map_err(|error| Rejection::new(id, error))
}

/// Correlation ids are strings; numeric ids are accepted and stringified.
/// An oversized id still comes back so the rejection can echo it.
fn read_id(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decode_object(mut obj: Map<String, Value>, id: Option<String>) -> Result<InboundMessage, RouterError> {
    let type_name = match obj.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(RouterError::protocol("Field 'type' must be a string")),
        None => return Err(RouterError::protocol("Missing message type")),
    };
    let message_type = MessageType::from_wire(&type_name)
        .ok_or_else(|| RouterError::protocol(format!("Unsupported message type '{type_name}'")))?;

    match message_type {
        MessageType::Command => decode_command(&mut obj, id).map(InboundMessage::Command),
        MessageType::Broadcast => decode_broadcast(&mut obj, id),
        MessageType::Status => Ok(InboundMessage::Status { id }),
        MessageType::Response => Err(RouterError::protocol(
            "Clients may not send 'response' messages",
        )),
        MessageType::FileSystem | MessageType::Prompt | MessageType::Git | MessageType::Config => {
            decode_operation(message_type, &mut obj, id).map(InboundMessage::Operation)
        }
    }
}

fn decode_command(obj: &mut Map<String, Value>, id: Option<String>) -> Result<CommandRequest, RouterError> {
    let command = match obj.remove("command") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => {
            return Err(RouterError::validation(
                "Command messages require a non-empty 'command'",
            ));
        }
    };
    validate_string_param(&command, "command", MAX_NAME_LENGTH)?;

    let args = match obj.remove("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(RouterError::validation("Field 'args' must be an array")),
    };

    Ok(CommandRequest { id, command, args })
}

fn decode_broadcast(obj: &mut Map<String, Value>, id: Option<String>) -> Result<InboundMessage, RouterError> {
    let Some(Value::Object(data)) = obj.remove("data") else {
        return Err(RouterError::validation(
            "Broadcast messages require a 'data' object",
        ));
    };

    match data.get("type").and_then(Value::as_str) {
        Some("clientConfig") => {
            let update = decode_client_config(&data)?;
            Ok(InboundMessage::ClientConfig { id, update })
        }
        Some("requestState") => Ok(InboundMessage::RequestState { id }),
        Some(other) => Err(RouterError::protocol(format!(
            "Unsupported broadcast payload '{other}'"
        ))),
        None => Err(RouterError::validation(
            "Broadcast messages require 'data.type'",
        )),
    }
}

fn decode_client_config(data: &Map<String, Value>) -> Result<ClientConfigUpdate, RouterError> {
    let Some(config) = data.get("config").and_then(Value::as_object) else {
        return Err(RouterError::validation(
            "clientConfig requires a 'config' object",
        ));
    };

    let preferences = match config.get("statePreferences") {
        None | Some(Value::Null) => PreferencesPatch::default(),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            RouterError::validation(format!("Invalid statePreferences: {e}"))
        })?,
    };

    let incremental_updates = match config.get("incrementalUpdates") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            return Err(RouterError::validation(
                "Field 'incrementalUpdates' must be a boolean",
            ));
        }
    };

    Ok(ClientConfigUpdate {
        preferences,
        incremental_updates,
    })
}

fn decode_operation(
    kind: MessageType,
    obj: &mut Map<String, Value>,
    id: Option<String>,
) -> Result<OperationRequest, RouterError> {
    let data = match obj.remove("data") {
        Some(Value::Object(data)) if !data.is_empty() => data,
        _ => {
            return Err(RouterError::validation(format!(
                "'{kind}' messages require a non-empty 'data' object"
            )));
        }
    };

    let operation = match data.get("operation") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => {
            return Err(RouterError::validation(format!(
                "'{kind}' messages require 'data.operation'"
            )));
        }
    };
    validate_string_param(&operation, "operation", MAX_NAME_LENGTH)?;

    Ok(OperationRequest {
        id,
        kind,
        operation,
        data,
        client_id: None,
    })
}
