//! Wire protocol: duck-typed JSON arrays at the boundary become tagged
//! variants here. Parsing is two-step — structural parse to a command
//! union, then per-variant field validation happens in the caller (C1/C5).

use fitrelay_core::{Event, Filter};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("INVALID_FORMAT: {0}")]
    InvalidFormat(String),
    #[error("UNKNOWN_COMMAND: {0}")]
    UnknownCommand(String),
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Publish(Event),
    Subscribe { label: String, filters: Vec<Filter> },
    Unsubscribe { label: String },
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Event { label: String, event: Event },
    EndOfStored { label: String },
    Acceptance { id: String, ok: bool, message: String },
    Notice { message: String },
}

pub fn parse_client_message(raw: &str) -> Result<ClientMessage, WireError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| WireError::InvalidFormat(format!("not valid JSON: {e}")))?;

    let array = value
        .as_array()
        .ok_or_else(|| WireError::InvalidFormat("frame must be a JSON array".into()))?;

    let tag = array
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| WireError::InvalidFormat("frame must start with a string tag".into()))?;

    match tag {
        "EVENT" => {
            let event_value = array
                .get(1)
                .ok_or_else(|| WireError::InvalidFormat("EVENT requires a payload".into()))?;
            let event: Event = serde_json::from_value(event_value.clone())
                .map_err(|e| WireError::InvalidFormat(format!("malformed event: {e}")))?;
            Ok(ClientMessage::Publish(event))
        }
        "REQ" => {
            let label = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| WireError::InvalidFormat("REQ requires a label".into()))?
                .to_string();
            let filters = array[2..]
                .iter()
                .map(|v| serde_json::from_value::<Filter>(v.clone()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| WireError::InvalidFormat(format!("malformed filter: {e}")))?;
            if filters.is_empty() {
                return Err(WireError::InvalidFormat(
                    "REQ requires at least one filter".into(),
                ));
            }
            Ok(ClientMessage::Subscribe { label, filters })
        }
        "CLOSE" => {
            let label = array
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| WireError::InvalidFormat("CLOSE requires a label".into()))?
                .to_string();
            Ok(ClientMessage::Unsubscribe { label })
        }
        other => Err(WireError::UnknownCommand(other.to_string())),
    }
}

impl ServerMessage {
    pub fn to_frame(&self) -> String {
        let value = match self {
            ServerMessage::Event { label, event } => {
                Value::Array(vec![
                    Value::String("EVENT".into()),
                    Value::String(label.clone()),
                    serde_json::to_value(event).expect("Event always serializes"),
                ])
            }
            ServerMessage::EndOfStored { label } => Value::Array(vec![
                Value::String("EOSE".into()),
                Value::String(label.clone()),
            ]),
            ServerMessage::Acceptance { id, ok, message } => Value::Array(vec![
                Value::String("OK".into()),
                Value::String(id.clone()),
                Value::Bool(*ok),
                Value::String(message.clone()),
            ]),
            ServerMessage::Notice { message } => Value::Array(vec![
                Value::String("NOTICE".into()),
                Value::String(message.clone()),
            ]),
        };
        value.to_string()
    }
}
