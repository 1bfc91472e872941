//! JSON hub protocol
//!
//! Each record is a JSON object terminated by the ASCII record separator
//! (0x1E); one WebSocket frame may carry several records. The connection opens
//! with a handshake record answered by `{}` or `{"error": "..."}`.
//!
//! Message types understood here:
//! - 1 Invocation: client calls a hub method, or the server broadcasts an event
//! - 3 Completion: result or error of a client invocation
//! - 6 Ping: keep-alive in either direction
//! - 7 Close: server is closing the connection
//!
//! Stream messages (2, 4, 5) are not used by the content hubs and are dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

/// First record a client sends after the socket opens.
pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

/// Validate the handshake answer. Records that arrived in the same frame
/// after it are returned decoded.
pub fn parse_handshake_response(frame: &str) -> Result<Vec<HubMessage>> {
    let (first, rest) = frame
        .split_once(RECORD_SEPARATOR)
        .ok_or_else(|| Error::Protocol("handshake response missing record separator".into()))?;

    let response: HandshakeResponse = serde_json::from_str(first)
        .map_err(|e| Error::Protocol(format!("invalid handshake response: {e}")))?;
    if let Some(error) = response.error {
        return Err(Error::Protocol(format!("handshake rejected: {error}")));
    }
    decode(rest)
}

/// Encode one message as a terminated record.
pub fn encode(message: &HubMessage) -> Result<String> {
    let wire = match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        } => WireMessage {
            kind: TYPE_INVOCATION,
            invocation_id: invocation_id.clone(),
            target: Some(target.clone()),
            arguments: Some(arguments.clone()),
            ..Default::default()
        },
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => WireMessage {
            kind: TYPE_COMPLETION,
            invocation_id: Some(invocation_id.clone()),
            result: result.clone(),
            error: error.clone(),
            ..Default::default()
        },
        HubMessage::Ping => WireMessage {
            kind: TYPE_PING,
            ..Default::default()
        },
        HubMessage::Close {
            error,
            allow_reconnect,
        } => WireMessage {
            kind: TYPE_CLOSE,
            error: error.clone(),
            allow_reconnect: Some(*allow_reconnect),
            ..Default::default()
        },
    };

    let mut json =
        serde_json::to_string(&wire).map_err(|e| Error::Protocol(format!("encoding: {e}")))?;
    json.push(RECORD_SEPARATOR);
    Ok(json)
}

/// Decode every record in a frame. Unknown message types are skipped; a
/// malformed record fails the whole frame.
pub fn decode(frame: &str) -> Result<Vec<HubMessage>> {
    let mut messages = Vec::new();
    for record in frame.split(RECORD_SEPARATOR) {
        if record.trim().is_empty() {
            continue;
        }
        let wire: WireMessage = serde_json::from_str(record)
            .map_err(|e| Error::Protocol(format!("invalid record: {e}")))?;
        if let Some(message) = from_wire(wire)? {
            messages.push(message);
        }
    }
    Ok(messages)
}

fn from_wire(wire: WireMessage) -> Result<Option<HubMessage>> {
    let message = match wire.kind {
        TYPE_INVOCATION => HubMessage::Invocation {
            target: wire
                .target
                .ok_or_else(|| Error::Protocol("invocation without target".into()))?,
            invocation_id: wire.invocation_id,
            arguments: wire.arguments.unwrap_or_default(),
        },
        TYPE_COMPLETION => HubMessage::Completion {
            invocation_id: wire
                .invocation_id
                .ok_or_else(|| Error::Protocol("completion without invocationId".into()))?,
            result: wire.result,
            error: wire.error,
        },
        TYPE_PING => HubMessage::Ping,
        TYPE_CLOSE => HubMessage::Close {
            error: wire.error,
            allow_reconnect: wire.allow_reconnect.unwrap_or(false),
        },
        _ => return Ok(None),
    };
    Ok(Some(message))
}
