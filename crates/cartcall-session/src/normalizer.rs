//! Mapping from raw transport events to canonical session events
//!
//! Stateless and total: every raw event yields exactly one `SessionEvent`.
//! Anything that cannot be understood becomes `SessionEvent::Malformed`
//! instead of being dropped.
//!
//! Data-channel payloads are JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"user_speech_started"}
//! {"type":"user_speech_stopped"}
//! {"type":"transcript","speaker":"user","text":"show me hoodies","seq":1,"final":true}
//! {"type":"tool_call","id":"t2","name":"add_to_cart","arguments":{"item":"hoodie-black-M","qty":1},"seq":3}
//! {"type":"tool_result","id":"t2","status":"applied"}
//! {"type":"session_end"}
//! ```

use cartcall_transport::{ConnectionState, RawEvent};
use serde::Deserialize;

use crate::events::{
    SessionEvent, Speaker, ToolArgs, ToolCallKind, ToolResultStatus,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    UserSpeechStarted,
    UserSpeechStopped,
    Transcript {
        speaker: Speaker,
        text: String,
        seq: u64,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
        seq: u64,
    },
    ToolResult {
        id: String,
        status: ToolResultStatus,
        #[serde(default)]
        error: Option<String>,
    },
    SessionEnd,
}

/// Normalize one raw transport event
pub fn normalize(raw: RawEvent) -> SessionEvent {
    match raw {
        RawEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
        } => SessionEvent::ConnectionUp,
        RawEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected { kind, message },
        } => SessionEvent::ConnectionDown { kind, message },
        RawEvent::RemoteAudioStarted { .. } => SessionEvent::AgentSpeechStarted,
        RawEvent::RemoteAudioStopped { .. } => SessionEvent::AgentSpeechStopped,
        RawEvent::QualitySample {
            latency_ms,
            packet_loss,
        } => SessionEvent::QualitySample {
            latency_ms,
            packet_loss,
        },
        RawEvent::FatalError { kind, message } => SessionEvent::FatalError { kind, message },
        RawEvent::DataMessage { payload, .. } => normalize_data(payload),
    }
}

fn normalize_data(payload: String) -> SessionEvent {
    let message: WireMessage = match serde_json::from_str(&payload) {
        Ok(message) => message,
        Err(e) => return malformed(payload, e.to_string()),
    };

    match message {
        WireMessage::UserSpeechStarted => SessionEvent::UserSpeechStarted,
        WireMessage::UserSpeechStopped => SessionEvent::UserSpeechStopped,
        WireMessage::Transcript {
            speaker,
            text,
            seq,
            is_final,
        } => {
            if is_final {
                SessionEvent::FinalTranscript { speaker, text, seq }
            } else {
                SessionEvent::PartialTranscript { speaker, text, seq }
            }
        }
        WireMessage::ToolCall {
            id,
            name,
            arguments,
            seq,
        } => match parse_tool_args(&name, arguments) {
            Ok(args) => SessionEvent::ToolCallRequested { id, args, seq },
            Err(reason) => malformed(payload, reason),
        },
        WireMessage::ToolResult { id, status, error } => {
            SessionEvent::ToolCallResult { id, status, error }
        }
        WireMessage::SessionEnd => SessionEvent::AgentClosed,
    }
}

/// Validate a tool call against the closed kind set and its typed arguments
pub fn parse_tool_args(name: &str, arguments: serde_json::Value) -> Result<ToolArgs, String> {
    let kind = ToolCallKind::from_name(name)
        .ok_or_else(|| format!("unknown tool call kind '{}'", name))?;

    let arguments = if arguments.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        arguments
    };

    let invalid = |e: serde_json::Error| format!("invalid arguments for {}: {}", name, e);
    let args = match kind {
        ToolCallKind::SearchProducts => {
            ToolArgs::SearchProducts(serde_json::from_value(arguments).map_err(invalid)?)
        }
        ToolCallKind::AddToCart => {
            ToolArgs::AddToCart(serde_json::from_value(arguments).map_err(invalid)?)
        }
        ToolCallKind::UpdateCartItem => {
            ToolArgs::UpdateCartItem(serde_json::from_value(arguments).map_err(invalid)?)
        }
        ToolCallKind::RemoveFromCart => {
            ToolArgs::RemoveFromCart(serde_json::from_value(arguments).map_err(invalid)?)
        }
        ToolCallKind::PlaceOrder => {
            ToolArgs::PlaceOrder(serde_json::from_value(arguments).map_err(invalid)?)
        }
    };

    match &args {
        ToolArgs::AddToCart(a) if a.quantity == 0 => {
            Err(format!("invalid arguments for {}: quantity must be positive", name))
        }
        ToolArgs::AddToCart(a) if a.item.trim().is_empty() => {
            Err(format!("invalid arguments for {}: empty item", name))
        }
        ToolArgs::UpdateCartItem(a) if a.item.trim().is_empty() => {
            Err(format!("invalid arguments for {}: empty item", name))
        }
        ToolArgs::RemoveFromCart(a) if a.item.trim().is_empty() => {
            Err(format!("invalid arguments for {}: empty item", name))
        }
        _ => Ok(args),
    }
}

fn malformed(raw: String, reason: String) -> SessionEvent {
    tracing::debug!("Malformed data message: {}", reason);
    SessionEvent::Malformed { raw, reason }
}
