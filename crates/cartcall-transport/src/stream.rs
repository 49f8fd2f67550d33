//! Raw transport event types

use crate::error::TransportErrorKind;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Connection state reported by the media stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected {
        kind: TransportErrorKind,
        message: String,
    },
}

/// Events produced by a live connection, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEvent {
    /// Connection state change
    ConnectionStateChanged { state: ConnectionState },
    /// A remote (agent) audio track started playing
    RemoteAudioStarted { track_id: String },
    /// A remote (agent) audio track went silent
    RemoteAudioStopped { track_id: String },
    /// Opaque data-channel message from the agent
    DataMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        payload: String,
    },
    /// Link quality measurement
    QualitySample { latency_ms: f64, packet_loss: f64 },
    /// Unrecoverable fault in the media stack
    FatalError {
        kind: TransportErrorKind,
        message: String,
    },
}

impl RawEvent {
    pub fn connected() -> Self {
        RawEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
        }
    }

    pub fn disconnected(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        RawEvent::ConnectionStateChanged {
            state: ConnectionState::Disconnected {
                kind,
                message: message.into(),
            },
        }
    }

    /// Data-channel message carrying a JSON payload
    pub fn data(payload: impl Into<String>) -> Self {
        RawEvent::DataMessage {
            topic: None,
            payload: payload.into(),
        }
    }

    /// Check if this event ends the connection it arrived on
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RawEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected { .. }
            }
        )
    }
}

/// A stream of raw transport events
pub type RawEventStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;
