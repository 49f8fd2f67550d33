//! Error types for cartcall-transport

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using cartcall-transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Alias used by callers that deal with more than one error family
pub type TransportError = Error;

/// Coarse classification of a transport failure.
///
/// The session layer only ever branches on this: network failures take the
/// bounded reconnect path, everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Auth,
    Network,
    Unsupported,
}

impl TransportErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportErrorKind::Network)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::Network => "network",
            TransportErrorKind::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while talking to the media/session transport
#[derive(Error, Debug)]
pub enum Error {
    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transient connectivity problem
    #[error("Network error: {0}")]
    Network(String),

    /// The remote end does not speak our protocol or lacks a capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation on a connection that is no longer open
    #[error("Connection closed")]
    Closed,
}

impl Error {
    /// Build an error of the given kind
    pub fn from_kind(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        match kind {
            TransportErrorKind::Auth => Error::Auth(message.into()),
            TransportErrorKind::Network => Error::Network(message.into()),
            TransportErrorKind::Unsupported => Error::Unsupported(message.into()),
        }
    }

    /// Classify an HTTP status returned by a session gateway
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };
        match status {
            401 | 403 => Error::Auth(message),
            404 | 405 | 415 | 501 => Error::Unsupported(message),
            _ => Error::Network(message),
        }
    }

    /// The coarse kind of this error
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Error::Auth(_) => TransportErrorKind::Auth,
            Error::Unsupported(_) | Error::Json(_) => TransportErrorKind::Unsupported,
            Error::Network(_) | Error::Closed => TransportErrorKind::Network,
            Error::Http(e) => match e.status().map(|s| s.as_u16()) {
                Some(401) | Some(403) => TransportErrorKind::Auth,
                Some(404) | Some(405) | Some(415) | Some(501) => TransportErrorKind::Unsupported,
                _ if e.is_decode() => TransportErrorKind::Unsupported,
                _ => TransportErrorKind::Network,
            },
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
