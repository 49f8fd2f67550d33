//! Connection configuration and handles

use crate::stream::RawEventStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters for establishing a voice session connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Base URL of the session gateway
    pub url: String,
    /// Bearer token for the gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Room the agent is dispatched to
    pub room: String,
    /// Participant identity of the local user
    pub identity: String,
    /// Extra headers sent with every gateway request
    pub headers: HashMap<String, String>,
}

/// Opaque reference to a live connection.
///
/// Only the transport that issued it knows what the fields mean.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: String,
    endpoint: String,
    token: Option<String>,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            token,
        }
    }

    /// Connection identifier assigned by the remote end
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base URL for requests scoped to this connection
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A freshly established connection and its event stream
pub struct Connection {
    pub handle: ConnectionHandle,
    pub events: RawEventStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
