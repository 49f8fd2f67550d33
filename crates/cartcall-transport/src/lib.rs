//! cartcall-transport: Real-time voice transport abstraction
//!
//! This crate defines the boundary to the media/session stack: raw connection
//! events, error classification, and the `Transport` trait, along with an
//! HTTP session-gateway transport and a scripted in-memory transport.

pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use providers::Transport;
pub use providers::gateway::GatewayTransport;
pub use providers::scripted::{ConnectOutcome, ScriptedTransport};
pub use stream::{ConnectionState, RawEvent, RawEventStream};
pub use types::{ConnectConfig, Connection, ConnectionHandle};
