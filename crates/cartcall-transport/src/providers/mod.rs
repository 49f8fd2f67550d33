//! Transport implementations

pub mod gateway;
pub mod scripted;

use crate::{Connection, ConnectConfig, ConnectionHandle, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Trait for real-time voice transports.
///
/// Implementations wrap a media/session SDK. They hold no shopping-domain
/// state; every failure is returned to the caller rather than swallowed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection and start receiving its events
    async fn connect(&self, config: &ConnectConfig) -> Result<Connection>;

    /// Release a connection
    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Mute or unmute the local microphone track
    async fn mute_mic(&self, handle: &ConnectionHandle, muted: bool) -> Result<()>;

    /// Cut off assistant audio that is currently playing
    async fn interrupt_playback(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Round-trip health check, returning the measured latency
    async fn probe(&self, handle: &ConnectionHandle) -> Result<Duration>;
}
