//! Scripted in-memory transport
//!
//! Connect outcomes are queued up front and raw events are injected by the
//! caller, which makes every reconnection and barge-in path reproducible
//! without a media server.

use crate::{
    error::{Error, Result, TransportErrorKind},
    stream::RawEvent,
    types::{ConnectConfig, Connection, ConnectionHandle},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::Transport;

/// What the next `connect` call does
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    delay: Duration,
    result: std::result::Result<(), (TransportErrorKind, String)>,
}

impl ConnectOutcome {
    /// Succeed immediately
    pub fn accept() -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(()),
        }
    }

    /// Fail with an error of the given kind
    pub fn reject(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err((kind, message.into())),
        }
    }

    /// Resolve only after `delay` has elapsed
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<ConnectOutcome>,
    probe_outcomes: VecDeque<std::result::Result<Duration, TransportErrorKind>>,
    live: Option<(ConnectionHandle, mpsc::UnboundedSender<RawEvent>)>,
    next_id: u64,
    connects: u32,
    disconnects: u32,
    interrupts: u32,
    mute_history: Vec<bool>,
    announce_connected: bool,
}

/// A transport whose behaviour is scripted by the caller.
///
/// Cloning is cheap; all clones share the same script and live connection.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    /// Create a transport that accepts every connect and announces `Connected`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptState {
                announce_connected: true,
                ..Default::default()
            })),
        }
    }

    /// Do not emit `Connected` automatically after a successful connect
    pub fn without_auto_connect(self) -> Self {
        self.inner.lock().announce_connected = false;
        self
    }

    /// Queue the outcome of a future `connect` call
    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.inner.lock().outcomes.push_back(outcome);
    }

    /// Queue the outcome of a future `probe` call
    pub fn push_probe(&self, outcome: std::result::Result<Duration, TransportErrorKind>) {
        self.inner.lock().probe_outcomes.push_back(outcome);
    }

    /// Inject an event into the live connection.
    /// Returns `false` if there is no live connection.
    pub fn emit(&self, event: RawEvent) -> bool {
        let state = self.inner.lock();
        match &state.live {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Inject a data-channel message built from a JSON value
    pub fn emit_json(&self, payload: serde_json::Value) -> bool {
        self.emit(RawEvent::data(payload.to_string()))
    }

    /// Report a disconnect on the live connection and close its stream
    pub fn drop_connection(&self, kind: TransportErrorKind, message: impl Into<String>) -> bool {
        let live = self.inner.lock().live.take();
        match live {
            Some((_, tx)) => tx.send(RawEvent::disconnected(kind, message)).is_ok(),
            None => false,
        }
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.inner.lock().live.is_some()
    }

    /// Number of `connect` calls made so far
    pub fn connect_count(&self) -> u32 {
        self.inner.lock().connects
    }

    /// Number of `disconnect` calls made so far
    pub fn disconnect_count(&self) -> u32 {
        self.inner.lock().disconnects
    }

    /// Number of playback interruptions requested
    pub fn interrupt_count(&self) -> u32 {
        self.inner.lock().interrupts
    }

    /// Every mute state requested, in order
    pub fn mute_history(&self) -> Vec<bool> {
        self.inner.lock().mute_history.clone()
    }

    fn check_live(&self, handle: &ConnectionHandle) -> Result<()> {
        match &self.inner.lock().live {
            Some((live, _)) if live == handle => Ok(()),
            _ => Err(Error::Closed),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, config: &ConnectConfig) -> Result<Connection> {
        let outcome = {
            let mut state = self.inner.lock();
            state.connects += 1;
            state
                .outcomes
                .pop_front()
                .unwrap_or_else(ConnectOutcome::accept)
        };

        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }

        if let Err((kind, message)) = outcome.result {
            return Err(Error::from_kind(kind, message));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = format!("scripted-{}", state.next_id);
        let handle = ConnectionHandle::new(
            id.clone(),
            format!("memory://{}/{}", config.room, id),
            config.token.clone(),
        );
        if state.announce_connected {
            let _ = tx.send(RawEvent::connected());
        }
        state.live = Some((handle.clone(), tx));

        Ok(Connection {
            handle,
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        let mut state = self.inner.lock();
        state.disconnects += 1;
        if matches!(&state.live, Some((live, _)) if live == handle) {
            state.live = None;
        }
        Ok(())
    }

    async fn mute_mic(&self, handle: &ConnectionHandle, muted: bool) -> Result<()> {
        self.check_live(handle)?;
        self.inner.lock().mute_history.push(muted);
        Ok(())
    }

    async fn interrupt_playback(&self, handle: &ConnectionHandle) -> Result<()> {
        self.check_live(handle)?;
        self.inner.lock().interrupts += 1;
        Ok(())
    }

    async fn probe(&self, handle: &ConnectionHandle) -> Result<Duration> {
        self.check_live(handle)?;
        let outcome = self.inner.lock().probe_outcomes.pop_front();
        match outcome {
            Some(Ok(latency)) => Ok(latency),
            Some(Err(kind)) => Err(Error::from_kind(kind, "probe failed")),
            None => Ok(Duration::from_millis(20)),
        }
    }
}
