//! Transport adapter: owns the live connection on behalf of the orchestrator
//!
//! Connect and probe run as spawned tasks whose results come back through
//! one channel; raw events from the connection are forwarded into a single
//! ordered queue tagged with a connection generation so that anything from a
//! superseded connection can be discarded.

use cartcall_transport::{
    ConnectConfig, Connection, ConnectionHandle, RawEvent, Transport, TransportError,
    TransportErrorKind,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;

/// Completion of a spawned transport task
pub(crate) enum TaskResult {
    Connect {
        attempt: u64,
        result: Result<Connection, TransportError>,
    },
    Probe {
        attempt: u64,
        result: Result<Duration, TransportError>,
    },
}

pub(crate) struct TransportAdapter {
    transport: Arc<dyn Transport>,
    connect_config: Arc<ConnectConfig>,
    connect_timeout: Duration,
    probe_timeout: Duration,

    handle: Option<ConnectionHandle>,
    /// Identifies the attached connection; bumped on attach and disconnect
    generation: u64,
    /// Identifies in-flight tasks; bumped on every new attempt and on cancel
    attempt: u64,
    pending: CancellationToken,
    pump: Option<CancellationToken>,

    events_tx: mpsc::UnboundedSender<(u64, RawEvent)>,
    results_tx: mpsc::UnboundedSender<TaskResult>,
}

impl TransportAdapter {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: &SessionConfig,
        events_tx: mpsc::UnboundedSender<(u64, RawEvent)>,
        results_tx: mpsc::UnboundedSender<TaskResult>,
    ) -> Self {
        Self {
            transport,
            connect_config: Arc::new(config.connect.clone()),
            connect_timeout: config.connect_timeout,
            probe_timeout: config.probe_timeout,
            handle: None,
            generation: 0,
            attempt: 0,
            pending: CancellationToken::new(),
            pump: None,
            events_tx,
            results_tx,
        }
    }

    pub(crate) fn is_current_generation(&self, generation: u64) -> bool {
        self.handle.is_some() && generation == self.generation
    }

    pub(crate) fn is_current_attempt(&self, attempt: u64) -> bool {
        attempt == self.attempt
    }

    /// Spawn a connect attempt.
    ///
    /// If the attempt is cancelled while the transport is still connecting,
    /// the task waits for the outcome and disconnects whatever it produced.
    pub(crate) fn begin_connect(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.connect_config);
        let token = self.pending.clone();
        let results_tx = self.results_tx.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let connect = tokio::time::timeout(connect_timeout, transport.connect(&config));
            tokio::pin!(connect);

            let outcome = tokio::select! {
                result = &mut connect => Some(result),
                _ = token.cancelled() => None,
            };
            let Some(result) = outcome else {
                if let Ok(Ok(connection)) = connect.await {
                    tracing::debug!(
                        "Releasing connection {} from cancelled attempt",
                        connection.handle.id()
                    );
                    if let Err(e) = transport.disconnect(&connection.handle).await {
                        tracing::warn!("Failed to release cancelled connection: {}", e);
                    }
                }
                return;
            };

            let result = result.unwrap_or_else(|_| {
                Err(TransportError::Network(format!(
                    "connect timed out after {:?}",
                    connect_timeout
                )))
            });
            if let Err(tokio::sync::mpsc::error::SendError(TaskResult::Connect {
                result: Ok(connection),
                ..
            })) = results_tx.send(TaskResult::Connect { attempt, result })
            {
                let _ = transport.disconnect(&connection.handle).await;
            }
        });
    }

    /// Take ownership of a fresh connection and start forwarding its events
    pub(crate) fn attach(&mut self, connection: Connection) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        self.generation += 1;
        let generation = self.generation;
        self.handle = Some(connection.handle);

        let token = CancellationToken::new();
        self.pump = Some(token.clone());
        let events_tx = self.events_tx.clone();
        let mut events = connection.events;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = events.next() => match next {
                        Some(event) => {
                            let disconnect = event.is_disconnect();
                            if events_tx.send((generation, event)).is_err() || disconnect {
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Stream ended without saying why
            let _ = events_tx.send((
                generation,
                RawEvent::disconnected(TransportErrorKind::Network, "event stream ended"),
            ));
        });
    }

    /// Hand a connection nobody wants back to the transport
    pub(crate) fn discard(&self, connection: Connection) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect(&connection.handle).await {
                tracing::warn!("Failed to release stale connection: {}", e);
            }
        });
    }

    /// Abandon in-flight connect and probe tasks
    pub(crate) fn cancel_pending(&mut self) {
        self.pending.cancel();
        self.pending = CancellationToken::new();
        self.attempt += 1;
    }

    /// Release the attached connection, if any
    pub(crate) async fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        self.generation += 1;
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::time::timeout(self.connect_timeout, self.transport.disconnect(&handle)).await {
            Ok(Ok(())) => tracing::debug!("Disconnected {}", handle.id()),
            Ok(Err(e)) => tracing::warn!("Disconnect failed: {}", e),
            Err(_) => tracing::warn!("Disconnect timed out"),
        }
    }

    pub(crate) async fn mute_mic(&self, muted: bool) {
        let Some(handle) = &self.handle else {
            return;
        };
        if let Err(e) = self.transport.mute_mic(handle, muted).await {
            tracing::warn!("Failed to set mic mute to {}: {}", muted, e);
        }
    }

    pub(crate) async fn interrupt_playback(&self) {
        let Some(handle) = &self.handle else {
            return;
        };
        if let Err(e) = self.transport.interrupt_playback(handle).await {
            tracing::warn!("Failed to interrupt playback: {}", e);
        }
    }

    /// Spawn a health probe bounded by the probe timeout
    pub(crate) fn begin_probe(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        let Some(handle) = self.handle.clone() else {
            let _ = self.results_tx.send(TaskResult::Probe {
                attempt,
                result: Err(TransportError::Closed),
            });
            return;
        };

        let transport = Arc::clone(&self.transport);
        let token = self.pending.clone();
        let results_tx = self.results_tx.clone();
        let probe_timeout = self.probe_timeout;

        tokio::spawn(async move {
            let result = tokio::select! {
                result = tokio::time::timeout(probe_timeout, transport.probe(&handle)) => result,
                _ = token.cancelled() => return,
            };
            let result = result.unwrap_or_else(|_| {
                Err(TransportError::Network(format!(
                    "probe timed out after {:?}",
                    probe_timeout
                )))
            });
            let _ = results_tx.send(TaskResult::Probe { attempt, result });
        });
    }
}
