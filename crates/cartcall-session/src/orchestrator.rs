//! The session event loop
//!
//! One task owns the state machine, the transport adapter and the bridge.
//! Commands, task completions, transport events and timers are all funnelled
//! through a single `select!` and handled strictly one at a time.

use cartcall_transport::{RawEvent, Transport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::{
    adapter::{TaskResult, TransportAdapter},
    bridge::{Bridge, Snapshot},
    config::SessionConfig,
    error::Error,
    handle::{Command, SessionHandle},
    machine::{Effect, SessionMachine},
    normalizer::normalize,
};

pub struct Orchestrator {
    machine: SessionMachine,
    adapter: TransportAdapter,
    bridge: Bridge,
    commands: mpsc::Receiver<Command>,
    events_rx: mpsc::UnboundedReceiver<(u64, RawEvent)>,
    results_rx: mpsc::UnboundedReceiver<TaskResult>,
}

impl Orchestrator {
    /// Create an orchestrator and the handle that controls it.
    /// Nothing happens until [`Orchestrator::run`] is awaited.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(256);
        let (watch_tx, watch_rx) = watch::channel(Arc::new(Snapshot::default()));

        let adapter = TransportAdapter::new(transport, &config, events_tx, results_tx);
        let bridge = Bridge::new(config.coalesce_interval, broadcast_tx.clone(), watch_tx);
        let handle = SessionHandle::new(commands_tx, broadcast_tx, watch_rx);

        let orchestrator = Self {
            machine: SessionMachine::new(config),
            adapter,
            bridge,
            commands,
            events_rx,
            results_rx,
        };
        (orchestrator, handle)
    }

    /// Spawn the loop on the current runtime
    pub fn spawn(config: SessionConfig, transport: Arc<dyn Transport>) -> SessionHandle {
        let (orchestrator, handle) = Self::new(config, transport);
        tokio::spawn(orchestrator.run());
        handle
    }

    /// Replace the backoff jitter source
    pub fn with_jitter(mut self, jitter: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.machine = self.machine.with_jitter(jitter);
        self
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        tracing::debug!("Session orchestrator started");
        loop {
            let machine_deadline = self.machine.next_deadline();
            let publish_deadline = self.bridge.deadline();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(result) = self.results_rx.recv() => self.handle_result(result).await,
                Some((generation, raw)) = self.events_rx.recv() => {
                    self.handle_raw(generation, raw).await
                }
                _ = sleep_until(machine_deadline) => {
                    let effects = self.machine.on_timer(Instant::now());
                    self.execute(effects).await;
                }
                _ = sleep_until(publish_deadline) => {
                    self.bridge.flush(&self.machine, Instant::now());
                }
            }
        }

        let effects = self.machine.stop_call(Instant::now());
        self.execute(effects).await;
        self.adapter.cancel_pending();
        self.adapter.disconnect().await;
        tracing::debug!("Session orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::StartCall { reply } => {
                let result = self.machine.start_call(now);
                let result = match result {
                    Ok(effects) => {
                        let id = self.machine.session().map(|s| s.id);
                        self.execute(effects).await;
                        id.ok_or(Error::Closed)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::StopCall { reply } => {
                let effects = self.machine.stop_call(now);
                self.execute(effects).await;
                let _ = reply.send(self.machine.phase());
            }
            Command::CancelCall { reply } => {
                let result = self.machine.cancel_call(now);
                let result = match result {
                    Ok(effects) => {
                        self.execute(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_result(&mut self, result: TaskResult) {
        let now = Instant::now();
        match result {
            TaskResult::Connect { attempt, result } => {
                if !self.adapter.is_current_attempt(attempt) {
                    tracing::debug!("Dropping result of superseded connect attempt");
                    if let Ok(connection) = result {
                        self.adapter.discard(connection);
                    }
                    return;
                }
                let effects = match result {
                    Ok(connection) => {
                        let id = connection.handle.id().to_string();
                        self.adapter.attach(connection);
                        self.machine.connect_succeeded(id, now)
                    }
                    Err(e) => self.machine.connect_failed(e.kind(), e.to_string(), now),
                };
                self.execute(effects).await;
            }
            TaskResult::Probe { attempt, result } => {
                // Events already delivered on this connection come first
                while let Ok((generation, raw)) = self.events_rx.try_recv() {
                    self.handle_raw(generation, raw).await;
                }
                if !self.adapter.is_current_attempt(attempt) {
                    return;
                }
                let effects = match result {
                    Ok(latency) => self.machine.probe_succeeded(latency, now),
                    Err(e) => self.machine.probe_failed(e.kind(), e.to_string(), now),
                };
                self.execute(effects).await;
            }
        }
    }

    async fn handle_raw(&mut self, generation: u64, raw: RawEvent) {
        if !self.adapter.is_current_generation(generation) {
            tracing::debug!("Dropping event from superseded connection");
            return;
        }
        let event = normalize(raw);
        tracing::trace!("Session event: {}", event.name());
        let effects = self.machine.handle_event(event, Instant::now());
        self.execute(effects).await;
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Connect => self.adapter.begin_connect(),
                Effect::Disconnect => self.adapter.disconnect().await,
                Effect::CancelPending => self.adapter.cancel_pending(),
                Effect::MuteMic(muted) => self.adapter.mute_mic(muted).await,
                Effect::InterruptPlayback => self.adapter.interrupt_playback().await,
                Effect::ProbeHealth => self.adapter.begin_probe(),
                Effect::Publish { force } => {
                    if force && self.machine.phase().is_terminal() {
                        self.bridge.cancel();
                    }
                    self.bridge.offer(force, &self.machine, Instant::now());
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
