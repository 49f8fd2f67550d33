//! A cloneable handle for driving a session from UI code.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    bridge::Snapshot,
    error::{Error, Result},
    machine::Phase,
};

/// Requests sent to the orchestrator loop
pub(crate) enum Command {
    StartCall {
        reply: oneshot::Sender<Result<Uuid>>,
    },
    StopCall {
        reply: oneshot::Sender<Phase>,
    },
    CancelCall {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// A cloneable handle to a running orchestrator.
///
/// `start_call`, `stop_call` and `cancel_call` are the only ways to change
/// the session; everything else is read-only.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshots: broadcast::Sender<Arc<Snapshot>>,
    latest: watch::Receiver<Arc<Snapshot>>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        snapshots: broadcast::Sender<Arc<Snapshot>>,
        latest: watch::Receiver<Arc<Snapshot>>,
    ) -> Self {
        Self {
            commands,
            snapshots,
            latest,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Start a call, returning the new session id
    pub async fn start_call(&self) -> Result<Uuid> {
        self.request(|reply| Command::StartCall { reply }).await?
    }

    /// End the current call. Returns the phase afterwards.
    pub async fn stop_call(&self) -> Result<Phase> {
        self.request(|reply| Command::StopCall { reply }).await
    }

    /// Abandon a call that is still connecting
    pub async fn cancel_call(&self) -> Result<()> {
        self.request(|reply| Command::CancelCall { reply }).await?
    }

    /// Stop the orchestrator loop. Any live call is ended first.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    /// Published snapshots as a stream; lagged gaps are skipped
    pub fn snapshot_stream(&self) -> impl Stream<Item = Arc<Snapshot>> + use<> {
        BroadcastStream::new(self.snapshots.subscribe()).filter_map(|item| async move {
            match item {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!("Snapshot subscriber lagged: {}", e);
                    None
                }
            }
        })
    }

    /// The most recently published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.latest.borrow())
    }

    /// Wait until the latest snapshot satisfies `predicate`
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Snapshot) -> bool) -> Result<Arc<Snapshot>> {
        let mut rx = self.latest.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(Arc::clone(&snapshot))
    }

    /// Wait until the session reaches `phase`
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<Arc<Snapshot>> {
        self.wait_for(|snapshot| snapshot.phase == phase).await
    }

    /// Wait until the session reaches `phase`, with a timeout.
    /// Returns `None` on timeout.
    pub async fn wait_for_phase_timeout(
        &self,
        phase: Phase,
        timeout: Duration,
    ) -> Option<Arc<Snapshot>> {
        tokio::time::timeout(timeout, self.wait_for_phase(phase))
            .await
            .ok()
            .and_then(|r| r.ok())
    }
}
