//! Presentation bridge: immutable snapshots, coalesced publishing

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    cart::CartState,
    conversation::ConversationTurn,
    events::Notice,
    machine::{
        ConnectionHealth, Phase, Session, SessionError, SessionMachine, SessionStats,
        TurnTaking,
    },
    projector::ToolCall,
};

/// Read-only view of a call, published on every meaningful change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Increases with every publish
    pub version: u64,
    pub session: Option<Session>,
    pub phase: Phase,
    pub turn_taking: TurnTaking,
    /// Finalized turns in seq order, then in-progress partials
    pub turns: Vec<ConversationTurn>,
    pub tool_calls: Vec<ToolCall>,
    pub cart: CartState,
    pub connection_health: ConnectionHealth,
    pub last_error: Option<SessionError>,
    pub notices: Vec<Notice>,
    pub stats: SessionStats,
    /// Armed machine deadlines (backoff, connect, idle, stability)
    pub pending_timers: usize,
}

impl Snapshot {
    /// Capture the current state of `machine`
    pub fn capture(machine: &SessionMachine, version: u64) -> Self {
        let projector = machine.projector();
        Self {
            version,
            session: machine.session().cloned(),
            phase: machine.phase(),
            turn_taking: machine.turn_taking(),
            turns: projector.turns(),
            tool_calls: projector.tool_calls().to_vec(),
            cart: projector.cart().clone(),
            connection_health: machine.health().clone(),
            last_error: machine.last_error().cloned(),
            notices: machine.notices().cloned().collect(),
            stats: machine.stats(),
            pending_timers: machine.pending_timers(),
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: 0,
            session: None,
            phase: Phase::Idle,
            turn_taking: TurnTaking::Listening,
            turns: Vec::new(),
            tool_calls: Vec::new(),
            cart: CartState::default(),
            connection_health: ConnectionHealth::default(),
            last_error: None,
            notices: Vec::new(),
            stats: SessionStats::default(),
            pending_timers: 0,
        }
    }
}

/// Rate limiter for snapshot publishing.
///
/// Unforced changes inside the interval are deferred to a single deadline;
/// forced changes publish immediately and absorb anything deferred.
#[derive(Debug, Clone)]
pub struct Coalescer {
    interval: Duration,
    last_published: Option<Instant>,
    deadline: Option<Instant>,
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_published: None,
            deadline: None,
        }
    }

    /// Whether a change offered at `now` should be published right away.
    /// If not, a deadline is armed for the deferred publish.
    pub fn offer(&mut self, force: bool, now: Instant) -> bool {
        let next_slot = self.last_published.map(|last| last + self.interval);
        match next_slot {
            _ if force => true,
            None => true,
            Some(slot) if now >= slot => true,
            Some(slot) => {
                self.deadline.get_or_insert(slot);
                false
            }
        }
    }

    pub fn mark_published(&mut self, now: Instant) {
        self.last_published = Some(now);
        self.deadline = None;
    }

    /// When the deferred publish is due
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// Owns the snapshot channels on the orchestrator side
pub(crate) struct Bridge {
    coalescer: Coalescer,
    version: u64,
    broadcast_tx: broadcast::Sender<Arc<Snapshot>>,
    watch_tx: watch::Sender<Arc<Snapshot>>,
}

impl Bridge {
    pub(crate) fn new(
        interval: Duration,
        broadcast_tx: broadcast::Sender<Arc<Snapshot>>,
        watch_tx: watch::Sender<Arc<Snapshot>>,
    ) -> Self {
        Self {
            coalescer: Coalescer::new(interval),
            version: 0,
            broadcast_tx,
            watch_tx,
        }
    }

    /// Offer a change; publishes now or arms the coalescing deadline
    pub(crate) fn offer(&mut self, force: bool, machine: &SessionMachine, now: Instant) {
        if self.coalescer.offer(force, now) {
            self.publish(machine, now);
        }
    }

    /// Publish a deferred change if one is pending
    pub(crate) fn flush(&mut self, machine: &SessionMachine, now: Instant) {
        if self.coalescer.deadline().is_some() {
            self.publish(machine, now);
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.coalescer.deadline()
    }

    fn publish(&mut self, machine: &SessionMachine, now: Instant) {
        self.version += 1;
        let snapshot = Arc::new(Snapshot::capture(machine, self.version));
        self.coalescer.mark_published(now);
        // No subscribers is fine; the watch channel still holds the latest value
        let _ = self.broadcast_tx.send(Arc::clone(&snapshot));
        self.watch_tx.send_replace(snapshot);
    }

    /// Drop any deferred publish
    pub(crate) fn cancel(&mut self) {
        self.coalescer.cancel();
    }
}
