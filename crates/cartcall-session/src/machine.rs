//! Session state machine
//!
//! The machine is sans-IO: every input is a method taking the current
//! instant, and every output is a list of [`Effect`]s for the orchestrator to
//! execute. Timers are plain deadlines owned by the machine; the orchestrator
//! sleeps until [`SessionMachine::next_deadline`] and calls
//! [`SessionMachine::on_timer`].
//!
//! ```text
//! Idle ──start──▶ Connecting ──up──▶ Active ◀──up── Reconnecting
//!                   │  │  │            │  │            ▲   │  │
//!                   │  │  └─cancel─▶ Idle │  └─down────┘   │  │
//!                   │  └──────────────────┴──▶ Failed ◀────┘  │
//!                   └─────────stop────────────▶ Ended ◀───────┘
//! ```

use cartcall_transport::TransportErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    events::{Notice, SessionEvent, ToolResultStatus},
    projector::Projector,
};

/// Lifecycle phase of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Ended,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Active => "active",
            Phase::Reconnecting => "reconnecting",
            Phase::Ended => "ended",
            Phase::Failed => "failed",
        }
    }

    /// `Ended` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ended | Phase::Failed)
    }

    /// A call holds (or is acquiring) transport resources
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Connecting | Phase::Active | Phase::Reconnecting)
    }

    /// Whether `self -> to` is an allowed edge
    pub fn can_transition_to(&self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Connecting, Active | Failed | Idle | Ended)
                | (Active, Reconnecting | Failed | Ended)
                | (Reconnecting, Active | Failed | Ended)
                | (Ended, Idle)
                | (Failed, Idle)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who holds the floor while `Active`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTaking {
    #[default]
    Listening,
    Speaking,
}

/// One call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Transport connection id of the current connection, if any
    pub connection_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Connection attempts made in the current outage
    pub reconnect_attempts: u32,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            connection_id: None,
            created_at: now,
            last_activity: now,
            reconnect_attempts: 0,
        }
    }
}

/// A classified failure shown to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub latency_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub last_error: Option<SessionError>,
    pub consecutive_failures: u32,
}

/// Per-call counters, logged when the call ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub events_processed: u64,
    pub transcripts_finalized: u64,
    pub tool_calls_applied: u64,
    pub tool_calls_failed: u64,
    pub malformed_events: u64,
    pub reconnects: u64,
    pub barge_ins: u64,
}

/// A recorded phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
}

/// Side effects requested by the machine, executed in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start a connection attempt
    Connect,
    /// Release the current connection, if any
    Disconnect,
    /// Abandon in-flight connect and probe work
    CancelPending,
    MuteMic(bool),
    /// Stop assistant audio immediately (barge-in)
    InterruptPlayback,
    /// Round-trip health probe on the current connection
    ProbeHealth,
    /// State changed; `force` bypasses snapshot coalescing
    Publish { force: bool },
}

type Jitter = Box<dyn FnMut() -> f64 + Send>;

pub struct SessionMachine {
    config: SessionConfig,
    phase: Phase,
    turn_taking: TurnTaking,
    session: Option<Session>,
    projector: Projector,
    health: ConnectionHealth,
    last_error: Option<SessionError>,
    notices: VecDeque<Notice>,
    stats: SessionStats,
    transitions: Vec<PhaseChange>,

    /// The transport has handed us a connection that is not yet released
    connected: bool,
    connect_in_flight: bool,
    probe_in_flight: bool,

    // Deadlines
    reconnect_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    idle_at: Option<Instant>,
    stable_at: Option<Instant>,

    jitter: Jitter,
}

impl SessionMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            turn_taking: TurnTaking::Listening,
            session: None,
            projector: Projector::new(),
            health: ConnectionHealth::default(),
            last_error: None,
            notices: VecDeque::new(),
            stats: SessionStats::default(),
            transitions: Vec::new(),
            connected: false,
            connect_in_flight: false,
            probe_in_flight: false,
            reconnect_at: None,
            connect_deadline: None,
            idle_at: None,
            stable_at: None,
            jitter: Box::new(rand::random::<f64>),
        }
    }

    /// Replace the backoff jitter source (samples in `[0, 1)`)
    pub fn with_jitter(mut self, jitter: impl FnMut() -> f64 + Send + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn turn_taking(&self) -> TurnTaking {
        self.turn_taking
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn notices(&self) -> impl Iterator<Item = &Notice> {
        self.notices.iter()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Every phase change since construction
    pub fn transitions(&self) -> &[PhaseChange] {
        &self.transitions
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines().into_iter().flatten().min()
    }

    /// Number of armed deadlines
    pub fn pending_timers(&self) -> usize {
        self.deadlines().iter().filter(|d| d.is_some()).count()
    }

    fn deadlines(&self) -> [Option<Instant>; 4] {
        [
            self.reconnect_at,
            self.connect_deadline,
            self.idle_at,
            self.stable_at,
        ]
    }

    fn clear_timers(&mut self) {
        self.reconnect_at = None;
        self.connect_deadline = None;
        self.idle_at = None;
        self.stable_at = None;
    }

    fn backoff(&mut self, attempt: u32) -> Duration {
        let sample = (self.jitter)();
        self.config.retry.delay_for_attempt(attempt, sample)
    }

    fn transition(&mut self, to: Phase) -> bool {
        let from = self.phase;
        if !from.can_transition_to(to) {
            tracing::error!("Rejected phase transition {} -> {}", from, to);
            return false;
        }
        tracing::info!("Session phase {} -> {}", from, to);
        self.phase = to;
        self.transitions.push(PhaseChange { from, to });
        true
    }

    fn push_notice(&mut self, notice: Notice) {
        if self.notices.len() >= self.config.notice_limit {
            tracing::warn!(
                "Notice queue full ({} notices), dropping oldest",
                self.config.notice_limit
            );
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    fn record_error(&mut self, error: SessionError) {
        self.health.last_error = Some(error.clone());
        self.last_error = Some(error);
    }

    // ===== Control surface =====

    /// Begin a new call. A terminal phase passes through `Idle` first.
    pub fn start_call(&mut self, now: Instant) -> Result<Vec<Effect>> {
        if self.phase.is_live() {
            return Err(Error::CallInProgress(self.phase));
        }
        if self.phase.is_terminal() {
            self.transition(Phase::Idle);
        }

        let session = Session::new();
        tracing::info!("Starting call {}", session.id);
        self.session = Some(session);
        self.projector = Projector::new();
        self.health = ConnectionHealth::default();
        self.last_error = None;
        self.notices.clear();
        self.stats = SessionStats::default();
        self.turn_taking = TurnTaking::Listening;

        self.transition(Phase::Connecting);
        Ok(self.begin_attempt(now))
    }

    /// End the call. No-op outside a live phase.
    pub fn stop_call(&mut self, _now: Instant) -> Vec<Effect> {
        if !self.phase.is_live() {
            tracing::debug!("stop_call in phase {} ignored", self.phase);
            return vec![];
        }
        self.finish(Phase::Ended, None)
    }

    /// Abandon a call that has not connected yet, returning to `Idle`
    pub fn cancel_call(&mut self, _now: Instant) -> Result<Vec<Effect>> {
        if self.phase != Phase::Connecting {
            return Err(Error::NotConnecting(self.phase));
        }
        let mut effects = vec![Effect::CancelPending];
        if self.connected {
            effects.push(Effect::Disconnect);
        }
        self.clear_timers();
        self.release();
        self.transition(Phase::Idle);
        self.session = None;
        effects.push(Effect::Publish { force: true });
        Ok(effects)
    }

    // ===== Transport results =====

    /// A connect attempt produced a connection
    pub fn connect_succeeded(&mut self, connection_id: String, now: Instant) -> Vec<Effect> {
        if !self.connect_in_flight {
            tracing::debug!("Unexpected connect result in phase {}", self.phase);
            return vec![Effect::Disconnect];
        }
        self.connect_in_flight = false;
        self.connected = true;
        if let Some(session) = self.session.as_mut() {
            session.connection_id = Some(connection_id);
        }
        self.touch(now);
        vec![]
    }

    /// A connect attempt failed before producing a connection
    pub fn connect_failed(
        &mut self,
        kind: TransportErrorKind,
        message: String,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.connect_in_flight {
            tracing::debug!("Ignoring stale connect failure: {}", message);
            return vec![];
        }
        self.attempt_failed(SessionError::new(kind, message), now)
    }

    pub fn probe_succeeded(&mut self, latency: Duration, now: Instant) -> Vec<Effect> {
        if !self.probe_in_flight || self.phase != Phase::Active {
            return vec![];
        }
        self.probe_in_flight = false;
        self.health.latency_ms = Some(latency.as_micros() as f64 / 1000.0);
        self.touch(now);
        vec![Effect::Publish { force: false }]
    }

    /// Probe failures always count as network failures
    pub fn probe_failed(
        &mut self,
        kind: TransportErrorKind,
        message: String,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.probe_in_flight || self.phase != Phase::Active {
            return vec![];
        }
        self.probe_in_flight = false;
        tracing::warn!("Health probe failed ({}): {}", kind, message);
        self.connection_lost(
            SessionError::new(
                TransportErrorKind::Network,
                format!("health probe failed: {}", message),
            ),
            now,
        )
    }

    // ===== Timers =====

    /// Fire every deadline at or before `now`
    pub fn on_timer(&mut self, now: Instant) -> Vec<Effect> {
        if !self.phase.is_live() {
            if self.pending_timers() > 0 {
                tracing::warn!("Clearing timers left armed in phase {}", self.phase);
                self.clear_timers();
            }
            return vec![];
        }
        let mut effects = Vec::new();

        if self.connect_deadline.is_some_and(|d| d <= now) {
            self.connect_deadline = None;
            tracing::warn!("Connect attempt timed out");
            effects.extend(self.attempt_failed(
                SessionError::new(TransportErrorKind::Network, "connect timed out"),
                now,
            ));
        }

        if self.reconnect_at.is_some_and(|d| d <= now) {
            self.reconnect_at = None;
            if let Some(session) = self.session.as_mut() {
                session.reconnect_attempts += 1;
                tracing::info!("Connection attempt {}", session.reconnect_attempts);
            }
            effects.extend(self.begin_attempt(now));
        }

        if self.idle_at.is_some_and(|d| d <= now) {
            self.idle_at = None;
            if self.phase == Phase::Active && !self.probe_in_flight {
                tracing::debug!("Transport idle, probing health");
                self.probe_in_flight = true;
                effects.push(Effect::ProbeHealth);
            }
        }

        if self.stable_at.is_some_and(|d| d <= now) {
            self.stable_at = None;
            if self.health.consecutive_failures > 0 {
                tracing::debug!("Connection stable, resetting failure counter");
                self.health.consecutive_failures = 0;
                effects.push(Effect::Publish { force: false });
            }
        }

        effects
    }

    // ===== Events =====

    /// Process one canonical event in arrival order
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) -> Vec<Effect> {
        if !self.phase.is_live() {
            tracing::debug!("Ignoring {} in phase {}", event.name(), self.phase);
            return vec![];
        }
        self.stats.events_processed += 1;
        if self.probe_in_flight {
            tracing::debug!("Transport activity during health probe, connection is alive");
            self.probe_in_flight = false;
        }
        self.touch(now);

        match event {
            SessionEvent::ConnectionUp => self.connection_up(now),
            SessionEvent::ConnectionDown { kind, message } => {
                let error = SessionError::new(kind, message);
                match self.phase {
                    Phase::Active => self.connection_lost(error, now),
                    _ if self.connected || self.connect_in_flight => {
                        self.attempt_failed(error, now)
                    }
                    _ => {
                        tracing::debug!("Ignoring disconnect while between attempts");
                        vec![]
                    }
                }
            }
            SessionEvent::UserSpeechStarted => {
                if self.phase == Phase::Active && self.turn_taking == TurnTaking::Speaking {
                    tracing::debug!("Barge-in, interrupting playback");
                    self.turn_taking = TurnTaking::Listening;
                    self.stats.barge_ins += 1;
                    vec![Effect::InterruptPlayback, Effect::Publish { force: false }]
                } else {
                    vec![]
                }
            }
            SessionEvent::UserSpeechStopped => vec![],
            SessionEvent::AgentSpeechStarted => self.set_turn_taking(TurnTaking::Speaking),
            SessionEvent::AgentSpeechStopped => self.set_turn_taking(TurnTaking::Listening),
            SessionEvent::QualitySample {
                latency_ms,
                packet_loss,
            } => {
                self.health.latency_ms = Some(latency_ms);
                self.health.packet_loss = Some(packet_loss);
                vec![Effect::Publish { force: false }]
            }
            SessionEvent::AgentClosed => {
                tracing::info!("Agent closed the session");
                self.finish(Phase::Ended, None)
            }
            SessionEvent::FatalError { kind, message } => {
                tracing::error!("Fatal transport error: {}", message);
                self.finish(Phase::Failed, Some(SessionError::new(kind, message)))
            }
            SessionEvent::Malformed { reason, .. } => {
                tracing::warn!("Malformed event: {}", reason);
                self.stats.malformed_events += 1;
                self.push_notice(Notice::Malformed { reason });
                vec![Effect::Publish { force: false }]
            }
            event @ (SessionEvent::PartialTranscript { .. }
            | SessionEvent::FinalTranscript { .. }
            | SessionEvent::ToolCallRequested { .. }
            | SessionEvent::ToolCallResult { .. }) => self.project(event),
        }
    }

    fn project(&mut self, event: SessionEvent) -> Vec<Effect> {
        let projection = self.projector.apply(&event);

        if projection.changed {
            match &event {
                SessionEvent::FinalTranscript { .. } => self.stats.transcripts_finalized += 1,
                SessionEvent::ToolCallResult {
                    status: ToolResultStatus::Applied,
                    ..
                } => self.stats.tool_calls_applied += 1,
                SessionEvent::ToolCallResult {
                    status: ToolResultStatus::Failed,
                    ..
                } => self.stats.tool_calls_failed += 1,
                _ => {}
            }
        }

        let noticed = projection.notice.is_some();
        if let Some(notice) = projection.notice {
            self.push_notice(notice);
        }

        if projection.order_placed && self.config.end_on_order_placed {
            tracing::info!("Order placed, ending call");
            return self.finish(Phase::Ended, None);
        }

        if projection.changed || noticed {
            vec![Effect::Publish {
                force: projection.forced,
            }]
        } else {
            vec![]
        }
    }

    fn set_turn_taking(&mut self, to: TurnTaking) -> Vec<Effect> {
        if self.phase != Phase::Active || self.turn_taking == to {
            return vec![];
        }
        self.turn_taking = to;
        vec![Effect::Publish { force: false }]
    }

    fn touch(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            session.last_activity = Utc::now();
        }
        if self.phase == Phase::Active && !self.probe_in_flight {
            self.idle_at = Some(now + self.config.idle_timeout);
        }
    }

    // ===== Connection lifecycle =====

    fn begin_attempt(&mut self, now: Instant) -> Vec<Effect> {
        self.connect_in_flight = true;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        vec![Effect::Connect, Effect::Publish { force: true }]
    }

    fn connection_up(&mut self, now: Instant) -> Vec<Effect> {
        let from = self.phase;
        if !matches!(from, Phase::Connecting | Phase::Reconnecting) {
            tracing::debug!("Ignoring connection up in phase {}", from);
            return vec![];
        }

        self.connect_in_flight = false;
        self.connected = true;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.transition(Phase::Active);
        self.idle_at = Some(now + self.config.idle_timeout);
        self.stable_at = Some(now + self.config.stability_window);
        if let Some(session) = self.session.as_mut() {
            session.reconnect_attempts = 0;
        }

        if from == Phase::Reconnecting {
            self.stats.reconnects += 1;
            if self.projector.replay() {
                tracing::warn!("Cart recomputed after reconnection");
            }
        } else {
            self.projector.acknowledge();
        }
        vec![Effect::Publish { force: true }]
    }

    /// An established connection dropped while `Active`
    fn connection_lost(&mut self, error: SessionError, now: Instant) -> Vec<Effect> {
        tracing::warn!("Connection lost: {}", error);
        self.record_error(error.clone());

        if !error.kind.is_retryable() {
            return self.finish(Phase::Failed, Some(error));
        }
        if self.health.consecutive_failures >= self.config.retry.max_retries {
            tracing::warn!(
                "Connection failed {} times in a row, giving up",
                self.health.consecutive_failures
            );
            return self.finish(Phase::Failed, Some(error));
        }
        self.health.consecutive_failures += 1;

        let mut effects = vec![Effect::CancelPending];
        if self.connected {
            effects.push(Effect::Disconnect);
        }
        self.release();
        self.idle_at = None;
        self.stable_at = None;
        self.turn_taking = TurnTaking::Listening;
        self.transition(Phase::Reconnecting);

        let delay = self.backoff(0);
        if let Some(session) = self.session.as_mut() {
            session.reconnect_attempts = 0;
        }
        tracing::info!("Reconnecting in {:?}", delay);
        self.reconnect_at = Some(now + delay);
        effects.push(Effect::Publish { force: true });
        effects
    }

    /// A connect attempt in `Connecting` or `Reconnecting` did not come up
    fn attempt_failed(&mut self, error: SessionError, now: Instant) -> Vec<Effect> {
        tracing::warn!("Connection attempt failed: {}", error);
        self.record_error(error.clone());
        self.health.consecutive_failures += 1;

        if !error.kind.is_retryable() {
            return self.finish(Phase::Failed, Some(error));
        }

        let attempts = self.session.as_ref().map_or(0, |s| s.reconnect_attempts);
        if attempts >= self.config.retry.max_retries {
            tracing::warn!("Giving up after {} attempts", attempts);
            return self.finish(Phase::Failed, Some(error));
        }

        let mut effects = vec![Effect::CancelPending];
        if self.connected {
            effects.push(Effect::Disconnect);
        }
        self.release();
        let delay = self.backoff(attempts);
        tracing::info!("Retrying connection in {:?}", delay);
        self.reconnect_at = Some(now + delay);
        effects.push(Effect::Publish { force: false });
        effects
    }

    /// Forget the current connection and any in-flight work
    fn release(&mut self) {
        self.connected = false;
        self.connect_in_flight = false;
        self.probe_in_flight = false;
        self.connect_deadline = None;
        if let Some(session) = self.session.as_mut() {
            session.connection_id = None;
        }
    }

    /// Move to a terminal phase, releasing everything
    fn finish(&mut self, to: Phase, error: Option<SessionError>) -> Vec<Effect> {
        let was_connected = self.connected;
        if !self.transition(to) {
            return vec![];
        }
        if let Some(error) = error {
            self.record_error(error);
        }

        self.clear_timers();
        self.release();
        self.turn_taking = TurnTaking::Listening;

        let stats = self.stats;
        tracing::info!(
            "Call {} {}: {} events, {} finalized turns, {} tool calls applied, {} failed, {} malformed, {} reconnects, {} barge-ins",
            self.session.as_ref().map(|s| s.id.to_string()).unwrap_or_default(),
            to,
            stats.events_processed,
            stats.transcripts_finalized,
            stats.tool_calls_applied,
            stats.tool_calls_failed,
            stats.malformed_events,
            stats.reconnects,
            stats.barge_ins
        );

        let mut effects = vec![Effect::CancelPending];
        if was_connected {
            effects.push(Effect::MuteMic(true));
        }
        effects.push(Effect::Disconnect);
        effects.push(Effect::Publish { force: true });
        effects
    }
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("phase", &self.phase)
            .field("turn_taking", &self.turn_taking)
            .field("session", &self.session)
            .field("connected", &self.connected)
            .field("pending_timers", &self.pending_timers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AddArgs, OrderArgs, SearchArgs, Speaker, ToolArgs};

    fn machine() -> SessionMachine {
        SessionMachine::new(SessionConfig::default()).with_jitter(|| 0.0)
    }

    /// Drive a fresh machine to `Active`
    fn active(t0: Instant) -> SessionMachine {
        let mut m = machine();
        m.start_call(t0).unwrap();
        m.connect_succeeded("c1".into(), t0);
        m.handle_event(SessionEvent::ConnectionUp, t0);
        assert_eq!(m.phase(), Phase::Active);
        m
    }

    fn network_down() -> SessionEvent {
        SessionEvent::ConnectionDown {
            kind: TransportErrorKind::Network,
            message: "network unreachable".into(),
        }
    }

    fn assert_edges_valid(m: &SessionMachine) {
        for change in m.transitions() {
            assert!(
                change.from.can_transition_to(change.to),
                "illegal edge {} -> {}",
                change.from,
                change.to
            );
        }
    }

    #[test]
    fn test_edge_table() {
        use Phase::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Active));
        assert!(!Idle.can_transition_to(Reconnecting));
        assert!(Connecting.can_transition_to(Idle));
        assert!(!Active.can_transition_to(Connecting));
        assert!(!Active.can_transition_to(Idle));
        assert!(!Reconnecting.can_transition_to(Idle));
        assert!(Ended.can_transition_to(Idle));
        assert!(!Ended.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_start_call_goes_through_connecting() {
        let t0 = Instant::now();
        let mut m = machine();
        let effects = m.start_call(t0).unwrap();
        assert_eq!(effects[0], Effect::Connect);
        assert_eq!(m.phase(), Phase::Connecting);
        assert!(m.session().is_some());

        // Events before ConnectionUp cannot make the call active
        m.handle_event(SessionEvent::AgentSpeechStarted, t0);
        assert_eq!(m.phase(), Phase::Connecting);

        m.connect_succeeded("c1".into(), t0);
        m.handle_event(SessionEvent::ConnectionUp, t0);
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(
            m.transitions(),
            &[
                PhaseChange {
                    from: Phase::Idle,
                    to: Phase::Connecting
                },
                PhaseChange {
                    from: Phase::Connecting,
                    to: Phase::Active
                }
            ]
        );
    }

    #[test]
    fn test_start_call_while_live_is_rejected() {
        let t0 = Instant::now();
        let mut m = active(t0);
        assert!(matches!(
            m.start_call(t0),
            Err(Error::CallInProgress(Phase::Active))
        ));
    }

    #[test]
    fn test_restart_after_terminal_passes_through_idle() {
        let t0 = Instant::now();
        let mut m = active(t0);
        let first = m.session().unwrap().id;
        m.stop_call(t0);
        m.start_call(t0).unwrap();
        assert_ne!(m.session().unwrap().id, first);
        let phases: Vec<Phase> = m.transitions().iter().map(|c| c.to).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Connecting,
                Phase::Active,
                Phase::Ended,
                Phase::Idle,
                Phase::Connecting
            ]
        );
        assert_edges_valid(&m);
    }

    #[test]
    fn test_barge_in_same_step() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(SessionEvent::AgentSpeechStarted, t0);
        assert_eq!(m.turn_taking(), TurnTaking::Speaking);

        let effects = m.handle_event(SessionEvent::UserSpeechStarted, t0);
        assert_eq!(m.turn_taking(), TurnTaking::Listening);
        assert!(effects.contains(&Effect::InterruptPlayback));
        assert_eq!(m.stats().barge_ins, 1);

        // Not speaking: no interrupt
        let effects = m.handle_event(SessionEvent::UserSpeechStarted, t0);
        assert!(!effects.contains(&Effect::InterruptPlayback));
    }

    #[test]
    fn test_stop_call_from_every_live_phase() {
        let t0 = Instant::now();

        let mut connecting = machine();
        connecting.start_call(t0).unwrap();

        let mut live = active(t0);

        let mut reconnecting = active(t0);
        reconnecting.handle_event(network_down(), t0);
        assert_eq!(reconnecting.phase(), Phase::Reconnecting);

        let mut retrying = machine();
        retrying.start_call(t0).unwrap();
        retrying.connect_failed(TransportErrorKind::Network, "refused".into(), t0);
        assert_eq!(retrying.phase(), Phase::Connecting);

        for m in [&mut connecting, &mut live, &mut reconnecting, &mut retrying] {
            assert!(m.pending_timers() > 0);
            let effects = m.stop_call(t0);
            assert_eq!(m.phase(), Phase::Ended);
            assert_eq!(m.pending_timers(), 0);
            assert_eq!(m.next_deadline(), None);
            assert!(effects.contains(&Effect::CancelPending));
            assert!(effects.contains(&Effect::Disconnect));
            assert_edges_valid(m);
        }
    }

    #[test]
    fn test_stop_call_mutes_before_disconnect() {
        let t0 = Instant::now();
        let mut m = active(t0);
        let effects = m.stop_call(t0);
        let mute = effects.iter().position(|e| *e == Effect::MuteMic(true));
        let disconnect = effects.iter().position(|e| *e == Effect::Disconnect);
        assert!(mute.unwrap() < disconnect.unwrap());
    }

    #[test]
    fn test_stop_call_when_idle_is_noop() {
        let t0 = Instant::now();
        let mut m = machine();
        assert!(m.stop_call(t0).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_cancel_call_returns_to_idle() {
        let t0 = Instant::now();
        let mut m = machine();
        m.start_call(t0).unwrap();
        m.connect_succeeded("c1".into(), t0);
        let effects = m.cancel_call(t0).unwrap();
        assert_eq!(m.phase(), Phase::Idle);
        assert!(effects.contains(&Effect::CancelPending));
        assert!(effects.contains(&Effect::Disconnect));
        assert_eq!(m.pending_timers(), 0);
        assert!(m.session().is_none());

        let mut m = active(t0);
        assert!(matches!(
            m.cancel_call(t0),
            Err(Error::NotConnecting(Phase::Active))
        ));
    }

    #[test]
    fn test_cancel_during_connect_backoff_clears_retry() {
        let t0 = Instant::now();
        let mut m = machine();
        m.start_call(t0).unwrap();
        m.connect_failed(TransportErrorKind::Network, "refused".into(), t0);
        assert!(m.next_deadline().is_some());

        m.cancel_call(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(m.pending_timers(), 0);
        assert_eq!(m.next_deadline(), None);

        // Nothing fires later either
        assert!(m.on_timer(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn test_network_failure_scenario() {
        let t0 = Instant::now();
        let mut m = active(t0);
        assert_eq!(m.health().consecutive_failures, 0);

        m.handle_event(network_down(), t0);
        assert_eq!(m.phase(), Phase::Reconnecting);

        let mut connects = 0;
        while m.phase() == Phase::Reconnecting {
            let now = m.next_deadline().expect("retry scheduled");
            let effects = m.on_timer(now);
            if effects.contains(&Effect::Connect) {
                connects += 1;
                m.connect_failed(TransportErrorKind::Network, "unreachable".into(), now);
            }
            assert!(connects <= 3, "too many attempts");
        }

        assert_eq!(connects, 3);
        assert_eq!(m.phase(), Phase::Failed);
        assert_eq!(m.last_error().unwrap().kind, TransportErrorKind::Network);
        assert_eq!(m.pending_timers(), 0);
        assert_edges_valid(&m);
    }

    #[test]
    fn test_backoff_between_attempts_non_decreasing() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(network_down(), t0);

        let mut gaps = Vec::new();
        let mut last = t0;
        while m.phase() == Phase::Reconnecting {
            let deadline = m.next_deadline().unwrap();
            let effects = m.on_timer(deadline);
            if effects.contains(&Effect::Connect) {
                gaps.push(deadline - last);
                m.connect_failed(TransportErrorKind::Network, "unreachable".into(), deadline);
                last = deadline;
            }
        }
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
    }

    #[test]
    fn test_reconnect_success_resets_attempts() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(network_down(), t0);
        let at = m.next_deadline().unwrap();
        assert_eq!(m.on_timer(at)[0], Effect::Connect);
        assert_eq!(m.session().unwrap().reconnect_attempts, 1);

        m.connect_succeeded("c2".into(), at);
        m.handle_event(SessionEvent::ConnectionUp, at);
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(m.session().unwrap().reconnect_attempts, 0);
        assert_eq!(m.session().unwrap().connection_id.as_deref(), Some("c2"));
        assert_eq!(m.stats().reconnects, 1);
    }

    #[test]
    fn test_failure_counter_resets_after_stability_window() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(network_down(), t0);
        let at = m.next_deadline().unwrap();
        m.on_timer(at);
        m.connect_succeeded("c2".into(), at);
        m.handle_event(SessionEvent::ConnectionUp, at);
        assert_eq!(m.health().consecutive_failures, 1);

        let later = at + Duration::from_secs(10);
        m.on_timer(later);
        assert_eq!(m.health().consecutive_failures, 0);
    }

    #[test]
    fn test_flapping_connection_fails() {
        let t0 = Instant::now();
        let mut m = active(t0);
        for _ in 0..3 {
            m.handle_event(network_down(), t0);
            assert_eq!(m.phase(), Phase::Reconnecting);
            let at = m.next_deadline().unwrap();
            m.on_timer(at);
            m.connect_succeeded("c".into(), at);
            m.handle_event(SessionEvent::ConnectionUp, at);
            assert_eq!(m.phase(), Phase::Active);
        }
        // Three drops inside the stability window exhaust the budget
        m.handle_event(network_down(), t0);
        assert_eq!(m.phase(), Phase::Failed);
    }

    #[test]
    fn test_auth_failures_are_not_retried() {
        let t0 = Instant::now();
        let mut m = machine();
        m.start_call(t0).unwrap();
        m.connect_failed(TransportErrorKind::Auth, "token expired".into(), t0);
        assert_eq!(m.phase(), Phase::Failed);
        assert_eq!(m.last_error().unwrap().kind, TransportErrorKind::Auth);

        let mut m = active(t0);
        m.handle_event(
            SessionEvent::ConnectionDown {
                kind: TransportErrorKind::Unsupported,
                message: "codec".into(),
            },
            t0,
        );
        assert_eq!(m.phase(), Phase::Failed);
    }

    #[test]
    fn test_connecting_retries_network_failures() {
        let t0 = Instant::now();
        let mut m = machine();
        m.start_call(t0).unwrap();

        let mut connects = 1;
        m.connect_failed(TransportErrorKind::Network, "refused".into(), t0);
        while m.phase() == Phase::Connecting {
            let at = m.next_deadline().unwrap();
            if m.on_timer(at).contains(&Effect::Connect) {
                connects += 1;
                m.connect_failed(TransportErrorKind::Network, "refused".into(), at);
            }
        }
        assert_eq!(connects, 4);
        assert_eq!(m.phase(), Phase::Failed);
        assert_edges_valid(&m);
    }

    #[test]
    fn test_connect_timeout_counts_as_failure() {
        let t0 = Instant::now();
        let mut m = machine();
        m.start_call(t0).unwrap();
        let effects = m.on_timer(t0 + Duration::from_secs(10));
        assert!(effects.contains(&Effect::CancelPending));
        assert_eq!(m.phase(), Phase::Connecting);
        assert_eq!(m.health().consecutive_failures, 1);
        assert!(m.next_deadline().is_some());
    }

    #[test]
    fn test_idle_probe() {
        let t0 = Instant::now();
        let mut m = active(t0);
        let idle = t0 + Duration::from_secs(30);
        assert_eq!(m.on_timer(idle - Duration::from_millis(1)), vec![]);
        let effects = m.on_timer(idle);
        assert!(effects.contains(&Effect::ProbeHealth));

        m.probe_succeeded(Duration::from_millis(42), idle);
        assert_eq!(m.health().latency_ms, Some(42.0));
        assert_eq!(m.phase(), Phase::Active);

        let effects = m.on_timer(idle + Duration::from_secs(30));
        assert!(effects.contains(&Effect::ProbeHealth));
        m.probe_failed(
            TransportErrorKind::Network,
            "timeout".into(),
            idle + Duration::from_secs(30),
        );
        assert_eq!(m.phase(), Phase::Reconnecting);
    }

    #[test]
    fn test_activity_during_health_check_proves_liveness() {
        let t0 = Instant::now();
        let mut m = active(t0);
        let idle = t0 + Duration::from_secs(30);
        assert!(m.on_timer(idle).contains(&Effect::ProbeHealth));

        m.handle_event(
            SessionEvent::FinalTranscript {
                speaker: Speaker::User,
                text: "still here".into(),
                seq: 1,
            },
            idle + Duration::from_secs(1),
        );
        let effects = m.probe_failed(
            TransportErrorKind::Network,
            "timeout".into(),
            idle + Duration::from_secs(5),
        );
        assert!(effects.is_empty());
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(m.projector().turns().len(), 1);
        assert_eq!(m.next_deadline(), Some(idle + Duration::from_secs(31)));
    }

    #[test]
    fn test_activity_defers_probe() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(SessionEvent::UserSpeechStopped, t0 + Duration::from_secs(20));
        assert!(m.on_timer(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(
            m.next_deadline(),
            Some(t0 + Duration::from_secs(50))
        );
    }

    #[test]
    fn test_hoodie_scenario() {
        let t0 = Instant::now();
        let mut m = active(t0);

        let effects = m.handle_event(
            SessionEvent::FinalTranscript {
                speaker: Speaker::User,
                text: "show me hoodies".into(),
                seq: 1,
            },
            t0,
        );
        assert_eq!(effects, vec![Effect::Publish { force: true }]);
        m.handle_event(
            SessionEvent::ToolCallRequested {
                id: "t1".into(),
                args: ToolArgs::SearchProducts(SearchArgs::default()),
                seq: 2,
            },
            t0,
        );
        m.handle_event(
            SessionEvent::ToolCallResult {
                id: "t1".into(),
                status: ToolResultStatus::Applied,
                error: None,
            },
            t0,
        );
        assert_eq!(m.projector().turns().len(), 1);
        assert!(m.projector().cart().is_empty());

        m.handle_event(
            SessionEvent::ToolCallRequested {
                id: "t2".into(),
                args: ToolArgs::AddToCart(AddArgs {
                    item: "hoodie-black-M".into(),
                    quantity: 1,
                    variant: None,
                }),
                seq: 3,
            },
            t0,
        );
        let result = SessionEvent::ToolCallResult {
            id: "t2".into(),
            status: ToolResultStatus::Applied,
            error: None,
        };
        let effects = m.handle_event(result.clone(), t0);
        assert_eq!(effects, vec![Effect::Publish { force: true }]);
        assert_eq!(m.projector().cart().quantity("hoodie-black-M"), 1);

        let cart = m.projector().cart().clone();
        assert!(m.handle_event(result, t0).is_empty());
        assert_eq!(m.projector().cart(), &cart);
        assert_eq!(m.stats().tool_calls_applied, 2);
    }

    #[test]
    fn test_order_placed_ends_call() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(
            SessionEvent::ToolCallRequested {
                id: "o1".into(),
                args: ToolArgs::PlaceOrder(OrderArgs::default()),
                seq: 1,
            },
            t0,
        );
        m.handle_event(
            SessionEvent::ToolCallResult {
                id: "o1".into(),
                status: ToolResultStatus::Applied,
                error: None,
            },
            t0,
        );
        assert_eq!(m.phase(), Phase::Ended);
        assert!(m.projector().cart().order_confirmed);
    }

    #[test]
    fn test_order_placed_keeps_call_when_configured() {
        let t0 = Instant::now();
        let config = SessionConfig {
            end_on_order_placed: false,
            ..SessionConfig::default()
        };
        let mut m = SessionMachine::new(config);
        m.start_call(t0).unwrap();
        m.connect_succeeded("c1".into(), t0);
        m.handle_event(SessionEvent::ConnectionUp, t0);
        m.handle_event(
            SessionEvent::ToolCallRequested {
                id: "o1".into(),
                args: ToolArgs::PlaceOrder(OrderArgs::default()),
                seq: 1,
            },
            t0,
        );
        m.handle_event(
            SessionEvent::ToolCallResult {
                id: "o1".into(),
                status: ToolResultStatus::Applied,
                error: None,
            },
            t0,
        );
        assert_eq!(m.phase(), Phase::Active);
    }

    #[test]
    fn test_agent_close_and_fatal() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.handle_event(SessionEvent::AgentClosed, t0);
        assert_eq!(m.phase(), Phase::Ended);
        assert!(m.last_error().is_none());

        let mut m = active(t0);
        m.handle_event(
            SessionEvent::FatalError {
                kind: TransportErrorKind::Unsupported,
                message: "media server crashed".into(),
            },
            t0,
        );
        assert_eq!(m.phase(), Phase::Failed);
        assert_eq!(m.last_error().unwrap().message, "media server crashed");
    }

    #[test]
    fn test_malformed_becomes_bounded_notice() {
        let t0 = Instant::now();
        let config = SessionConfig {
            notice_limit: 2,
            ..SessionConfig::default()
        };
        let mut m = SessionMachine::new(config);
        m.start_call(t0).unwrap();
        for i in 0..3 {
            m.handle_event(
                SessionEvent::Malformed {
                    raw: "{}".into(),
                    reason: format!("bad {}", i),
                },
                t0,
            );
        }
        let notices: Vec<&Notice> = m.notices().collect();
        assert_eq!(notices.len(), 2);
        assert_eq!(
            notices[0],
            &Notice::Malformed {
                reason: "bad 1".into()
            }
        );
        assert_eq!(m.stats().malformed_events, 3);
        assert_eq!(m.phase(), Phase::Connecting);
    }

    #[test]
    fn test_events_after_terminal_ignored() {
        let t0 = Instant::now();
        let mut m = active(t0);
        m.stop_call(t0);
        assert!(m.handle_event(SessionEvent::ConnectionUp, t0).is_empty());
        assert!(m.handle_event(network_down(), t0).is_empty());
        assert_eq!(m.phase(), Phase::Ended);
    }
}
