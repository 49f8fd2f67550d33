//! Conversation & cart projector
//!
//! Folds transcript and tool-call events into the turn log and the cart.
//! Every operation is idempotent under duplicate delivery: a final turn,
//! tool call or tool result seen twice changes nothing the second time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{
    cart::CartState,
    conversation::{ConversationTurn, TurnLog, TurnOutcome},
    events::{Notice, SessionEvent, Speaker, ToolArgs, ToolCallKind, ToolResultStatus},
};

/// Lifecycle of a tool call. `Applied` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Applied,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolCallStatus::Pending)
    }
}

/// An agent-issued action and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolCallKind,
    pub args: ToolArgs,
    pub status: ToolCallStatus,
    pub seq: u64,
    /// Seq of the conversation turn this call belongs to
    pub turn_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Effect of projecting one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    /// Projected state changed
    pub changed: bool,
    /// The change must be published immediately (finalized turn or cart mutation)
    pub forced: bool,
    /// A `place_order` call was applied
    pub order_placed: bool,
    pub notice: Option<Notice>,
}

impl Projection {
    fn unchanged() -> Self {
        Self::default()
    }

    fn notice(notice: Notice) -> Self {
        Self {
            notice: Some(notice),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Projector {
    turns: TurnLog,
    calls: Vec<ToolCall>,
    index: HashMap<String, usize>,
    cart: CartState,
    /// Seqs taken by final turns and tool calls
    committed: BTreeSet<u64>,
    newest_applied_seq: Option<u64>,
    acknowledged_seq: Option<u64>,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a canonical event. Events that carry no conversation or cart
    /// content are ignored.
    pub fn apply(&mut self, event: &SessionEvent) -> Projection {
        match event {
            SessionEvent::PartialTranscript { speaker, text, seq } => {
                self.on_partial(*speaker, text, *seq)
            }
            SessionEvent::FinalTranscript { speaker, text, seq } => {
                self.on_final(*speaker, text, *seq)
            }
            SessionEvent::ToolCallRequested { id, args, seq } => self.on_request(id, args, *seq),
            SessionEvent::ToolCallResult { id, status, error } => {
                self.on_result(id, *status, error.as_deref())
            }
            _ => Projection::unchanged(),
        }
    }

    fn on_partial(&mut self, speaker: Speaker, text: &str, seq: u64) -> Projection {
        if self.committed.contains(&seq) {
            tracing::debug!("Ignoring partial transcript with committed seq {}", seq);
            return Projection::unchanged();
        }
        match self.turns.apply_partial(speaker, text.to_string(), seq) {
            TurnOutcome::Stale => {
                tracing::debug!("Ignoring stale partial transcript seq {}", seq);
                Projection::unchanged()
            }
            outcome => Projection {
                changed: outcome.changed(),
                ..Projection::default()
            },
        }
    }

    fn on_final(&mut self, speaker: Speaker, text: &str, seq: u64) -> Projection {
        if self.turns.has_final(speaker, seq) {
            tracing::debug!("Ignoring duplicate final transcript seq {}", seq);
            return Projection::unchanged();
        }
        if self.committed.contains(&seq) {
            tracing::warn!("Final transcript reuses seq {}", seq);
            return Projection::notice(Notice::SequenceConflict { seq });
        }

        let outcome = self.turns.apply_final(speaker, text.to_string(), seq);
        if outcome == TurnOutcome::Inserted {
            tracing::warn!("Final transcript seq {} arrived out of order", seq);
        }
        self.committed.insert(seq);
        Projection {
            changed: true,
            forced: true,
            ..Projection::default()
        }
    }

    fn on_request(&mut self, id: &str, args: &ToolArgs, seq: u64) -> Projection {
        if self.index.contains_key(id) {
            tracing::debug!("Ignoring duplicate tool call {}", id);
            return Projection::unchanged();
        }
        if self.committed.contains(&seq) {
            tracing::warn!("Tool call {} reuses seq {}", id, seq);
            return Projection::notice(Notice::SequenceConflict { seq });
        }

        self.committed.insert(seq);
        self.index.insert(id.to_string(), self.calls.len());
        self.calls.push(ToolCall {
            id: id.to_string(),
            kind: args.kind(),
            args: args.clone(),
            status: ToolCallStatus::Pending,
            seq,
            turn_seq: self.turns.owning_turn(seq),
            error: None,
        });
        Projection {
            changed: true,
            ..Projection::default()
        }
    }

    fn on_result(&mut self, id: &str, status: ToolResultStatus, error: Option<&str>) -> Projection {
        let Some(&slot) = self.index.get(id) else {
            tracing::warn!("Result for unknown tool call {}", id);
            return Projection::notice(Notice::UnknownToolCall { id: id.to_string() });
        };

        let call = &mut self.calls[slot];
        if call.status.is_terminal() {
            tracing::debug!("Ignoring repeated result for tool call {}", id);
            return Projection::unchanged();
        }

        match status {
            ToolResultStatus::Failed => {
                let message = error.unwrap_or("tool call failed").to_string();
                tracing::warn!("Tool call {} ({}) failed: {}", id, call.kind, message);
                call.status = ToolCallStatus::Failed;
                call.error = Some(message.clone());
                Projection {
                    changed: true,
                    forced: false,
                    order_placed: false,
                    notice: Some(Notice::ToolCallFailure {
                        id: id.to_string(),
                        tool: call.kind,
                        message,
                    }),
                }
            }
            ToolResultStatus::Applied => {
                call.status = ToolCallStatus::Applied;
                let seq = call.seq;
                let order_placed = call.kind == ToolCallKind::PlaceOrder;

                let cart_changed = match self.newest_applied_seq {
                    Some(newest) if seq < newest => {
                        tracing::debug!(
                            "Tool call {} applied behind seq {}, re-folding cart",
                            id,
                            newest
                        );
                        let refolded = CartState::fold(self.applied_calls());
                        let changed = refolded != self.cart;
                        self.cart = refolded;
                        changed
                    }
                    _ => {
                        let args = self.calls[slot].args.clone();
                        self.cart.apply(&args, seq)
                    }
                };
                self.newest_applied_seq = Some(self.newest_applied_seq.map_or(seq, |n| n.max(seq)));

                Projection {
                    changed: true,
                    forced: cart_changed,
                    order_placed,
                    notice: None,
                }
            }
        }
    }

    fn applied_calls(&self) -> impl Iterator<Item = (u64, &ToolArgs)> {
        self.calls
            .iter()
            .filter(|c| c.status == ToolCallStatus::Applied)
            .map(|c| (c.seq, &c.args))
    }

    /// Recompute the cart from the applied calls after a reconnection.
    ///
    /// Calls up to the last acknowledged seq form the base, the rest are
    /// folded on top. If the result differs from the incremental cart the
    /// divergence is logged and the recomputed cart replaces it. Returns
    /// whether the cart changed.
    pub fn replay(&mut self) -> bool {
        let acknowledged = self.acknowledged_seq;
        let base = CartState::fold(
            self.applied_calls()
                .filter(|(seq, _)| acknowledged.is_some_and(|ack| *seq <= ack)),
        );
        let replayed = base.fold_onto(
            self.applied_calls()
                .filter(|(seq, _)| acknowledged.is_none_or(|ack| *seq > ack)),
        );

        let diverged = replayed != self.cart;
        if diverged {
            tracing::warn!(
                "Cart diverged on replay: had [{}], recomputed [{}]",
                self.cart.summary(),
                replayed.summary()
            );
            self.cart = replayed;
        }
        self.acknowledge();
        diverged
    }

    /// Mark everything applied so far as acknowledged
    pub fn acknowledge(&mut self) {
        self.acknowledged_seq = self.newest_applied_seq;
    }

    pub fn acknowledged_seq(&self) -> Option<u64> {
        self.acknowledged_seq
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.turns()
    }

    pub fn cart(&self) -> &CartState {
        &self.cart
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.index.get(id).map(|&i| &self.calls[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AddArgs, OrderArgs, SearchArgs, UpdateArgs};

    fn final_turn(speaker: Speaker, text: &str, seq: u64) -> SessionEvent {
        SessionEvent::FinalTranscript {
            speaker,
            text: text.into(),
            seq,
        }
    }

    fn request(id: &str, args: ToolArgs, seq: u64) -> SessionEvent {
        SessionEvent::ToolCallRequested {
            id: id.into(),
            args,
            seq,
        }
    }

    fn applied(id: &str) -> SessionEvent {
        SessionEvent::ToolCallResult {
            id: id.into(),
            status: ToolResultStatus::Applied,
            error: None,
        }
    }

    fn add(item: &str, quantity: u32) -> ToolArgs {
        ToolArgs::AddToCart(AddArgs {
            item: item.into(),
            quantity,
            variant: None,
        })
    }

    #[test]
    fn test_hoodie_scenario() {
        let mut projector = Projector::new();

        let p = projector.apply(&final_turn(Speaker::User, "show me hoodies", 1));
        assert!(p.forced);
        projector.apply(&request(
            "t1",
            ToolArgs::SearchProducts(SearchArgs::default()),
            2,
        ));
        let p = projector.apply(&applied("t1"));
        assert!(p.changed);
        assert!(!p.forced);
        assert_eq!(projector.turns().len(), 1);
        assert!(projector.cart().is_empty());

        projector.apply(&request("t2", add("hoodie-black-M", 1), 3));
        let p = projector.apply(&applied("t2"));
        assert!(p.forced);
        assert_eq!(projector.cart().quantity("hoodie-black-M"), 1);

        let before = projector.cart().clone();
        let p = projector.apply(&applied("t2"));
        assert_eq!(p, Projection::default());
        assert_eq!(projector.cart(), &before);
    }

    #[test]
    fn test_tool_call_owning_turn() {
        let mut projector = Projector::new();
        projector.apply(&final_turn(Speaker::User, "add a mug", 1));
        projector.apply(&request("t1", add("mug", 1), 2));
        assert_eq!(projector.tool_call("t1").unwrap().turn_seq, Some(1));
        assert_eq!(
            projector.tool_call("t1").unwrap().status,
            ToolCallStatus::Pending
        );
    }

    #[test]
    fn test_duplicate_request_ignored() {
        let mut projector = Projector::new();
        projector.apply(&request("t1", add("mug", 1), 1));
        let p = projector.apply(&request("t1", add("mug", 9), 1));
        assert!(!p.changed);
        assert_eq!(projector.tool_calls().len(), 1);
    }

    #[test]
    fn test_seq_reuse_is_conflict() {
        let mut projector = Projector::new();
        projector.apply(&final_turn(Speaker::User, "hi", 1));
        let p = projector.apply(&request("t1", add("mug", 1), 1));
        assert_eq!(p.notice, Some(Notice::SequenceConflict { seq: 1 }));
        assert!(projector.tool_calls().is_empty());

        let p = projector.apply(&final_turn(Speaker::Assistant, "hello", 1));
        assert_eq!(p.notice, Some(Notice::SequenceConflict { seq: 1 }));
    }

    #[test]
    fn test_failed_result_is_notice_and_terminal() {
        let mut projector = Projector::new();
        projector.apply(&request("t9", add("mug", 1), 1));
        let p = projector.apply(&SessionEvent::ToolCallResult {
            id: "t9".into(),
            status: ToolResultStatus::Failed,
            error: Some("out of stock".into()),
        });
        assert_eq!(
            p.notice,
            Some(Notice::ToolCallFailure {
                id: "t9".into(),
                tool: ToolCallKind::AddToCart,
                message: "out of stock".into()
            })
        );

        // A late "applied" cannot resurrect a failed call
        projector.apply(&applied("t9"));
        assert_eq!(
            projector.tool_call("t9").unwrap().status,
            ToolCallStatus::Failed
        );
        assert!(projector.cart().is_empty());
    }

    #[test]
    fn test_unknown_result_is_notice() {
        let mut projector = Projector::new();
        let p = projector.apply(&applied("ghost"));
        assert_eq!(p.notice, Some(Notice::UnknownToolCall { id: "ghost".into() }));
        assert!(!p.changed);
    }

    #[test]
    fn test_late_result_triggers_refold() {
        let mut projector = Projector::new();
        projector.apply(&request("t1", add("mug", 2), 1));
        projector.apply(&request(
            "t2",
            ToolArgs::UpdateCartItem(UpdateArgs {
                item: "mug".into(),
                quantity: 5,
                variant: None,
            }),
            2,
        ));

        // Results arrive in reverse order; seq order must win
        projector.apply(&applied("t2"));
        assert_eq!(projector.cart().quantity("mug"), 5);
        projector.apply(&applied("t1"));
        assert_eq!(projector.cart().quantity("mug"), 5);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut projector = Projector::new();
        projector.apply(&request("t1", add("mug", 2), 1));
        projector.apply(&applied("t1"));
        projector.apply(&request("t2", add("tee", 1), 2));
        projector.apply(&applied("t2"));

        let before = projector.cart().clone();
        assert!(!projector.replay());
        assert_eq!(projector.cart(), &before);
        assert_eq!(projector.acknowledged_seq(), Some(2));

        projector.apply(&request("t3", add("mug", 1), 3));
        projector.apply(&applied("t3"));
        let after = projector.cart().clone();
        assert!(!projector.replay());
        assert!(!projector.replay());
        assert_eq!(projector.cart(), &after);
        assert_eq!(after.quantity("mug"), 3);
    }

    #[test]
    fn test_order_placed_flag() {
        let mut projector = Projector::new();
        projector.apply(&request("t1", add("mug", 1), 1));
        projector.apply(&applied("t1"));
        projector.apply(&request(
            "t2",
            ToolArgs::PlaceOrder(OrderArgs::default()),
            2,
        ));
        let p = projector.apply(&applied("t2"));
        assert!(p.order_placed);
        assert!(projector.cart().order_confirmed);
    }

    #[test]
    fn test_partial_with_committed_seq_ignored() {
        let mut projector = Projector::new();
        projector.apply(&request("t1", add("mug", 1), 3));
        let p = projector.apply(&SessionEvent::PartialTranscript {
            speaker: Speaker::Assistant,
            text: "Added".into(),
            seq: 3,
        });
        assert!(!p.changed);
        assert!(projector.turns().is_empty());
    }
}
