//! Line-oriented rendering of session snapshots
//!
//! Snapshots are complete states; the reporter remembers what it already
//! printed and only emits what is new.

use cartcall_session::{Phase, SessionError, Snapshot, Speaker, ToolCallStatus};
use std::collections::{HashMap, HashSet};

/// Truncate a string to `max` characters, appending "..." if truncated.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

#[derive(Debug, Default)]
pub struct Reporter {
    phase: Option<Phase>,
    finals: HashSet<u64>,
    calls: HashMap<String, ToolCallStatus>,
    cart: Option<String>,
    order_seen: bool,
    notices: Vec<String>,
    last_error: Option<SessionError>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines describing what changed since the previous snapshot
    pub fn render(&mut self, snapshot: &Snapshot) -> Vec<String> {
        let mut lines = Vec::new();

        let phase_changed = self.phase != Some(snapshot.phase);
        if phase_changed {
            self.phase = Some(snapshot.phase);
            lines.push(format!("[{}]", snapshot.phase));
        }

        if snapshot.last_error != self.last_error {
            if let Some(error) = &snapshot.last_error {
                lines.push(format!("[error: {}]", error));
            }
            self.last_error = snapshot.last_error.clone();
        }

        for turn in snapshot.turns.iter().filter(|t| t.is_final) {
            if self.finals.insert(turn.seq) {
                let who = match turn.speaker {
                    Speaker::User => "you",
                    Speaker::Assistant => "agent",
                };
                lines.push(format!("{}> {}", who, turn.text));
            }
        }

        for call in &snapshot.tool_calls {
            let previous = self.calls.insert(call.id.clone(), call.status);
            if previous == Some(call.status) {
                continue;
            }
            let args = serde_json::to_string(&call.args).unwrap_or_default();
            match call.status {
                ToolCallStatus::Pending => {
                    lines.push(format!("[{} {}...]", call.kind, truncate_chars(&args, 120)))
                }
                ToolCallStatus::Applied => lines.push(format!("[{} applied]", call.kind)),
                ToolCallStatus::Failed => lines.push(format!(
                    "[{} failed: {}]",
                    call.kind,
                    call.error.as_deref().unwrap_or("unknown error")
                )),
            }
        }

        let summary = snapshot.cart.summary();
        if self.cart.as_deref() != Some(summary.as_str()) {
            // An empty cart at the start of a call is not news
            if self.cart.is_some() || !snapshot.cart.is_empty() {
                lines.push(format!("[cart: {}]", summary));
            }
            self.cart = Some(summary);
        }

        if let Some(order) = snapshot.cart.order.as_ref().filter(|_| !self.order_seen) {
            self.order_seen = true;
            match &order.order_id {
                Some(id) => lines.push(format!("[order {} placed: {}]", id, order.summary)),
                None => lines.push(format!("[order placed: {}]", order.summary)),
            }
        }

        let notices: Vec<String> = snapshot.notices.iter().map(|n| n.to_string()).collect();
        for notice in &notices {
            if !self.notices.contains(notice) {
                lines.push(format!("[notice: {}]", notice));
            }
        }
        self.notices = notices;

        if phase_changed && snapshot.phase.is_terminal() {
            let stats = snapshot.stats;
            lines.push(format!(
                "[{} events | {} turns | {} actions applied, {} failed | {} reconnects]",
                stats.events_processed,
                stats.transcripts_finalized,
                stats.tool_calls_applied,
                stats.tool_calls_failed,
                stats.reconnects
            ));
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartcall_session::{
        AddArgs, CartLine, ConversationTurn, Notice, ToolArgs, ToolCall, ToolCallKind,
    };

    fn turn(speaker: Speaker, text: &str, seq: u64, is_final: bool) -> ConversationTurn {
        ConversationTurn {
            speaker,
            text: text.into(),
            seq,
            is_final,
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hoodie", 10), "hoodie");
        assert_eq!(truncate_chars("hoodie-black-M", 6), "hoodie...");
    }

    #[test]
    fn test_prints_only_new_finals() {
        let mut reporter = Reporter::new();
        let mut snapshot = Snapshot {
            phase: Phase::Active,
            turns: vec![
                turn(Speaker::User, "show me hoodies", 1, true),
                turn(Speaker::Assistant, "we have", 2, false),
            ],
            ..Default::default()
        };

        let lines = reporter.render(&snapshot);
        assert_eq!(lines, vec!["[active]", "you> show me hoodies"]);

        snapshot.turns[1] = turn(Speaker::Assistant, "we have black and grey", 2, true);
        let lines = reporter.render(&snapshot);
        assert_eq!(lines, vec!["agent> we have black and grey"]);

        assert!(reporter.render(&snapshot).is_empty());
    }

    #[test]
    fn test_tool_call_progress_and_cart() {
        let mut reporter = Reporter::new();
        let mut snapshot = Snapshot {
            phase: Phase::Active,
            tool_calls: vec![ToolCall {
                id: "t2".into(),
                kind: ToolCallKind::AddToCart,
                args: ToolArgs::AddToCart(AddArgs {
                    item: "hoodie-black-M".into(),
                    quantity: 1,
                    variant: None,
                }),
                status: ToolCallStatus::Pending,
                seq: 3,
                turn_seq: Some(1),
                error: None,
            }],
            ..Default::default()
        };
        let lines = reporter.render(&snapshot);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("[add_to_cart {"));

        snapshot.tool_calls[0].status = ToolCallStatus::Applied;
        snapshot.cart.lines.insert(
            "hoodie-black-M".into(),
            CartLine {
                quantity: 1,
                variant: None,
            },
        );
        let lines = reporter.render(&snapshot);
        assert_eq!(
            lines,
            vec!["[add_to_cart applied]", "[cart: 1x hoodie-black-M]"]
        );
    }

    #[test]
    fn test_notices_printed_once() {
        let mut reporter = Reporter::new();
        let mut snapshot = Snapshot {
            phase: Phase::Active,
            notices: vec![Notice::SequenceConflict { seq: 4 }],
            ..Default::default()
        };
        let lines = reporter.render(&snapshot);
        assert_eq!(lines[1], "[notice: sequence number 4 reused]");

        snapshot
            .notices
            .push(Notice::UnknownToolCall { id: "t9".into() });
        let lines = reporter.render(&snapshot);
        assert_eq!(lines, vec!["[notice: result for unknown tool call t9]"]);
    }
}
