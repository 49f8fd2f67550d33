//! Turn log: finalized turns plus at most one in-progress partial per speaker.

use serde::{Deserialize, Serialize};

use crate::events::Speaker;

/// One utterance in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    pub seq: u64,
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// What applying a transcript event did to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Appended at the end of the log
    Appended,
    /// Finalized with a seq lower than an existing final; inserted in seq order
    Inserted,
    /// A speaker's partial was created or replaced in place
    Updated,
    /// Already present; nothing changed
    Duplicate,
    /// At or below the speaker's last finalized seq; ignored
    Stale,
}

impl TurnOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            TurnOutcome::Appended | TurnOutcome::Inserted | TurnOutcome::Updated
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnLog {
    finals: Vec<ConversationTurn>,
    user_partial: Option<ConversationTurn>,
    assistant_partial: Option<ConversationTurn>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn partial_slot(&mut self, speaker: Speaker) -> &mut Option<ConversationTurn> {
        match speaker {
            Speaker::User => &mut self.user_partial,
            Speaker::Assistant => &mut self.assistant_partial,
        }
    }

    /// Highest finalized seq for `speaker`
    pub fn last_final_seq(&self, speaker: Speaker) -> Option<u64> {
        self.finals
            .iter()
            .filter(|t| t.speaker == speaker)
            .map(|t| t.seq)
            .max()
    }

    /// Whether a final turn with this speaker and seq is already in the log
    pub fn has_final(&self, speaker: Speaker, seq: u64) -> bool {
        self.finals
            .binary_search_by_key(&seq, |t| t.seq)
            .map(|i| self.finals[i].speaker == speaker)
            .unwrap_or(false)
    }

    /// Replace the speaker's partial turn in place
    pub fn apply_partial(&mut self, speaker: Speaker, text: String, seq: u64) -> TurnOutcome {
        if self.last_final_seq(speaker).is_some_and(|last| seq <= last) {
            return TurnOutcome::Stale;
        }

        let slot = self.partial_slot(speaker);
        if let Some(existing) = slot.as_ref() {
            if existing.seq > seq {
                return TurnOutcome::Stale;
            }
            if existing.seq == seq && existing.text == text {
                return TurnOutcome::Duplicate;
            }
        }

        *slot = Some(ConversationTurn {
            speaker,
            text,
            seq,
            is_final: false,
        });
        TurnOutcome::Updated
    }

    /// Commit a final turn, dropping the speaker's partial if it is not newer
    pub fn apply_final(&mut self, speaker: Speaker, text: String, seq: u64) -> TurnOutcome {
        if self.has_final(speaker, seq) {
            return TurnOutcome::Duplicate;
        }

        let slot = self.partial_slot(speaker);
        if slot.as_ref().is_some_and(|p| p.seq <= seq) {
            *slot = None;
        }

        let turn = ConversationTurn {
            speaker,
            text,
            seq,
            is_final: true,
        };
        let at = self.finals.partition_point(|t| t.seq < seq);
        if at == self.finals.len() {
            self.finals.push(turn);
            TurnOutcome::Appended
        } else {
            self.finals.insert(at, turn);
            TurnOutcome::Inserted
        }
    }

    /// Finalized turns in seq order
    pub fn finals(&self) -> &[ConversationTurn] {
        &self.finals
    }

    /// All turns for display: finals in seq order, then live partials by seq
    pub fn turns(&self) -> Vec<ConversationTurn> {
        let mut partials: Vec<ConversationTurn> = self
            .user_partial
            .iter()
            .chain(self.assistant_partial.iter())
            .cloned()
            .collect();
        partials.sort_by_key(|t| t.seq);

        let mut turns = self.finals.clone();
        turns.extend(partials);
        turns
    }

    /// The turn a tool call with `seq` belongs to: the latest final user turn
    /// before it, or failing that the latest final turn of either speaker.
    pub fn owning_turn(&self, seq: u64) -> Option<u64> {
        let before = &self.finals[..self.finals.partition_point(|t| t.seq < seq)];
        before
            .iter()
            .rev()
            .find(|t| t.speaker == Speaker::User)
            .or_else(|| before.last())
            .map(|t| t.seq)
    }

    pub fn len(&self) -> usize {
        self.finals.len()
            + self.user_partial.is_some() as usize
            + self.assistant_partial.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
