//! Transcript reconciliation
//!
//! Merges speaker-tagged transcript fragments into one live utterance and a
//! deduplicated history.
//!
//! # States
//!
//! - **Empty**: no live utterance
//! - **Streaming(speaker, text)**: fragments accumulate for one speaker
//!
//! A fragment from the same speaker is appended with a single space. A
//! fragment from another speaker finalizes the live utterance first. Turn
//! control messages finalize without starting a new one.
//!
//! # Finalization
//!
//! - user: dropped if any entry already has exactly this `user_text`,
//!   otherwise appended with a pending reply
//! - agent: fills the last entry's pending reply if there is one, otherwise
//!   appended standalone unless exactly this `agent_text` already exists
//! - whitespace-only text is dropped
//!
//! Dedup is exact string equality; server messages carry no ids.

use super::history::{History, HistoryEntry, Utterance};
use crate::streaming::Speaker;

/// What finalizing a live utterance did to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Nothing was live
    NoLive,
    /// Whitespace-only utterance dropped
    Blank,
    UserAppended,
    DuplicateUser,
    /// Agent text filled the pending reply of the last entry
    ReplyPaired,
    AgentAppended,
    DuplicateAgent,
}

impl FinalizeOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            FinalizeOutcome::DuplicateUser | FinalizeOutcome::DuplicateAgent
        )
    }

    pub fn changed_history(&self) -> bool {
        matches!(
            self,
            FinalizeOutcome::UserAppended
                | FinalizeOutcome::ReplyPaired
                | FinalizeOutcome::AgentAppended
        )
    }
}

/// Commit a finalized utterance into `history`
pub fn finalize_into(history: &mut History, utterance: Utterance) -> FinalizeOutcome {
    if utterance.text.trim().is_empty() {
        return FinalizeOutcome::Blank;
    }

    match utterance.speaker {
        Speaker::User => {
            if history.contains_user_text(&utterance.text) {
                log::debug!("Duplicate user turn suppressed: {:?}", utterance.text);
                FinalizeOutcome::DuplicateUser
            } else {
                history.push(HistoryEntry::user(utterance.text));
                FinalizeOutcome::UserAppended
            }
        }
        Speaker::Agent => {
            if history.last().is_some_and(|e| e.agent_text.is_pending()) {
                history.fill_pending(utterance.text);
                FinalizeOutcome::ReplyPaired
            } else if history.contains_agent_text(&utterance.text) {
                log::debug!("Duplicate agent turn suppressed: {:?}", utterance.text);
                FinalizeOutcome::DuplicateAgent
            } else {
                history.push(HistoryEntry::agent(utterance.text));
                FinalizeOutcome::AgentAppended
            }
        }
    }
}

/// Counters for one conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub fragments: u64,
    pub finalized: u64,
    pub duplicates_suppressed: u64,
    pub blanks_dropped: u64,
}

/// Owns the live utterance and the history for one conversation
#[derive(Debug, Clone, Default)]
pub struct TranscriptReconciler {
    live: Option<Utterance>,
    history: History,
    stats: ReconcilerStats,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from turns that already happened in this session
    pub fn with_history(history: History) -> Self {
        Self {
            history,
            ..Self::default()
        }
    }

    /// Apply one `transcription` fragment.
    ///
    /// Returns the outcome of the finalize triggered by a speaker change,
    /// or `None` when the fragment extended (or started) the live utterance
    /// without finalizing anything.
    pub fn apply_fragment(&mut self, speaker: Speaker, text: &str) -> Option<FinalizeOutcome> {
        self.stats.fragments += 1;

        match self.live.as_mut() {
            Some(live) if live.speaker == speaker => {
                live.text.push(' ');
                live.text.push_str(text);
                None
            }
            Some(_) => {
                let outcome = self.finalize();
                self.live = Some(Utterance::new(speaker, text));
                Some(outcome)
            }
            None => {
                self.live = Some(Utterance::new(speaker, text));
                None
            }
        }
    }

    /// Close out the live utterance, if any. No-op when nothing is live.
    pub fn finalize(&mut self) -> FinalizeOutcome {
        let Some(live) = self.live.take() else {
            return FinalizeOutcome::NoLive;
        };

        let outcome = finalize_into(&mut self.history, live);
        match outcome {
            FinalizeOutcome::Blank => self.stats.blanks_dropped += 1,
            o if o.is_duplicate() => self.stats.duplicates_suppressed += 1,
            _ => self.stats.finalized += 1,
        }
        outcome
    }

    /// Record a typed message as a user turn awaiting a reply.
    ///
    /// Appended unconditionally; the server's transcript echo of the same
    /// text is then dropped as a duplicate user turn.
    pub fn submit_text(&mut self, text: &str) {
        self.history.push(HistoryEntry::user(text));
    }

    pub fn live(&self) -> Option<&Utterance> {
        self.live.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    /// Replace everything with a fresh conversation
    pub fn reset(&mut self, history: History) {
        self.live = None;
        self.history = history;
        self.stats = ReconcilerStats::default();
    }
}
