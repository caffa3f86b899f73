//! Conversation model: live utterance, history and their reconciliation

mod history;
mod reconciler;

pub use history::{
    history_from_transcript, AgentText, History, HistoryEntry, Utterance, PENDING_MARKER,
};
pub use reconciler::{finalize_into, FinalizeOutcome, ReconcilerStats, TranscriptReconciler};
