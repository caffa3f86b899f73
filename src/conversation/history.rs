//! Conversation history
//!
//! An ordered, append-only list of turns. Each entry pairs a user line with
//! the agent's reply; the reply starts out pending and is filled at most once.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::streaming::Speaker;

/// Marker shown for a reply that has not arrived yet
pub const PENDING_MARKER: &str = "...";

/// One finalized or streaming unit of speech/text from a single speaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
}

impl Utterance {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Agent side of a history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentText {
    Pending,
    Text(String),
}

impl AgentText {
    pub fn is_pending(&self) -> bool {
        matches!(self, AgentText::Pending)
    }

    /// Display form; pending renders as the marker
    pub fn as_str(&self) -> &str {
        match self {
            AgentText::Pending => PENDING_MARKER,
            AgentText::Text(text) => text,
        }
    }
}

impl Serialize for AgentText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text == PENDING_MARKER {
            Ok(AgentText::Pending)
        } else {
            Ok(AgentText::Text(text))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub user_text: String,
    pub agent_text: AgentText,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            user_text: text.into(),
            agent_text: AgentText::Pending,
        }
    }

    /// Agent line with no user turn attached
    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            user_text: String::new(),
            agent_text: AgentText::Text(text.into()),
        }
    }
}

/// Append-only sequence of history entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously stored turns (e.g. the conversation endpoint)
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn contains_user_text(&self, text: &str) -> bool {
        self.entries.iter().any(|e| e.user_text == text)
    }

    pub fn contains_agent_text(&self, text: &str) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(&e.agent_text, AgentText::Text(t) if t == text))
    }

    /// Fill the last entry's pending reply. Returns false if it was not pending.
    pub fn fill_pending(&mut self, text: String) -> bool {
        match self.entries.last_mut() {
            Some(entry) if entry.agent_text.is_pending() => {
                entry.agent_text = AgentText::Text(text);
                true
            }
            _ => false,
        }
    }
}

/// Rebuild turns from a stored transcript.
///
/// Each user line opens an entry and the agent lines after it set its reply,
/// the last one winning. Agent lines before any user line share one leading
/// entry. Stored turns are closed: a user line with no reply gets an empty
/// reply, never a pending one, so a later call appends instead of filling it.
pub fn history_from_transcript(lines: &[Utterance]) -> History {
    let mut history = History::new();
    let mut open: Option<HistoryEntry> = None;

    for line in lines {
        match line.speaker {
            Speaker::User => {
                if let Some(entry) = open.take() {
                    history.push(entry);
                }
                open = Some(HistoryEntry {
                    user_text: line.text.clone(),
                    agent_text: AgentText::Text(String::new()),
                });
            }
            Speaker::Agent => match open.as_mut() {
                Some(entry) => entry.agent_text = AgentText::Text(line.text.clone()),
                None => open = Some(HistoryEntry::agent(line.text.clone())),
            },
        }
    }

    if let Some(entry) = open {
        history.push(entry);
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_text_serializes_pending_as_marker() {
        let entry = HistoryEntry::user("hi");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"userText":"hi","agentText":"..."}"#);

        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert!(back.agent_text.is_pending());
    }

    #[test]
    fn test_fill_pending_only_once() {
        let mut history = History::new();
        history.push(HistoryEntry::user("I need a plumber"));

        assert!(history.fill_pending("Sure".to_string()));
        assert!(!history.fill_pending("Again".to_string()));
        assert_eq!(history.entries()[0].agent_text.as_str(), "Sure");
    }

    #[test]
    fn test_fill_pending_on_empty_history() {
        let mut history = History::new();
        assert!(!history.fill_pending("hello".to_string()));
        assert!(history.is_empty());
    }

    #[test]
    fn test_contains_checks() {
        let mut history = History::new();
        history.push(HistoryEntry::user("a"));
        history.push(HistoryEntry::agent("b"));

        assert!(history.contains_user_text("a"));
        assert!(!history.contains_user_text("b"));
        assert!(history.contains_agent_text("b"));
        // Pending marker is not agent text
        assert!(!history.contains_agent_text(PENDING_MARKER));
    }

    #[test]
    fn test_history_from_transcript_pairs_turns() {
        let lines = vec![
            Utterance::new(Speaker::Agent, "Hi, how can I help?"),
            Utterance::new(Speaker::User, "I need a plumber"),
            Utterance::new(Speaker::Agent, "Sure, what area?"),
            Utterance::new(Speaker::User, "Downtown"),
        ];
        let history = history_from_transcript(&lines);

        assert_eq!(
            history.entries(),
            &[
                HistoryEntry::agent("Hi, how can I help?"),
                HistoryEntry {
                    user_text: "I need a plumber".to_string(),
                    agent_text: AgentText::Text("Sure, what area?".to_string()),
                },
                HistoryEntry {
                    user_text: "Downtown".to_string(),
                    agent_text: AgentText::Text(String::new()),
                },
            ]
        );
        assert!(!history.entries().iter().any(|e| e.agent_text.is_pending()));
    }

    #[test]
    fn test_history_from_transcript_last_agent_line_wins() {
        let lines = vec![
            Utterance::new(Speaker::User, "Find me a dentist"),
            Utterance::new(Speaker::Agent, "Looking now."),
            Utterance::new(Speaker::Agent, "I found three nearby."),
        ];
        let history = history_from_transcript(&lines);

        assert_eq!(history.len(), 1);
        assert_eq!(
            history.entries()[0].agent_text,
            AgentText::Text("I found three nearby.".to_string())
        );
    }

    #[test]
    fn test_history_from_transcript_empty() {
        assert!(history_from_transcript(&[]).is_empty());
    }
}
