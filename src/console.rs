//! Terminal front end
//!
//! Maps typed lines onto session events and prints what changed between
//! successive UI snapshots.

use std::io::Write;
use std::sync::Mutex;

use crate::conversation::{AgentText, HistoryEntry, PENDING_MARKER};
use crate::state_machine::Event;
use crate::{CallStatus, UiSink, UiState};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Call,
    ToggleMic,
    EndCall,
    Quit,
    Help,
    Say(String),
    Nothing,
}

pub const HELP: &str = "Type to send a message. /mic toggles the microphone, /end hangs up, \
/call starts a new call, /quit exits.";

/// Session and mode the console dials
#[derive(Debug, Clone, PartialEq)]
pub struct CallTarget {
    pub session_id: String,
    pub voice: bool,
}

impl CallTarget {
    pub fn start_event(&self) -> Event {
        Event::StartCall {
            session_id: self.session_id.clone(),
            voice: self.voice,
        }
    }
}

pub fn parse_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    match line {
        "" => ConsoleCommand::Nothing,
        "/call" | "/redial" => ConsoleCommand::Call,
        "/mic" => ConsoleCommand::ToggleMic,
        "/end" | "/hangup" => ConsoleCommand::EndCall,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        "/help" | "/?" => ConsoleCommand::Help,
        text => ConsoleCommand::Say(text.to_string()),
    }
}

impl ConsoleCommand {
    /// Event for the session loop, if the command has one.
    /// `/call` during an active call replaces it with a fresh one.
    pub fn to_event(&self, target: &CallTarget) -> Option<Event> {
        match self {
            ConsoleCommand::Call => Some(target.start_event()),
            ConsoleCommand::ToggleMic => Some(Event::ToggleCapture),
            ConsoleCommand::EndCall => Some(Event::EndCall),
            ConsoleCommand::Quit => Some(Event::Exit),
            ConsoleCommand::Say(text) => Some(Event::SendText { text: text.clone() }),
            ConsoleCommand::Help | ConsoleCommand::Nothing => None,
        }
    }
}

fn status_line(status: &CallStatus) -> String {
    match status {
        CallStatus::Disconnected => "Not connected".to_string(),
        CallStatus::Connecting => "Connecting...".to_string(),
        CallStatus::Ready => "Connected (microphone off)".to_string(),
        CallStatus::Listening => "Connected, listening".to_string(),
        CallStatus::MicrophoneUnavailable { reason } => {
            format!("Connected, microphone unavailable: {} (text still works)", reason)
        }
        CallStatus::Closed { message } => message.clone(),
    }
}

fn entry_lines(entry: &HistoryEntry) -> Vec<String> {
    let mut lines = Vec::new();
    if !entry.user_text.is_empty() {
        lines.push(format!("  you: {}", entry.user_text));
    }
    match &entry.agent_text {
        AgentText::Text(text) if text.is_empty() => {}
        AgentText::Text(text) => lines.push(format!("scout: {}", text)),
        AgentText::Pending => lines.push(format!("scout: {}", PENDING_MARKER)),
    }
    lines
}

/// Lines to print going from `prev` to `next`
pub fn render_diff(prev: Option<&UiState>, next: &UiState) -> Vec<String> {
    let mut out = Vec::new();

    if prev.map(|p| &p.status) != Some(&next.status) {
        out.push(format!("[{}]", status_line(&next.status)));
    }

    let old_entries = prev.map(|p| p.history.entries()).unwrap_or_default();
    for (i, entry) in next.history.entries().iter().enumerate() {
        match old_entries.get(i) {
            None => out.extend(entry_lines(entry)),
            // A pending reply got filled
            Some(old) if old != entry => {
                if let AgentText::Text(text) = &entry.agent_text {
                    out.push(format!("scout: {}", text));
                }
            }
            Some(_) => {}
        }
    }

    if prev.and_then(|p| p.live.as_ref()) != next.live.as_ref() {
        if let Some(live) = &next.live {
            out.push(format!("  ({}) {}", live.speaker, live.text));
        }
    }

    if prev.map(|p| &p.candidates) != Some(&next.candidates) && !next.candidates.is_empty() {
        out.push("Candidates:".to_string());
        for business in &next.candidates {
            let rating = business
                .rating
                .map(|r| format!(" ({:.1}★)", r))
                .unwrap_or_default();
            out.push(format!(
                "  - {}{} {}",
                business.name, rating, business.phone_number
            ));
        }
    }

    if prev.map(|p| &p.calls) != Some(&next.calls) && !next.calls.is_empty() {
        out.push("Calls:".to_string());
        for call in &next.calls {
            let outcome = call.outcome_summary.as_deref().unwrap_or("in progress");
            out.push(format!("  - {} {}: {}", call.biz_name, call.phone_number, outcome));
        }
    }

    out
}

/// Prints UI changes to stdout
#[derive(Default)]
pub struct ConsoleUi {
    last: Mutex<Option<UiState>>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UiSink for ConsoleUi {
    fn render(&self, state: &UiState) {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let lines = render_diff(last.as_ref(), state);
        if !lines.is_empty() {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for line in lines {
                let _ = writeln!(out, "{}", line);
            }
            let _ = out.flush();
        }
        *last = Some(state.clone());
    }
}
