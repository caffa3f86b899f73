//! Per-call metrics for scout-voice
//!
//! Tracks timing, transcript reconciliation counts, playback counts and an
//! error history for each call. Used for diagnostics only; nothing here
//! affects the protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use uuid::Uuid;

use crate::conversation::FinalizeOutcome;

/// Maximum number of completed calls to retain in history
const MAX_CALL_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetrics {
    pub call_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Time from start to `auth_success`, if it got that far
    pub connect_ms: Option<u64>,
    pub duration_ms: u64,
    pub fragments: u64,
    pub turns_recorded: u64,
    pub duplicates_suppressed: u64,
    pub chunks_played: u64,
    pub decode_errors: u64,
    pub playback_errors: u64,
    /// Why the call ended (hang-up, server end, transport error, ...)
    pub end_reason: String,
    pub success: bool,
}

/// Summary statistics across all recorded calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Average duration (ms) across successful calls
    pub avg_call_duration_ms: u64,
    /// Average connect time (ms) across calls that connected
    pub avg_connect_ms: u64,
    pub duplicates_suppressed: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "transport", "device", "decode")
    pub error_type: String,
    pub message: String,
    pub call_id: Option<String>,
}

struct CallInProgress {
    call_id: Uuid,
    session_id: String,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    connect_ms: Option<u64>,
    fragments: u64,
    turns_recorded: u64,
    duplicates_suppressed: u64,
    chunks_played: u64,
    decode_errors: u64,
    playback_errors: u64,
}

impl CallInProgress {
    fn new(call_id: Uuid, session_id: String) -> Self {
        Self {
            call_id,
            session_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            connect_ms: None,
            fragments: 0,
            turns_recorded: 0,
            duplicates_suppressed: 0,
            chunks_played: 0,
            decode_errors: 0,
            playback_errors: 0,
        }
    }

    fn to_metrics(&self, success: bool, end_reason: String) -> CallMetrics {
        CallMetrics {
            call_id: self.call_id.to_string(),
            session_id: self.session_id.clone(),
            started_at: self.started_at_utc,
            connect_ms: self.connect_ms,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            fragments: self.fragments,
            turns_recorded: self.turns_recorded,
            duplicates_suppressed: self.duplicates_suppressed,
            chunks_played: self.chunks_played,
            decode_errors: self.decode_errors,
            playback_errors: self.playback_errors,
            end_reason,
            success,
        }
    }
}

/// Collects and stores metrics for calls
pub struct MetricsCollector {
    /// History of completed calls (newest first)
    history: VecDeque<CallMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current_call: Option<CallInProgress>,
    total_calls: u64,
    successful_calls: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_CALL_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_call: None,
            total_calls: 0,
            successful_calls: 0,
        }
    }

    /// Start tracking a new call
    ///
    /// A call still in progress is closed out as failed.
    pub fn start_call(&mut self, call_id: Uuid, session_id: &str) {
        if let Some(old_call) = self.current_call.take() {
            log::warn!(
                "Metrics: discarding in-progress call {} to start call {}",
                old_call.call_id,
                call_id
            );
            let metrics = old_call.to_metrics(false, "Discarded: new call started".to_string());
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting call {}", call_id);
        self.current_call = Some(CallInProgress::new(call_id, session_id.to_string()));
        self.total_calls += 1;
    }

    /// Mark the current call as authenticated
    pub fn connected(&mut self) {
        if let Some(ref mut call) = self.current_call {
            let ms = call.started_at.elapsed().as_millis() as u64;
            call.connect_ms = Some(ms);
            log::info!("Metrics: call {} connected in {}ms", call.call_id, ms);
        }
    }

    pub fn fragment_received(&mut self) {
        if let Some(ref mut call) = self.current_call {
            call.fragments += 1;
        }
    }

    pub fn finalized(&mut self, outcome: FinalizeOutcome) {
        if let Some(ref mut call) = self.current_call {
            if outcome.is_duplicate() {
                call.duplicates_suppressed += 1;
            } else if outcome.changed_history() {
                call.turns_recorded += 1;
            }
        }
    }

    pub fn chunk_played(&mut self) {
        if let Some(ref mut call) = self.current_call {
            call.chunks_played += 1;
        }
    }

    pub fn decode_error(&mut self, message: String) {
        let call_id = self.current_call_id();
        if let Some(ref mut call) = self.current_call {
            call.decode_errors += 1;
        }
        self.record_error("decode".to_string(), message, call_id);
    }

    pub fn playback_error(&mut self, message: String) {
        let call_id = self.current_call_id();
        if let Some(ref mut call) = self.current_call {
            call.playback_errors += 1;
        }
        self.record_error("playback".to_string(), message, call_id);
    }

    /// Close out the current call
    pub fn end_call(&mut self, success: bool, reason: &str) {
        let Some(call) = self.current_call.take() else {
            return;
        };

        let metrics = call.to_metrics(success, reason.to_string());
        log::info!(
            "Metrics: call {} ended after {}ms ({}): {} turns, {} duplicates, {} chunks played",
            metrics.call_id,
            metrics.duration_ms,
            reason,
            metrics.turns_recorded,
            metrics.duplicates_suppressed,
            metrics.chunks_played
        );

        if success {
            self.successful_calls += 1;
        } else {
            self.record_error(
                "call".to_string(),
                reason.to_string(),
                Some(metrics.call_id.clone()),
            );
        }
        self.add_to_history(metrics);
    }

    /// Record an error (not necessarily tied to a call)
    pub fn record_error(&mut self, error_type: String, message: String, call_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type,
            message,
            call_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    fn current_call_id(&self) -> Option<String> {
        self.current_call.as_ref().map(|c| c.call_id.to_string())
    }

    fn add_to_history(&mut self, metrics: CallMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_CALL_HISTORY {
            self.history.pop_back();
        }
    }

    /// Completed calls, newest first
    pub fn history(&self) -> Vec<CallMetrics> {
        self.history.iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let successful: Vec<&CallMetrics> = self.history.iter().filter(|m| m.success).collect();
        let connected: Vec<u64> = self.history.iter().filter_map(|m| m.connect_ms).collect();

        let avg = |values: &[u64]| -> u64 {
            if values.is_empty() {
                0
            } else {
                values.iter().sum::<u64>() / values.len() as u64
            }
        };

        let durations: Vec<u64> = successful.iter().map(|m| m.duration_ms).collect();

        MetricsSummary {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self
                .total_calls
                .saturating_sub(self.successful_calls)
                .saturating_sub(self.current_call.is_some() as u64),
            avg_call_duration_ms: avg(&durations),
            avg_connect_ms: avg(&connected),
            duplicates_suppressed: self.history.iter().map(|m| m.duplicates_suppressed).sum(),
            last_error: self.errors.front().cloned(),
        }
    }
}
