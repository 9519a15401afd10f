//! Session phase and in-memory session state.
//!
//! `ApiFailureTracker` implements a circuit breaker over consecutive upstream
//! failures: a 3-failure threshold, exponential backoff with a 30s cap,
//! running off a monotonic tick counter supplied by the workflow runtime
//! port rather than `std::time::Instant` (the workflow must stay
//! replay-deterministic, so wall-clock reads are not allowed outside a port
//! call).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::SessionConfiguration;
use crate::model::{ConversationItem, LogEntry, Totals};

/// The session's current high-level phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingLlm,
    AwaitingToolResults,
    AwaitingApproval,
    AwaitingEscalation,
    Compacting,
    Interrupting,
    Completed,
    Error,
    Shutdown,
}

impl Phase {
    /// Phases in which the session is actively making progress without
    /// needing external input, vs. the phases where it is "blocked" awaiting
    /// something (surfaced to callers as `is_blocked`).
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::AwaitingApproval | Self::AwaitingEscalation
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Shutdown)
    }
}

/// A tool call awaiting a user approval decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub call_id: String,
    pub tool_name: String,
    pub arguments_json: String,
    pub reason: String,
}

/// A sandboxed tool call that failed and is awaiting an escalation decision
/// to retry outside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments_json: String,
    pub failure_reason: String,
}

/// Tracks consecutive upstream failures to drive the circuit breaker and
/// backoff delay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiFailureTracker {
    pub consecutive_failures: u32,
    /// Tick (workflow-clock) of the last recorded failure, if any.
    pub last_failure_tick: Option<u64>,
}

impl ApiFailureTracker {
    const CIRCUIT_BREAK_THRESHOLD: u32 = 3;
    const BASE_BACKOFF_MS: u64 = 1000;
    const MAX_BACKOFF_MS: u64 = 30_000;

    pub fn record_failure(&mut self, tick: u64) {
        self.consecutive_failures += 1;
        self.last_failure_tick = Some(tick);
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_tick = None;
    }

    /// Whether the next failure (or this one) should escalate to `Fatal`.
    pub fn should_circuit_break(&self) -> bool {
        self.consecutive_failures >= Self::CIRCUIT_BREAK_THRESHOLD
    }

    /// Exponential backoff, base 1s doubling per consecutive failure, capped
    /// at 30s.
    pub fn backoff_duration_ms(&self) -> u64 {
        let shift = self.consecutive_failures.saturating_sub(1).min(16);
        let backoff = Self::BASE_BACKOFF_MS.saturating_mul(1u64 << shift);
        backoff.min(Self::MAX_BACKOFF_MS)
    }
}

/// The full in-memory state of a session, rebuilt from history on every
/// workflow replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub conversation_id: String,
    pub config: SessionConfiguration,
    pub phase: Phase,
    pub log: Vec<LogEntry>,
    pub next_seq: u64,
    pub totals: Totals,
    pub current_turn_id: Option<String>,
    pub pending_approvals: Vec<PendingApproval>,
    pub pending_escalations: Vec<PendingEscalation>,
    /// Tool names with an invocation currently dispatched and not yet
    /// resolved.
    pub tools_in_flight: HashSet<String>,
    /// `(tool_name, reason)` pairs the user has already blanket-approved for
    /// the remainder of the session.
    pub auto_approved: HashSet<(String, String)>,
    pub api_failures: ApiFailureTracker,
    pub last_error: Option<String>,
    pub last_summary: Option<String>,
    /// Consecutive LLM rounds within the current turn that produced tool
    /// calls with no intervening assistant text. Reset whenever the model
    /// emits assistant text or a new turn starts; checked against
    /// `config.max_consecutive_tool_loops` so a stuck tool-only loop ends
    /// the turn before `max_iterations` would otherwise catch it.
    pub consecutive_tool_loops: u32,
}

impl SessionState {
    pub fn new(conversation_id: String, config: SessionConfiguration) -> Self {
        Self {
            conversation_id,
            config,
            phase: Phase::Idle,
            log: Vec::new(),
            next_seq: 0,
            totals: Totals::default(),
            current_turn_id: None,
            pending_approvals: Vec::new(),
            pending_escalations: Vec::new(),
            tools_in_flight: HashSet::new(),
            auto_approved: HashSet::new(),
            api_failures: ApiFailureTracker::default(),
            last_error: None,
            last_summary: None,
            consecutive_tool_loops: 0,
        }
    }

    /// Append an item at the next sequence number, returning the assigned
    /// `seq`. Callers must go through `HistoryLog::append` in practice, which
    /// owns authoritative sequencing; this is the low-level primitive it
    /// uses.
    pub fn push(&mut self, item: ConversationItem) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.log.push(LogEntry { seq, item });
        seq
    }

    pub fn is_auto_approved(&self, tool_name: &str, reason: &str) -> bool {
        self.auto_approved
            .contains(&(tool_name.to_string(), reason.to_string()))
    }

    pub fn mark_auto_approved(&mut self, tool_name: &str, reason: &str) {
        self.auto_approved
            .insert((tool_name.to_string(), reason.to_string()));
    }
}

/// Validation report produced by [`validate_history_invariants`]: any
/// unpaired function call or output it found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryValidationReport {
    pub missing_outputs: Vec<String>,
    pub orphan_outputs: Vec<String>,
}

impl HistoryValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing_outputs.is_empty() && self.orphan_outputs.is_empty()
    }
}

/// Walk the log and report any `FunctionCall` without a matching
/// `FunctionCallOutput`, and any `FunctionCallOutput` without a preceding
/// call.
pub fn validate_history_invariants(log: &[LogEntry]) -> HistoryValidationReport {
    let mut open_calls: HashMap<&str, ()> = HashMap::new();
    let mut report = HistoryValidationReport::default();

    for entry in log {
        match &entry.item {
            ConversationItem::FunctionCall { call_id, .. } => {
                open_calls.insert(call_id.as_str(), ());
            }
            ConversationItem::FunctionCallOutput { call_id, .. } => {
                if open_calls.remove(call_id.as_str()).is_none() {
                    report.orphan_outputs.push(call_id.clone());
                }
            }
            _ => {}
        }
    }

    report.missing_outputs.extend(open_calls.into_keys().map(str::to_string));
    report
}
