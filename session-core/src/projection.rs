//! State Projection: read-only views over `SessionState` for the `get_*`
//! query family, plus the long-poll cursor comparison backing
//! `get_state_update`.

use serde::{Deserialize, Serialize};

use crate::model::{ConversationItem, LogEntry, Totals};
use crate::state::{Phase, PendingApproval, PendingEscalation, SessionState};

/// Snapshot of where a turn currently stands, derived from `state.phase`
/// plus whatever is staged for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStatus {
    pub turn_id: Option<String>,
    pub phase: Phase,
    pub total_tokens: u64,
    pub total_cached_tokens: u64,
    pub turn_count: u64,
    pub tools_in_flight: Vec<String>,
    pub pending_approvals: Vec<PendingApproval>,
    pub pending_escalations: Vec<PendingEscalation>,
    /// Opaque; not modeled by this core (see DESIGN.md's Open Questions).
    /// Always `None` here.
    pub pending_user_input_request: Option<String>,
    /// Opaque; no invariants, always `None` here (see DESIGN.md's Open
    /// Questions).
    pub suggestion: Option<String>,
    pub worker_version: String,
}

/// A `(seq, phase)` pair identifying a point in the session's evolution.
/// `get_state_update`'s long-poll compares the caller's cursor against the
/// current `(seq, phase)` and resolves immediately if they differ, else
/// waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub seq: u64,
    pub phase: Phase,
}

pub struct StateProjection<'a> {
    state: &'a SessionState,
}

impl<'a> StateProjection<'a> {
    pub fn new(state: &'a SessionState) -> Self {
        Self { state }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor { seq: self.state.next_seq, phase: self.state.phase }
    }

    /// Items with `seq >= since_seq`, for `get_conversation_items`.
    pub fn conversation_items_since(&self, since_seq: u64) -> &[LogEntry] {
        let start = self.state.log.partition_point(|entry| entry.seq < since_seq);
        &self.state.log[start..]
    }

    pub fn turn_status(&self) -> TurnStatus {
        let mut tools_in_flight: Vec<String> = self.state.tools_in_flight.iter().cloned().collect();
        tools_in_flight.sort();
        TurnStatus {
            turn_id: self.state.current_turn_id.clone(),
            phase: self.state.phase,
            total_tokens: self.state.totals.total_tokens(),
            total_cached_tokens: self.state.totals.cached_tokens,
            turn_count: self.state.totals.turn_count,
            tools_in_flight,
            pending_approvals: self.state.pending_approvals.clone(),
            pending_escalations: self.state.pending_escalations.clone(),
            pending_user_input_request: None,
            suggestion: None,
            worker_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn totals(&self) -> &Totals {
        &self.state.totals
    }

    pub fn is_blocked(&self) -> bool {
        self.state.phase.is_blocked()
    }
}

/// Whether a caller's previously-seen cursor is now stale, i.e. whether
/// `get_state_update` should resolve immediately rather than keep the
/// long-poll open.
pub fn cursor_is_stale(previous: Cursor, current: Cursor) -> bool {
    previous != current
}

/// The long-poll response `get_state_update` resolves with (spec.md §4.6):
/// new items in order, the current `TurnStatus`, and whether this batch of
/// new items included a compaction or a turn completing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub cursor: Cursor,
    pub new_items: Vec<LogEntry>,
    pub turn_status: TurnStatus,
    pub compacted: bool,
    pub completed: bool,
}

impl<'a> StateProjection<'a> {
    /// Build the long-poll payload for a caller last seen at `since`.
    pub fn state_update_since(&self, since: Cursor) -> StateUpdate {
        let new_items = self.conversation_items_since(since.seq).to_vec();
        let compacted = new_items
            .iter()
            .any(|entry| matches!(entry.item, ConversationItem::Compaction { .. }));
        let completed = new_items
            .iter()
            .any(|entry| matches!(entry.item, ConversationItem::TurnComplete { .. }));
        StateUpdate {
            cursor: self.cursor(),
            new_items,
            turn_status: self.turn_status(),
            compacted,
            completed,
        }
    }
}
