//! History Log: the append-only audit trail and token accounting used to
//! decide when the compactor should run.
//!
//! `TokenCounter` estimates token usage from message content rather than
//! calling out to a tokenizer service; `HeuristicTokenCounter` is a
//! chars/4 heuristic so the core has a usable default without taking a
//! tokenizer dependency.

use crate::model::{ConversationItem, LogEntry, SeqRange};
use crate::state::SessionState;

/// Items with `seq` inside any `Compaction.replaced_range` already recorded
/// in `log`, excluded from LLM context assembly while remaining in the log
/// for audit.
pub fn eligible_entries(log: &[LogEntry]) -> Vec<&LogEntry> {
    let ranges: Vec<SeqRange> = log
        .iter()
        .filter_map(|entry| match &entry.item {
            ConversationItem::Compaction { replaced_range, .. } => Some(*replaced_range),
            _ => None,
        })
        .collect();
    log.iter()
        .filter(|entry| !ranges.iter().any(|range| range.contains(entry.seq)))
        .collect()
}

/// Estimates token usage for a slice of conversation items. A real
/// deployment can swap in a tiktoken-backed counter; the heuristic below is
/// deliberately conservative (rounds up) so auto-compaction triggers a
/// little early rather than a little late.
pub trait TokenCounter: Send + Sync {
    fn count(&self, items: &[LogEntry]) -> u64;
}

/// chars/4 heuristic, a cheap approximation to use ahead of an actual
/// tokenizer call.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, items: &[LogEntry]) -> u64 {
        items
            .iter()
            .map(|entry| item_char_len(&entry.item) as u64)
            .sum::<u64>()
            / 4
    }
}

fn item_char_len(item: &ConversationItem) -> usize {
    match item {
        ConversationItem::TurnStarted { turn_id } => turn_id.len(),
        ConversationItem::TurnComplete { turn_id, .. } => turn_id.len(),
        ConversationItem::UserMessage { text } => text.len(),
        ConversationItem::AssistantMessage { text } => text.len(),
        ConversationItem::FunctionCall { name, arguments_json, .. } => {
            name.len() + arguments_json.len()
        }
        ConversationItem::FunctionCallOutput { content, .. } => content.len(),
        ConversationItem::Compaction { summary, .. } => summary.len(),
    }
}

/// Owns appends to `SessionState.log` and the derived token estimate used to
/// trigger compaction. Every mutation to the log goes through here so `seq`
/// assignment stays centralized: strictly increasing, gapless.
pub struct HistoryLog<'a> {
    state: &'a mut SessionState,
    counter: &'a dyn TokenCounter,
}

impl<'a> HistoryLog<'a> {
    pub fn new(state: &'a mut SessionState, counter: &'a dyn TokenCounter) -> Self {
        Self { state, counter }
    }

    /// Append one item, returning the `seq` assigned to it. History append
    /// is treated as always-fatal on failure — there is no recovery path
    /// that doesn't risk a torn, unreplayable log — so callers propagate any
    /// error immediately via `CoreError::Runtime`.
    pub fn append(&mut self, item: ConversationItem) -> u64 {
        self.state.push(item)
    }

    pub fn snapshot(&self) -> &[LogEntry] {
        &self.state.log
    }

    /// Entries with `seq >= since_seq`, for incremental `get_conversation_items`
    /// reads.
    pub fn entries_since(&self, since_seq: u64) -> &[LogEntry] {
        let start = self
            .state
            .log
            .partition_point(|entry| entry.seq < since_seq);
        &self.state.log[start..]
    }

    /// Estimated prompt-side token cost of the *eligible* log — the subset
    /// not folded into an earlier `Compaction` — the signal compared
    /// against `config.auto_compact_token_limit` to decide whether to
    /// compact.
    pub fn estimated_tokens(&self) -> u64 {
        let eligible: Vec<LogEntry> = eligible_entries(&self.state.log).into_iter().cloned().collect();
        self.counter.count(&eligible)
    }

    /// The eligible entries themselves, for LLM request assembly.
    pub fn eligible(&self) -> Vec<&LogEntry> {
        eligible_entries(&self.state.log)
    }
}
