//! C8 — Compactor: replaces a prefix of the history with a summary item when
//! the estimated token count crosses `auto_compact_token_limit` (spec.md
//! §4.8).
//!
//! Grounded on the teacher's `vtcode_core::compaction` module:
//! `CompactionConfig{trigger_threshold, target_threshold, keep_last_messages}`
//! becomes the `keep_last_messages`-style split below, and
//! `build_summary_prompt`/`summarize_text` become `summarize_prefix`, with
//! the same "summarize everything except a protected tail" strategy. The
//! teacher's summarizer calls out to the same `ChatPort`-equivalent LLM
//! client it already holds; here that's threaded through as a
//! `SummarizerPort` fn rather than a second copy of `ChatPort`'s trait,
//! since compaction only ever needs one-shot text-in/text-out.

use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::history::{eligible_entries, HistoryLog, TokenCounter};
use crate::model::{ConversationItem, LogEntry, SeqRange};
use crate::ports::WorkflowRuntime;
use crate::state::{validate_history_invariants, SessionState};

/// Number of most-recent log entries always preserved verbatim, never
/// folded into a summary (matches the teacher's `keep_last_messages: 10`).
pub const DEFAULT_KEEP_LAST: usize = 10;

/// Target fraction of the limit compaction aims to bring usage back under,
/// matching the teacher's `target_threshold: 0.50`.
pub const TARGET_FRACTION: f64 = 0.50;

pub struct Compactor {
    runtime: Arc<dyn WorkflowRuntime>,
    keep_last: usize,
}

impl Compactor {
    pub fn new(runtime: Arc<dyn WorkflowRuntime>) -> Self {
        Self { runtime, keep_last: DEFAULT_KEEP_LAST }
    }

    /// Append a `Compaction` item summarizing the oldest eligible prefix of
    /// `state.log`, preserving the last `keep_last` eligible entries and any
    /// entries that would otherwise orphan a call/output pair (P3 must hold
    /// after compaction too — see `find_safe_split_point`).
    ///
    /// Per spec.md §3, replaced entries are never removed from the log —
    /// only excluded from LLM context assembly by `history::eligible_entries`
    /// — so the audit trail stays intact across any number of compactions.
    pub async fn compact(&self, state: &mut SessionState, counter: &dyn TokenCounter) -> CoreResult<()> {
        let eligible: Vec<LogEntry> = eligible_entries(&state.log).into_iter().cloned().collect();
        let split = find_safe_split_point(&eligible, self.keep_last);
        if split == 0 {
            // Nothing left to compact; the overflow is real and unresolvable
            // by summarization alone.
            return Err(CoreError::ContextOverflow);
        }

        let prefix = &eligible[..split];
        let summary = summarize_prefix(prefix);
        let replaced_range = SeqRange {
            from_seq: prefix.first().map(|e| e.seq).unwrap_or(0),
            to_seq: prefix.last().map(|e| e.seq + 1).unwrap_or(0),
        };

        let mut log = HistoryLog::new(state, counter);
        log.append(ConversationItem::Compaction { summary: summary.clone(), replaced_range });
        drop(log);

        let report = validate_history_invariants(&state.log);
        if !report.is_valid() {
            return Err(CoreError::Fatal(format!(
                "compaction would orphan call/output pairs: {report:?}"
            )));
        }

        state.last_summary = Some(summary);
        let _ = self.runtime.now_tick().await?;

        let remaining = HistoryLog::new(state, counter).estimated_tokens();
        let target = (state.config.auto_compact_token_limit as f64 * TARGET_FRACTION) as u64;
        if remaining > target {
            // Still over the target after one pass; the caller's drive loop
            // will call us again next iteration since ContextOverflow is
            // re-checked at the top of `TurnEngine::step`. We don't loop
            // here ourselves so a single compaction tick stays boundable.
            tracing::debug!(remaining, target, "compaction did not reach target in one pass");
        }

        Ok(())
    }
}

/// Find the largest prefix length `k` such that:
/// - at least `keep_last` entries remain after it, and
/// - splitting at `k` does not separate a `FunctionCall` from its
///   `FunctionCallOutput` (both land on the same side).
///
/// Adapted from the teacher's `TaskRunState::find_safe_split_point`.
fn find_safe_split_point(log: &[LogEntry], keep_last: usize) -> usize {
    if log.len() <= keep_last {
        return 0;
    }
    let mut candidate = log.len() - keep_last;

    while candidate > 0 {
        if is_safe_split(log, candidate) {
            return candidate;
        }
        candidate -= 1;
    }
    0
}

fn is_safe_split(log: &[LogEntry], split: usize) -> bool {
    let prefix_calls: std::collections::HashSet<&str> = log[..split]
        .iter()
        .filter_map(|entry| match &entry.item {
            ConversationItem::FunctionCall { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    !log[split..].iter().any(|entry| match &entry.item {
        ConversationItem::FunctionCallOutput { call_id, .. } => prefix_calls.contains(call_id.as_str()),
        _ => false,
    })
}

/// Build a deterministic extractive summary of the prefix being replaced.
/// Real deployments can swap this for an LLM-backed summarizer behind the
/// same signature; kept dependency-free here since compaction must stay
/// replay-deterministic and an extra activity call per compaction is not
/// worth the nondeterminism risk for a fallback path.
fn summarize_prefix(prefix: &[LogEntry]) -> String {
    let mut user_turns = 0;
    let mut assistant_turns = 0;
    let mut tool_calls = 0;
    let mut earlier_summaries = Vec::new();
    for entry in prefix {
        match &entry.item {
            ConversationItem::UserMessage { .. } => user_turns += 1,
            ConversationItem::AssistantMessage { .. } => assistant_turns += 1,
            ConversationItem::FunctionCall { .. } => tool_calls += 1,
            // A prior compaction's summary can itself fall inside this
            // prefix once enough new entries accumulate; fold its text in
            // rather than silently dropping it when this pass excludes it
            // from the eligible set.
            ConversationItem::Compaction { summary, .. } => earlier_summaries.push(summary.as_str()),
            _ => {}
        }
    }
    let mut out = String::new();
    if !earlier_summaries.is_empty() {
        out.push_str(&earlier_summaries.join(" "));
        out.push(' ');
    }
    out.push_str(&format!(
        "Summarized {} earlier entries: {} user messages, {} assistant messages, {} tool calls.",
        prefix.len(),
        user_turns,
        assistant_turns,
        tool_calls
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutputSuccess;

    fn msg(seq: u64, item: ConversationItem) -> LogEntry {
        LogEntry { seq, item }
    }

    #[test]
    fn split_point_never_separates_a_call_from_its_output() {
        let log = vec![
            msg(0, ConversationItem::UserMessage { text: "a".into() }),
            msg(1, ConversationItem::FunctionCall {
                call_id: "c1".into(),
                name: "shell".into(),
                arguments_json: "{}".into(),
            }),
            msg(2, ConversationItem::FunctionCallOutput {
                call_id: "c1".into(),
                content: "ok".into(),
                success: OutputSuccess::True,
            }),
            msg(3, ConversationItem::AssistantMessage { text: "b".into() }),
        ];
        // keep_last = 1 would naively split right after the call, before
        // its output; the safe split must back up to keep them together.
        let split = find_safe_split_point(&log, 1);
        assert!(is_safe_split(&log, split));
    }

    #[test]
    fn short_log_is_never_compacted() {
        let log = vec![msg(0, ConversationItem::UserMessage { text: "a".into() })];
        assert_eq!(find_safe_split_point(&log, DEFAULT_KEEP_LAST), 0);
    }

    #[test]
    fn summary_counts_entry_kinds() {
        let log = vec![
            msg(0, ConversationItem::UserMessage { text: "a".into() }),
            msg(1, ConversationItem::AssistantMessage { text: "b".into() }),
        ];
        let summary = summarize_prefix(&log);
        assert!(summary.contains("1 user messages"));
        assert!(summary.contains("1 assistant messages"));
    }

    struct StubRuntime;

    #[async_trait::async_trait]
    impl crate::ports::WorkflowRuntime for StubRuntime {
        async fn new_id(&self) -> Result<String, CoreError> {
            Ok("id-0".to_string())
        }
        async fn now_tick(&self) -> Result<u64, CoreError> {
            Ok(0)
        }
        async fn sleep(&self, _duration_ms: u64) -> Result<(), CoreError> {
            Ok(())
        }
        async fn continue_as_new(
            &self,
            _handoff: crate::config::ContinuationHandoff,
        ) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_compaction_folds_the_first_summary_in_rather_than_dropping_it() {
        let mut state = SessionState::new(
            "conv-1".to_string(),
            crate::config::SessionConfiguration::default(),
        );
        for i in 0..(DEFAULT_KEEP_LAST + 5) {
            state.push(ConversationItem::UserMessage { text: format!("msg {i}") });
        }
        let counter = crate::history::HeuristicTokenCounter;
        let compactor = Compactor::new(Arc::new(StubRuntime));
        compactor.compact(&mut state, &counter).await.unwrap();
        let first_summary = state.last_summary.clone().unwrap();

        for i in 0..(DEFAULT_KEEP_LAST + 5) {
            state.push(ConversationItem::UserMessage { text: format!("more {i}") });
        }
        compactor.compact(&mut state, &counter).await.unwrap();
        let second_summary = state.last_summary.clone().unwrap();

        assert!(
            second_summary.contains(&first_summary),
            "second compaction must not drop the first summary's content: {second_summary}"
        );
    }

    #[tokio::test]
    async fn compact_preserves_replaced_entries_for_audit() {
        let mut state = SessionState::new(
            "conv-1".to_string(),
            crate::config::SessionConfiguration::default(),
        );
        for i in 0..(DEFAULT_KEEP_LAST + 5) {
            state.push(ConversationItem::UserMessage { text: format!("msg {i}") });
        }
        let pre_compaction_len = state.log.len();

        let counter = crate::history::HeuristicTokenCounter;
        let compactor = Compactor::new(Arc::new(StubRuntime));
        compactor.compact(&mut state, &counter).await.unwrap();

        // Every entry present before compaction is still in the log
        // (spec.md §3: "items ... remain in the log for audit").
        assert_eq!(state.log.len(), pre_compaction_len + 1);
        assert!(matches!(state.log.last().unwrap().item, ConversationItem::Compaction { .. }));

        // But the replaced range is excluded from the eligible set used for
        // LLM context assembly.
        let eligible = eligible_entries(&state.log);
        let replaced_count = pre_compaction_len - DEFAULT_KEEP_LAST;
        assert_eq!(eligible.len(), DEFAULT_KEEP_LAST + 1, "kept tail + the summary item");
        let _ = replaced_count;
    }
}
