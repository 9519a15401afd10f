//! The conversation data model: the append-only history kept by a session.
//!
//! `ConversationItem` is a rich enum over the kinds of things that can be
//! appended to a session's history. Unknown variants must be a hard error at
//! deserialization rather than silently dropped, which is exactly what
//! serde's internally-tagged representation gives us for free (no
//! `#[serde(other)]` catch-all variant is defined).

use serde::{Deserialize, Serialize};

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnEndReason {
    Natural,
    Interrupted,
    ToolStop,
    LengthCap,
}

/// Tri-state success flag for a `FunctionCallOutput`: a call can succeed,
/// fail, or have its outcome unknown (e.g. a synthetic output created before
/// the call ever actually ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSuccess {
    Unknown,
    True,
    False,
}

impl OutputSuccess {
    pub fn from_bool(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::False)
    }
}

/// A half-open `[from_seq, to_seq)` range of sequence numbers replaced by a
/// compaction summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub from_seq: u64,
    pub to_seq: u64,
}

impl SeqRange {
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.from_seq && seq < self.to_seq
    }
}

/// One entry in the append-only conversation log.
///
/// Unknown variants are a hard deserialization error: this enum is
/// internally tagged with no catch-all arm, so `serde_json` rejects any
/// `"type"` it doesn't recognize instead of coercing it away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    TurnStarted { turn_id: String },
    TurnComplete { turn_id: String, reason: TurnEndReason },
    UserMessage { text: String },
    AssistantMessage { text: String },
    FunctionCall {
        call_id: String,
        name: String,
        arguments_json: String,
    },
    FunctionCallOutput {
        call_id: String,
        content: String,
        success: OutputSuccess,
    },
    Compaction {
        summary: String,
        replaced_range: SeqRange,
    },
}

impl ConversationItem {
    /// The `call_id` this item participates in, if it's part of a
    /// call/output pair.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id.as_str())
            }
            _ => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Self::FunctionCall { .. })
    }

    pub fn is_function_call_output(&self) -> bool {
        matches!(self, Self::FunctionCallOutput { .. })
    }
}

/// A `ConversationItem` together with the monotonic `seq` the history log
/// assigned it at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub item: ConversationItem,
}

/// Token/iteration accounting carried in `SessionState.totals` and the final
/// `WorkflowResult`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub iterations: u64,
    /// Completed turns. Distinct from `iterations` (LLM rounds within a
    /// turn); tracked directly rather than derived by scanning history on
    /// every projection.
    pub turn_count: u64,
    /// Multiset of tool names executed this session.
    pub tool_calls_executed: std::collections::HashMap<String, u64>,
}

impl Totals {
    pub fn merge_usage(&mut self, usage: &Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.cached_tokens += usage.cached_tokens;
    }

    pub fn record_tool_call(&mut self, tool_name: &str) {
        *self.tool_calls_executed.entry(tool_name.to_string()).or_insert(0) += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Token usage reported by a Chat activity call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
}
