//! Typed error vocabulary shared by every component of the session core.
//!
//! Library-internal failures are `thiserror` enum variants here; port calls
//! that bridge into caller-supplied externals use `anyhow::Error` instead
//! (see `ports.rs`), so the crate's own control flow never has to match on
//! someone else's error type.

use std::collections::HashSet;

use thiserror::Error;

use crate::state::Phase;

/// Classification of a tool-layer failure, surfaced to callers through
/// [`CoreError::Tool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// Arguments failed to validate (e.g. JSON parse failure).
    Validation,
    /// The named tool or MCP server does not exist.
    NotFound,
    /// The tool invocation exceeded its `start_to_close_timeout`.
    Timeout,
    /// A retriable failure (network blip, provider 5xx). The activity layer
    /// retries these before the core ever observes them; a `Transient`
    /// reaching the core means retries were exhausted.
    Transient,
}

impl ToolErrorKind {
    /// Whether the dispatcher's retry policy should retry this kind.
    /// Only `Transient` kinds are retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors that can surface at the boundary of the session core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A tool-layer error destined to become a `FunctionCallOutput{success:false}`
    /// rather than aborting the turn.
    #[error("tool error ({kind:?}): {message}")]
    Tool {
        kind: ToolErrorKind,
        message: String,
    },

    /// A provider error that the retry policy exhausted without a signalled
    /// retry-after interval.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// A provider rate-limit signal with a server-specified retry interval.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The model's context window was exceeded and compaction could not
    /// bring usage back under budget.
    #[error("context window exceeded")]
    ContextOverflow,

    /// An update was rejected because the session was not in a phase that
    /// accepts it. Carries the set of phases that would have been accepted,
    /// for a precise client-facing message.
    #[error("update rejected: session is in phase {actual:?}, expected one of {expected:?}")]
    ConflictingPhase {
        actual: Phase,
        expected: HashSet<Phase>,
    },

    /// An id referenced in an `ApprovalResponse`/`EscalationResponse` was not
    /// part of the currently staged pending set.
    #[error("id set does not match pending set: {0}")]
    InvalidIdSet(String),

    /// An unrecoverable session error. Ends the workflow with
    /// `end_reason: "error"`; history is preserved and only `get_*`/`shutdown`
    /// remain acceptable afterward.
    #[error("fatal session error: {0}")]
    Fatal(String),

    /// The underlying durable-workflow runtime port failed irrecoverably
    /// (append failure, activity dispatch failure outside the tool/chat
    /// taxonomy above). History append failure is always treated as fatal —
    /// there is no recovery path that doesn't risk a torn, unreplayable log.
    #[error("runtime port failure: {0}")]
    Runtime(#[from] anyhow::Error),
}

impl CoreError {
    pub fn conflicting_phase(actual: Phase, expected: impl IntoIterator<Item = Phase>) -> Self {
        Self::ConflictingPhase {
            actual,
            expected: expected.into_iter().collect(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
