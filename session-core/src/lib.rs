//! A deterministic, single-threaded session state machine for a durable
//! coding-agent turn loop: history logging, approval gating, tool dispatch,
//! turn driving, compaction, and the query/update surface a workflow host
//! exposes around them.
//!
//! The durable workflow runtime, concrete LLM providers, and concrete tool
//! handlers are modeled as ports (see [`ports`]) and implemented outside
//! this crate.

pub mod approval;
pub mod compaction;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod history;
pub mod model;
pub mod ports;
pub mod projection;
pub mod state;
pub mod turn;

pub use config::{
    ApprovalMode, ContinuationHandoff, EndReason, EnvInherit, McpServerConfig, ModelSettings,
    SandboxMode, SessionConfiguration, ToolsConfig, WorkflowInput, WorkflowResult,
};
pub use controller::{Controller, Event};
pub use error::{CoreError, CoreResult, ToolErrorKind};
pub use handlers::{SessionHandle, DEFAULT_KEEPALIVE_MS};
pub use model::{ConversationItem, LogEntry, OutputSuccess, SeqRange, Totals, TurnEndReason, Usage};
pub use ports::{
    ChatMessage, ChatPort, CommandSafetyClassifier, EnvPolicyRef, FinishReason, LlmRequest,
    LlmResponse, McpToolRef, McpToolTarget, Ports, RequestedToolCall, SandboxPolicyRef, StartParams,
    ToolCapability, ToolInvocation, ToolOutcome, ToolRegistry, WorkflowRuntime,
};
pub use projection::{Cursor, StateProjection, StateUpdate, TurnStatus};
pub use state::{Phase, SessionState};
