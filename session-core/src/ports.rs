//! Ports: traits standing in for the externals this crate deliberately does
//! not implement — the durable workflow runtime, concrete LLM providers, and
//! concrete tool handlers. Each is an `async_trait` with a single driving
//! method over a params struct, the same shape a generalized turn-driver
//! interface would take.
//!
//! None of these traits are implemented by this crate; `tests/` carries
//! in-memory fakes. Production implementations (a Temporal worker, an OpenAI
//! client, a sandboxed exec handler) live outside this crate's scope.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ContinuationHandoff, EnvInherit, SandboxMode, SessionConfiguration};
use crate::error::CoreError;
use crate::model::Usage;

/// A tool call the model requested during a Chat activity invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedToolCall {
    pub call_id: String,
    /// MCP-qualified as `mcp__<server>__<tool>` for MCP-backed tools, or the
    /// bare name for a built-in tool.
    pub name: String,
    pub arguments_json: String,
}

/// Why the Chat activity's streaming response stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
}

/// One message in the flattened request sent to `ChatPort::complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The request payload for a single LLM round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<McpToolRef>,
    pub idempotency_key: String,
}

/// A single LLM round's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub assistant_text: Option<String>,
    pub tool_calls: Vec<RequestedToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// A tool advertised to the model, either built-in or MCP-qualified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolRef {
    pub name: String,
    pub description: String,
    pub parameters_schema_json: String,
}

/// Durable workflow runtime operations the core needs but does not
/// implement: activity dispatch is expressed through the narrower
/// `ChatPort`/`ToolRegistry` traits below rather than a single generic
/// `call_activity`, so this trait stays object-safe and injectable as
/// `Arc<dyn WorkflowRuntime>`.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    /// A replay-safe source of new unique ids: ids must never be generated
    /// with a raw `Uuid::new_v4()` call inside workflow code, only through
    /// a durable side-effect call like this one.
    async fn new_id(&self) -> Result<String, CoreError>;

    /// A replay-safe monotonic tick, used for backoff bookkeeping instead of
    /// wall-clock reads.
    async fn now_tick(&self) -> Result<u64, CoreError>;

    /// Durable sleep; resolves no earlier than `duration_ms` of workflow
    /// time has elapsed.
    async fn sleep(&self, duration_ms: u64) -> Result<(), CoreError>;

    /// End this workflow execution and start a fresh one seeded with
    /// `handoff`. Expressed as a fallible async method rather than a
    /// diverging `-> !` return so the trait stays object-safe and fakeable
    /// in tests; a successful return means the caller (the Controller's
    /// event loop) must stop driving further events, as the replacement
    /// execution now owns the session.
    async fn continue_as_new(&self, handoff: ContinuationHandoff) -> Result<(), CoreError>;
}

/// The LLM provider boundary. Concrete providers (OpenAI, Anthropic, local
/// models) are out of scope; this is the seam a generalized turn-driver
/// trait occupies.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, CoreError>;
}

/// Outcome of executing one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub content: String,
    pub success: bool,
}

/// The `(server, tool)` pair addressed by an `mcp__<server>__<tool>`-
/// qualified tool name (spec.md §4.3 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolTarget {
    pub server: String,
    pub tool: String,
}

impl McpToolTarget {
    /// Parse an `mcp__<server>__<tool>`-qualified name. Returns `None` for a
    /// bare built-in tool name, or a malformed qualifier (empty server or
    /// tool segment).
    pub fn parse(qualified_name: &str) -> Option<Self> {
        let rest = qualified_name.strip_prefix("mcp__")?;
        let (server, tool) = rest.split_once("__")?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self { server: server.to_string(), tool: tool.to_string() })
    }
}

/// Sandbox policy attached to an invocation (spec.md §4.3 step 3
/// "sandbox-policy ref"), so a tool handler can see what the session
/// permits without re-deriving it from `SessionConfiguration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicyRef {
    pub mode: SandboxMode,
    pub writable_roots: Vec<String>,
    pub network_access: bool,
}

impl SandboxPolicyRef {
    pub fn from_config(config: &SessionConfiguration) -> Self {
        Self {
            mode: config.sandbox_mode,
            writable_roots: config.sandbox_writable_roots.clone(),
            network_access: config.sandbox_network_access,
        }
    }
}

/// Environment-variable policy attached to an invocation (spec.md §4.3 step
/// 3 "env-policy ref").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvPolicyRef {
    pub inherit: EnvInherit,
    pub exclude: Vec<String>,
    pub include_only: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub ignore_default_excludes: bool,
}

impl EnvPolicyRef {
    pub fn from_config(config: &SessionConfiguration) -> Self {
        Self {
            inherit: config.env_inherit,
            exclude: config.env_exclude.clone(),
            include_only: config.env_include_only.clone(),
            set: config.env_set.clone(),
            ignore_default_excludes: config.env_ignore_default_excludes,
        }
    }
}

/// One queued tool invocation handed to `ToolRegistry::invoke`.
///
/// Carries the session context the Dispatcher attaches ahead of every call
/// (spec.md §4.3 steps 2-3): `cwd`, whether this particular attempt should
/// run inside the sandbox, the parsed MCP target for an `mcp__`-qualified
/// name, and the sandbox/env policy refs a handler needs to actually
/// enforce them. `sandboxed` is normally derived from
/// `SessionConfiguration.sandbox_mode`, but an `on-failure` escalation
/// re-run explicitly forces it to `false` so the retry can actually
/// succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments_json: String,
    pub cwd: String,
    pub sandboxed: bool,
    pub mcp_target: Option<McpToolTarget>,
    pub sandbox_policy: SandboxPolicyRef,
    pub env_policy: EnvPolicyRef,
}

/// What a classifier knows about a tool ahead of dispatch, used by the
/// approval gate to decide whether a call needs a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCapability {
    /// Whether this tool can mutate state outside the sandbox's writable
    /// roots or perform network I/O — the signal the approval gate uses for
    /// `UnlessTrusted`.
    pub is_trusted_by_default: bool,
}

/// The tool execution boundary. Concrete tool handlers (shell exec,
/// file I/O, MCP clients) are out of scope; this crate only dispatches
/// through this trait and applies the generic concurrency/truncation/
/// approval policy around it.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Look up static capability metadata for a tool name, used before
    /// dispatch to decide whether approval is required. Returns `None` for
    /// an unknown tool (the dispatcher then reports `ToolErrorKind::NotFound`).
    fn capability(&self, tool_name: &str) -> Option<ToolCapability>;

    /// Execute one already-approved tool call.
    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolOutcome, CoreError>;
}

/// Classifies whether a shell/exec-like command string is safe to run
/// without prompting, separating "is this command trusted" from "does
/// policy require asking".
pub trait CommandSafetyClassifier: Send + Sync {
    fn is_known_safe(&self, command: &str) -> bool;
}

/// Marker bundle of the three externally-supplied ports a `Controller` needs,
/// so call sites pass one struct instead of three separate `Arc`s.
pub struct Ports {
    pub runtime: std::sync::Arc<dyn WorkflowRuntime>,
    pub chat: std::sync::Arc<dyn ChatPort>,
    pub tools: std::sync::Arc<dyn ToolRegistry>,
}

/// Config snapshot carried alongside `Ports` when starting a fresh session,
/// kept separate from `Ports` since it is plain data, not a dependency.
pub struct StartParams {
    pub conversation_id: String,
    pub config: SessionConfiguration,
}
