//! Shared in-memory port fakes for the integration suites in this
//! directory (`properties.rs`, `scenarios.rs`). Not a test module itself —
//! neither file name starts with `test_`/ends in `_test`, and living under
//! `support/` keeps cargo from compiling it as its own test binary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use session_core::{
    ChatPort, ContinuationHandoff, CoreError, FinishReason, LlmRequest, LlmResponse,
    ToolCapability, ToolInvocation, ToolOutcome, ToolRegistry, Usage, WorkflowRuntime,
};

/// Replays a fixed queue of responses, one per `complete` call, in order.
/// Scripting a whole conversation this way keeps scenario tests readable as
/// a flat list of "what the model said at each round".
pub struct ScriptedChat {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self { responses: Mutex::new(responses.into_iter().collect()) }
    }
}

#[async_trait]
impl ChatPort for ScriptedChat {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, CoreError> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CoreError::Fatal("scripted chat ran out of responses".to_string()))
    }
}

pub fn response(text: &str, usage: Usage) -> LlmResponse {
    LlmResponse {
        assistant_text: Some(text.to_string()),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
        usage,
    }
}

pub fn tool_call_response(
    call_id: &str,
    tool_name: &str,
    arguments_json: &str,
    usage: Usage,
) -> LlmResponse {
    LlmResponse {
        assistant_text: None,
        tool_calls: vec![session_core::RequestedToolCall {
            call_id: call_id.to_string(),
            name: tool_name.to_string(),
            arguments_json: arguments_json.to_string(),
        }],
        finish_reason: FinishReason::ToolCalls,
        usage,
    }
}

pub fn small_usage() -> Usage {
    Usage { prompt_tokens: 10, completion_tokens: 5, cached_tokens: 0 }
}

/// Echoes each invocation's arguments back as its output content, marking a
/// tool "untrusted" if its name is in `untrusted`, and failing (success:
/// false) any call whose arguments contain "FAIL".
pub struct EchoTools {
    untrusted: Vec<String>,
}

impl EchoTools {
    pub fn new(untrusted: &[&str]) -> Self {
        Self { untrusted: untrusted.iter().map(|s| s.to_string()).collect() }
    }
}

#[async_trait]
impl ToolRegistry for EchoTools {
    fn capability(&self, tool_name: &str) -> Option<ToolCapability> {
        Some(ToolCapability { is_trusted_by_default: !self.untrusted.iter().any(|n| n == tool_name) })
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolOutcome, CoreError> {
        let success = !invocation.arguments_json.contains("FAIL");
        Ok(ToolOutcome { call_id: invocation.call_id, content: invocation.arguments_json, success })
    }
}

/// Fails any call dispatched with `sandboxed: true`, succeeds otherwise —
/// models a tool that only works once an `on-failure` escalation reruns it
/// outside the sandbox.
pub struct SandboxSensitiveTools;

#[async_trait]
impl ToolRegistry for SandboxSensitiveTools {
    fn capability(&self, _tool_name: &str) -> Option<ToolCapability> {
        Some(ToolCapability { is_trusted_by_default: false })
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolOutcome, CoreError> {
        if invocation.sandboxed {
            Ok(ToolOutcome { call_id: invocation.call_id, content: "permission denied".to_string(), success: false })
        } else {
            Ok(ToolOutcome { call_id: invocation.call_id, content: invocation.arguments_json, success: true })
        }
    }
}

/// Replay-safe id/tick source: sequential `id-N` ids and a monotonic tick
/// counter, standing in for the durable workflow runtime (spec.md §5).
pub struct DeterministicRuntime {
    next_id: AtomicU64,
    tick: AtomicU64,
    pub continuations: Mutex<Vec<ContinuationHandoff>>,
}

impl DeterministicRuntime {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(0), tick: AtomicU64::new(0), continuations: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl WorkflowRuntime for DeterministicRuntime {
    async fn new_id(&self) -> Result<String, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("id-{id}"))
    }

    async fn now_tick(&self) -> Result<u64, CoreError> {
        Ok(self.tick.fetch_add(1, Ordering::SeqCst))
    }

    async fn sleep(&self, _duration_ms: u64) -> Result<(), CoreError> {
        Ok(())
    }

    async fn continue_as_new(&self, handoff: ContinuationHandoff) -> Result<(), CoreError> {
        self.continuations.lock().push(handoff);
        Ok(())
    }
}

pub fn long_text(seed: &str, chars: usize) -> String {
    seed.chars().cycle().take(chars).collect()
}
