//! Turn Engine: the LLM⇄tool loop that drives one turn to completion.
//!
//! Same overall shape as a classic agent run loop: call the model, react to
//! tool calls vs. a final answer, track iteration/usage totals — built
//! around this crate's `ChatPort`/`ToolDispatcher` port seam, and extended
//! with an approval short-circuit and a context-overflow→compaction
//! handoff.

use std::sync::Arc;

use crate::approval::{classify, should_escalate_on_failure, stage_approval, stage_escalation, ApprovalDecision};
use crate::dispatcher::ToolDispatcher;
use crate::error::{CoreError, CoreResult};
use crate::history::{HistoryLog, TokenCounter};
use crate::model::{ConversationItem, OutputSuccess, TurnEndReason, Usage};
use crate::ports::{ChatMessage, ChatPort, FinishReason, LlmRequest, McpToolRef, ToolInvocation, WorkflowRuntime};
use crate::state::{Phase, SessionState};

/// Hard ceiling on LLM⇄tool round-trips within a single turn. This cap
/// always wins over any other early-stop heuristic.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Outcome of driving one turn to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The turn finished normally, awaiting the next user message.
    Completed(TurnEndReason),
    /// The turn is now blocked on a tool approval and must suspend; the
    /// caller (the session controller) is responsible for transitioning to
    /// `AwaitingApproval`.
    AwaitingApproval,
    /// The turn is blocked on an escalation decision after a sandboxed
    /// failure.
    AwaitingEscalation,
    /// The context window was exceeded and could not be brought back under
    /// budget; the controller transitions to `Phase::Error`.
    ContextOverflow,
    /// One LLM⇄tool round finished — every call in the batch was either
    /// dispatched and closed out or auto-denied — with nothing left
    /// pending, so the turn must re-enter the LLM step (spec.md §4.4 step
    /// 5d "re-enter step 3"). The caller (`Controller::drive`) loops back
    /// into another `step` call rather than treating this as turn
    /// completion.
    ContinueTurn,
}

pub struct TurnEngine<'a> {
    chat: Arc<dyn ChatPort>,
    dispatcher: &'a ToolDispatcher,
    runtime: Arc<dyn WorkflowRuntime>,
    max_iterations: u32,
}

impl<'a> TurnEngine<'a> {
    pub fn new(chat: Arc<dyn ChatPort>, dispatcher: &'a ToolDispatcher, runtime: Arc<dyn WorkflowRuntime>) -> Self {
        Self {
            chat,
            dispatcher,
            runtime,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Drive the turn identified by `turn_id` forward by exactly one LLM
    /// round. The Controller calls this repeatedly (once per tick of its
    /// event loop) rather than looping internally, so that interrupts and
    /// other events can interleave between rounds — the controller owns the
    /// loop, not the driver.
    #[tracing::instrument(skip(self, state, counter), fields(turn_id, iteration = state.totals.iterations))]
    pub async fn step(
        &self,
        state: &mut SessionState,
        turn_id: &str,
        counter: &dyn TokenCounter,
    ) -> CoreResult<TurnOutcome> {
        if state.totals.iterations >= self.max_iterations as u64 {
            return Ok(self.finish(state, turn_id, TurnEndReason::LengthCap));
        }

        {
            let log = HistoryLog::new(state, counter);
            if log.estimated_tokens() >= state.config.auto_compact_token_limit as u64 {
                return Ok(TurnOutcome::ContextOverflow);
            }
        }

        let request = self.build_request(state);
        let idempotency_key = request.idempotency_key.clone();
        let response = match self.chat.complete(request).await {
            Ok(response) => response,
            Err(CoreError::RateLimited { retry_after_ms }) => {
                self.runtime.sleep(retry_after_ms).await?;
                let tick = self.runtime.now_tick().await?;
                state.api_failures.record_failure(tick);
                return Err(CoreError::RateLimited { retry_after_ms });
            }
            Err(CoreError::Transient(message)) => {
                let tick = self.runtime.now_tick().await?;
                state.api_failures.record_failure(tick);
                if state.api_failures.should_circuit_break() {
                    return Err(CoreError::Fatal(format!(
                        "upstream failing repeatedly: {message}"
                    )));
                }
                let backoff = state.api_failures.backoff_duration_ms();
                self.runtime.sleep(backoff).await?;
                return Err(CoreError::Transient(message));
            }
            Err(other) => return Err(other),
        };
        state.api_failures.reset();
        let _ = idempotency_key;

        state.totals.iterations += 1;
        state.totals.merge_usage(&response.usage);

        let had_assistant_text = response.assistant_text.is_some();
        if let Some(text) = response.assistant_text {
            let mut log = HistoryLog::new(state, counter);
            log.append(ConversationItem::AssistantMessage { text });
        }

        if response.tool_calls.is_empty() {
            state.consecutive_tool_loops = 0;
            let reason = match response.finish_reason {
                FinishReason::Length => TurnEndReason::LengthCap,
                _ => TurnEndReason::Natural,
            };
            return Ok(self.finish(state, turn_id, reason));
        }

        if had_assistant_text {
            state.consecutive_tool_loops = 0;
        } else {
            state.consecutive_tool_loops += 1;
        }
        if state.consecutive_tool_loops > state.config.max_consecutive_tool_loops {
            tracing::warn!(
                turn_id,
                streak = state.consecutive_tool_loops,
                "consecutive tool-only rounds exceeded the configured streak, ending turn early"
            );
            return Ok(self.finish(state, turn_id, TurnEndReason::LengthCap));
        }

        self.handle_tool_calls(state, turn_id, counter, response.tool_calls).await
    }

    fn build_request(&self, state: &SessionState) -> LlmRequest {
        let mut messages = Vec::new();
        if let Some(instructions) = &state.config.base_instructions {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: instructions.clone(),
            });
        }
        for entry in crate::history::eligible_entries(&state.log) {
            if let Some(message) = render_item_as_message(&entry.item) {
                messages.push(message);
            }
        }
        LlmRequest {
            messages,
            tools: advertise_tools(state),
            idempotency_key: format!("{}:{}", state.conversation_id, state.totals.iterations),
        }
    }

    async fn handle_tool_calls(
        &self,
        state: &mut SessionState,
        turn_id: &str,
        counter: &dyn TokenCounter,
        tool_calls: Vec<crate::ports::RequestedToolCall>,
    ) -> CoreResult<TurnOutcome> {
        let mut approved = Vec::new();

        for call in &tool_calls {
            {
                let mut log = HistoryLog::new(state, counter);
                log.append(ConversationItem::FunctionCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments_json: call.arguments_json.clone(),
                });
            }

            let capability = self.dispatcher.capability(&call.name);
            let resolved = capability.is_some();
            match classify(state, &call.name, resolved, capability) {
                ApprovalDecision::Proceed => approved.push(ToolInvocation {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments_json: call.arguments_json.clone(),
                    cwd: state.config.cwd.clone(),
                    sandboxed: is_sandboxed(state),
                    mcp_target: crate::ports::McpToolTarget::parse(&call.name),
                    sandbox_policy: crate::ports::SandboxPolicyRef::from_config(&state.config),
                    env_policy: crate::ports::EnvPolicyRef::from_config(&state.config),
                }),
                ApprovalDecision::NeedsApproval { reason } => {
                    state.pending_approvals.push(stage_approval(
                        call.call_id.clone(),
                        call.name.clone(),
                        call.arguments_json.clone(),
                        reason,
                    ));
                }
                ApprovalDecision::AutoDeny { reason } => {
                    let mut log = HistoryLog::new(state, counter);
                    log.append(ConversationItem::FunctionCallOutput {
                        call_id: call.call_id.clone(),
                        content: format!("denied: {reason}"),
                        success: OutputSuccess::False,
                    });
                }
            }
        }

        if !state.pending_approvals.is_empty() {
            let _ = turn_id;
            return Ok(TurnOutcome::AwaitingApproval);
        }

        if approved.is_empty() {
            return Ok(TurnOutcome::ContinueTurn);
        }

        for invocation in &approved {
            state.tools_in_flight.insert(invocation.name.clone());
        }
        let outcomes = self.dispatcher.dispatch_all(approved).await;
        state.tools_in_flight.clear();
        let mut needs_escalation = false;

        for outcome in outcomes {
            let mut staged_for_escalation = false;
            if !outcome.success && should_escalate_on_failure(state) {
                needs_escalation = true;
                staged_for_escalation = true;
                let tool_name = tool_calls
                    .iter()
                    .find(|c| c.call_id == outcome.call_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let arguments_json = tool_calls
                    .iter()
                    .find(|c| c.call_id == outcome.call_id)
                    .map(|c| c.arguments_json.clone())
                    .unwrap_or_default();
                state.pending_escalations.push(stage_escalation(
                    outcome.call_id.clone(),
                    tool_name,
                    arguments_json,
                    outcome.content.clone(),
                ));
            }

            state.totals.record_tool_call(
                tool_calls
                    .iter()
                    .find(|c| c.call_id == outcome.call_id)
                    .map(|c| c.name.as_str())
                    .unwrap_or("unknown"),
            );

            // A call staged for escalation stays open until the user's
            // approve/deny response resolves it (`Controller::
            // on_escalation_response` appends the eventual output then):
            // appending one here too would leave two `FunctionCallOutput`s
            // for the same `call_id` once the rerun (or denial) appends its
            // own, which `validate_history_invariants` would then flag as
            // an orphan.
            if !staged_for_escalation {
                let mut log = HistoryLog::new(state, counter);
                log.append(ConversationItem::FunctionCallOutput {
                    call_id: outcome.call_id,
                    content: outcome.content,
                    success: OutputSuccess::from_bool(outcome.success),
                });
            }
        }

        if needs_escalation {
            return Ok(TurnOutcome::AwaitingEscalation);
        }

        Ok(TurnOutcome::ContinueTurn)
    }

    /// Close out the turn. Runs a defense-in-depth call/output pairing check
    /// first: a turn that reached `finish` through the normal natural/
    /// length-cap path should never have an open `FunctionCall` (every path
    /// into `handle_tool_calls` already closes what it dispatches), but if
    /// one somehow slipped through we normalize it here rather than let P3
    /// silently break (mirrors the teacher's
    /// `ensure_call_outputs_present`/`remove_orphan_outputs` pairing pass).
    fn finish(&self, state: &mut SessionState, turn_id: &str, reason: TurnEndReason) -> TurnOutcome {
        let report = crate::state::validate_history_invariants(&state.log);
        for call_id in report.missing_outputs {
            tracing::warn!(turn_id, call_id = %call_id, "closing unmatched function call at turn boundary");
            state.push(ConversationItem::FunctionCallOutput {
                call_id,
                content: "no output recorded before turn end".to_string(),
                success: OutputSuccess::Unknown,
            });
        }

        state.push(ConversationItem::TurnComplete {
            turn_id: turn_id.to_string(),
            reason,
        });
        state.totals.turn_count += 1;
        state.current_turn_id = None;
        state.consecutive_tool_loops = 0;
        state.phase = Phase::Idle;
        tracing::info!(turn_id, ?reason, "turn complete");
        TurnOutcome::Completed(reason)
    }
}

/// Whether tool calls in this session run inside the sandbox by default.
/// `FullAccess` is the only mode that disables sandboxing up front;
/// `ReadOnly`/`WorkspaceWrite` both run sandboxed, differing only in what
/// the sandbox itself permits.
pub(crate) fn is_sandboxed(state: &SessionState) -> bool {
    !matches!(state.config.sandbox_mode, crate::config::SandboxMode::FullAccess)
}

fn render_item_as_message(item: &ConversationItem) -> Option<ChatMessage> {
    match item {
        ConversationItem::UserMessage { text } => Some(ChatMessage {
            role: "user".to_string(),
            content: text.clone(),
        }),
        ConversationItem::AssistantMessage { text } => Some(ChatMessage {
            role: "assistant".to_string(),
            content: text.clone(),
        }),
        ConversationItem::FunctionCallOutput { content, .. } => Some(ChatMessage {
            role: "tool".to_string(),
            content: content.clone(),
        }),
        ConversationItem::Compaction { summary, .. } => Some(ChatMessage {
            role: "system".to_string(),
            content: format!("Earlier conversation summarized: {summary}"),
        }),
        _ => None,
    }
}

fn advertise_tools(state: &SessionState) -> Vec<McpToolRef> {
    let mut tools = Vec::new();
    if state.config.tools.enable_shell {
        tools.push(McpToolRef {
            name: "shell".to_string(),
            description: "Run a shell command".to_string(),
            parameters_schema_json: "{}".to_string(),
        });
    }
    if state.config.tools.enable_read_file {
        tools.push(McpToolRef {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            parameters_schema_json: "{}".to_string(),
        });
    }
    for server_name in state.config.tools.mcp_servers.keys() {
        tools.push(McpToolRef {
            name: format!("mcp__{server_name}__*"),
            description: format!("Tools from MCP server {server_name}"),
            parameters_schema_json: "{}".to_string(),
        });
    }
    tools
}
