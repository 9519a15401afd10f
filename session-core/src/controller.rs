//! C5 — Session Controller: the single-threaded event loop that owns
//! `SessionState` and drives C2-C4/C8 in response to `Event`s (spec.md
//! §4.5).
//!
//! The mailbox shape (`tokio::sync::mpsc` feeding a `select!`-free serial
//! loop, since every event is handled to completion before the next is
//! read) follows the teacher's `AgentSessionController`, which likewise
//! keeps a single `&mut self` owner of state and never shares it across
//! tasks — the workflow-determinism requirement in spec.md §7 makes that
//! constraint even stricter here than in the teacher (no `tokio::spawn` may
//! touch `SessionState` directly; only the dispatcher's tool tasks, which
//! don't, are allowed to run concurrently).

use std::sync::Arc;

use crate::compaction::Compactor;
use crate::dispatcher::ToolDispatcher;
use crate::error::{CoreError, CoreResult};
use crate::history::{HistoryLog, TokenCounter};
use crate::model::ConversationItem;
use crate::ports::{ChatPort, ToolRegistry, WorkflowRuntime};
use crate::state::{Phase, SessionState};
use crate::turn::{TurnEngine, TurnOutcome};

/// Inbound events the Controller reacts to (spec.md §4.5, §4.6's update ops
/// lowered to the controller's internal vocabulary).
#[derive(Debug, Clone)]
pub enum Event {
    UserMessage { text: String },
    /// `approved_call_ids ⊎ denied_call_ids` must partition the currently
    /// staged `pending_approvals` set (spec.md §4.6 P4); an id present in
    /// neither list is treated as denied (spec.md §4.2 "a missing id counts
    /// as denied").
    ApprovalResponse {
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
        auto_approve_session: bool,
    },
    /// Same partition shape as `ApprovalResponse`, over `pending_escalations`
    /// (spec.md §4.2 "escalation path").
    EscalationResponse {
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
    },
    Interrupt,
    Shutdown,
    /// Explicit compaction request (spec.md §4.6 `compact{}`); accepted only
    /// in `waiting_for_input`.
    Compact,
    /// Swap the active model for the next LLM call (spec.md §4.6
    /// `update_model{provider, model}`); accepted only in `waiting_for_input`.
    UpdateModel { provider: String, model: String },
}

pub struct Controller {
    chat: Arc<dyn ChatPort>,
    tools: Arc<dyn ToolRegistry>,
    runtime: Arc<dyn WorkflowRuntime>,
    counter: Box<dyn TokenCounter>,
}

impl Controller {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        tools: Arc<dyn ToolRegistry>,
        runtime: Arc<dyn WorkflowRuntime>,
        counter: Box<dyn TokenCounter>,
    ) -> Self {
        Self { chat, tools, runtime, counter }
    }

    /// Handle one inbound event against the current state, driving the turn
    /// engine forward (possibly across many internal iterations) until the
    /// session lands in a phase that must wait for another event (spec.md
    /// §4.5 transition table).
    #[tracing::instrument(skip(self, state), fields(conversation_id = %state.conversation_id, phase = ?state.phase))]
    pub async fn handle(&self, state: &mut SessionState, event: Event) -> CoreResult<()> {
        if state.phase.is_terminal() && !matches!(event, Event::Shutdown) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::Idle]));
        }

        match event {
            Event::UserMessage { text } => self.on_user_message(state, text).await,
            Event::ApprovalResponse { approved_call_ids, denied_call_ids, auto_approve_session } => {
                self.on_approval_response(state, approved_call_ids, denied_call_ids, auto_approve_session)
                    .await
            }
            Event::EscalationResponse { approved_call_ids, denied_call_ids } => {
                self.on_escalation_response(state, approved_call_ids, denied_call_ids).await
            }
            Event::Interrupt => self.on_interrupt(state),
            Event::Shutdown => self.on_shutdown(state),
            Event::Compact => self.on_compact(state).await,
            Event::UpdateModel { provider, model } => self.on_update_model(state, provider, model),
        }
    }

    async fn on_user_message(&self, state: &mut SessionState, text: String) -> CoreResult<()> {
        // spec.md §4.6: accepted in `waiting_for_input` (starts a turn) and
        // in `approval_pending` (queued as a mid-turn side-channel comment —
        // just appended to history, since it will surface in the next LLM
        // request's eligible history without disturbing the in-flight
        // approval).
        if matches!(state.phase, Phase::AwaitingApproval) {
            let mut log = HistoryLog::new(state, self.counter.as_ref());
            log.append(ConversationItem::UserMessage { text });
            return Ok(());
        }
        if !matches!(state.phase, Phase::Idle) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::Idle, Phase::AwaitingApproval]));
        }

        {
            let mut log = HistoryLog::new(state, self.counter.as_ref());
            log.append(ConversationItem::UserMessage { text });
        }

        let turn_id = self.runtime.new_id().await?;
        tracing::info!(turn_id = %turn_id, "turn started");
        state.push(ConversationItem::TurnStarted { turn_id: turn_id.clone() });
        state.current_turn_id = Some(turn_id);
        state.consecutive_tool_loops = 0;
        state.phase = Phase::AwaitingLlm;

        self.drive(state).await
    }

    async fn on_approval_response(
        &self,
        state: &mut SessionState,
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
        auto_approve_session: bool,
    ) -> CoreResult<()> {
        if !matches!(state.phase, Phase::AwaitingApproval) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::AwaitingApproval]));
        }
        let known: std::collections::HashSet<_> =
            state.pending_approvals.iter().map(|p| p.call_id.clone()).collect();
        if approved_call_ids.iter().chain(denied_call_ids.iter()).any(|id| !known.contains(id)) {
            return Err(CoreError::InvalidIdSet(
                "approval response references a call_id not in the pending set".to_string(),
            ));
        }

        // P4: approved ⊎ denied must equal the pending set; any id the
        // caller left out of both lists counts as denied (spec.md §4.2).
        let approved_set: std::collections::HashSet<String> = approved_call_ids.into_iter().collect();
        let to_deny: Vec<String> = known.iter().filter(|id| !approved_set.contains(*id)).cloned().collect();
        let to_approve: Vec<String> = known.into_iter().filter(|id| approved_set.contains(id)).collect();

        let resolved = crate::approval::resolve_approval(state, &to_approve, auto_approve_session);
        let cwd = state.config.cwd.clone();
        let sandboxed = crate::turn::is_sandboxed(state);
        let sandbox_policy = crate::ports::SandboxPolicyRef::from_config(&state.config);
        let env_policy = crate::ports::EnvPolicyRef::from_config(&state.config);
        // resolve_approval already drained these entries out of
        // state.pending_approvals, so the tool name has to travel with the
        // invocation rather than being looked up there after the fact.
        let tool_names_by_call_id: std::collections::HashMap<String, String> = resolved
            .iter()
            .map(|pending| (pending.call_id.clone(), pending.tool_name.clone()))
            .collect();
        let invocations: Vec<_> = resolved
            .into_iter()
            .map(|pending| crate::ports::ToolInvocation {
                mcp_target: crate::ports::McpToolTarget::parse(&pending.tool_name),
                call_id: pending.call_id,
                name: pending.tool_name,
                arguments_json: pending.arguments_json,
                cwd: cwd.clone(),
                sandboxed,
                sandbox_policy: sandbox_policy.clone(),
                env_policy: env_policy.clone(),
            })
            .collect();

        if !invocations.is_empty() {
            for invocation in &invocations {
                state.tools_in_flight.insert(invocation.name.clone());
            }
            let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools));
            let outcomes = dispatcher.dispatch_all(invocations).await;
            state.tools_in_flight.clear();
            for outcome in outcomes {
                let tool_name = tool_names_by_call_id
                    .get(&outcome.call_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                state.totals.record_tool_call(&tool_name);
                let mut log = HistoryLog::new(state, self.counter.as_ref());
                log.append(ConversationItem::FunctionCallOutput {
                    call_id: outcome.call_id,
                    content: outcome.content,
                    success: crate::model::OutputSuccess::from_bool(outcome.success),
                });
            }
        }

        let mut denied_outputs = Vec::new();
        state.pending_approvals.retain(|pending| {
            if to_deny.contains(&pending.call_id) {
                denied_outputs.push(pending.call_id.clone());
                false
            } else {
                true
            }
        });
        for call_id in denied_outputs {
            let mut log = HistoryLog::new(state, self.counter.as_ref());
            log.append(ConversationItem::FunctionCallOutput {
                call_id,
                content: "denied by user".to_string(),
                success: crate::model::OutputSuccess::False,
            });
        }

        if state.pending_approvals.is_empty() {
            state.phase = Phase::AwaitingLlm;
            self.drive(state).await
        } else {
            Ok(())
        }
    }

    async fn on_escalation_response(
        &self,
        state: &mut SessionState,
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
    ) -> CoreResult<()> {
        if !matches!(state.phase, Phase::AwaitingEscalation) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::AwaitingEscalation]));
        }
        let known: std::collections::HashSet<_> =
            state.pending_escalations.iter().map(|p| p.call_id.clone()).collect();
        if approved_call_ids.iter().chain(denied_call_ids.iter()).any(|id| !known.contains(id)) {
            return Err(CoreError::InvalidIdSet(
                "escalation response references a call_id not in the pending set".to_string(),
            ));
        }

        let approved_set: std::collections::HashSet<String> = approved_call_ids.into_iter().collect();
        let mut to_rerun = Vec::new();
        let mut denied = Vec::new();
        state.pending_escalations.retain(|pending| {
            if approved_set.contains(&pending.call_id) {
                to_rerun.push(pending.clone());
            } else {
                denied.push(pending.clone());
            }
            false // either way the pending entry is resolved and removed
        });
        let _ = denied_call_ids;

        if !to_rerun.is_empty() {
            for pending in &to_rerun {
                state.tools_in_flight.insert(pending.tool_name.clone());
            }
            let cwd = state.config.cwd.clone();
            let sandbox_policy = crate::ports::SandboxPolicyRef::from_config(&state.config);
            let env_policy = crate::ports::EnvPolicyRef::from_config(&state.config);
            let invocations: Vec<_> = to_rerun
                .iter()
                .map(|pending| crate::ports::ToolInvocation {
                    mcp_target: crate::ports::McpToolTarget::parse(&pending.tool_name),
                    call_id: pending.call_id.clone(),
                    name: pending.tool_name.clone(),
                    arguments_json: pending.arguments_json.clone(),
                    cwd: cwd.clone(),
                    // escalation approval means "run it again without the
                    // sandbox" (spec.md §4.2).
                    sandboxed: false,
                    sandbox_policy: sandbox_policy.clone(),
                    env_policy: env_policy.clone(),
                })
                .collect();
            let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools));
            let outcomes = dispatcher.dispatch_all(invocations).await;
            state.tools_in_flight.clear();
            for outcome in outcomes {
                let mut log = HistoryLog::new(state, self.counter.as_ref());
                log.append(ConversationItem::FunctionCallOutput {
                    call_id: outcome.call_id,
                    content: outcome.content,
                    success: crate::model::OutputSuccess::from_bool(outcome.success),
                });
            }
        }
        // A denied escalation's `FunctionCallOutput` was deliberately not
        // appended when the sandboxed attempt first failed (turn.rs
        // `handle_tool_calls`), so the call/output pairing invariant would
        // otherwise see it as still open; append it now using the recorded
        // failure reason.
        for pending in denied {
            let mut log = HistoryLog::new(state, self.counter.as_ref());
            log.append(ConversationItem::FunctionCallOutput {
                call_id: pending.call_id,
                content: pending.failure_reason,
                success: crate::model::OutputSuccess::False,
            });
        }

        if state.pending_escalations.is_empty() {
            state.phase = Phase::AwaitingLlm;
            self.drive(state).await
        } else {
            Ok(())
        }
    }

    /// spec.md §5 "Cancellation" / P3 / P7: every `FunctionCall` still open
    /// when the turn is interrupted (dispatched-but-unresolved, or staged as
    /// a pending approval/escalation that never got a dispatch) gets a
    /// synthetic denied `FunctionCallOutput` before `TurnComplete{interrupted}`
    /// is appended, so the call/output closure invariant holds across an
    /// interrupt exactly as it does across a normal completion.
    fn on_interrupt(&self, state: &mut SessionState) -> CoreResult<()> {
        if state.current_turn_id.is_none() {
            return Ok(());
        }

        let report = crate::state::validate_history_invariants(&state.log);
        for call_id in report.missing_outputs {
            let mut log = HistoryLog::new(state, self.counter.as_ref());
            log.append(ConversationItem::FunctionCallOutput {
                call_id,
                content: "interrupted".to_string(),
                success: crate::model::OutputSuccess::False,
            });
        }

        state.pending_approvals.clear();
        state.pending_escalations.clear();
        state.tools_in_flight.clear();

        if let Some(turn_id) = state.current_turn_id.take() {
            state.push(ConversationItem::TurnComplete {
                turn_id,
                reason: crate::model::TurnEndReason::Interrupted,
            });
            state.totals.turn_count += 1;
        }
        state.phase = Phase::Idle;
        Ok(())
    }

    fn on_shutdown(&self, state: &mut SessionState) -> CoreResult<()> {
        state.phase = Phase::Shutdown;
        Ok(())
    }

    /// spec.md §4.6 `compact{}`: only accepted while idle, runs C8 once and
    /// returns to `waiting_for_input`. Unlike the automatic trigger inside
    /// `TurnEngine::step`, a caller explicitly asking to compact with
    /// nothing worth compacting is not an error — it's a no-op.
    async fn on_compact(&self, state: &mut SessionState) -> CoreResult<()> {
        if !matches!(state.phase, Phase::Idle) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::Idle]));
        }
        state.phase = Phase::Compacting;
        let compactor = Compactor::new(self.runtime.clone());
        if let Err(err) = compactor.compact(state, self.counter.as_ref()).await {
            state.last_error = Some(err.to_string());
        }
        state.phase = Phase::Idle;
        Ok(())
    }

    /// spec.md §4.6 `update_model{provider, model}`: only accepted while
    /// idle; takes effect on the next LLM call the Turn Engine issues.
    fn on_update_model(&self, state: &mut SessionState, provider: String, model: String) -> CoreResult<()> {
        if !matches!(state.phase, Phase::Idle) {
            return Err(CoreError::conflicting_phase(state.phase, [Phase::Idle]));
        }
        state.config.model.provider = provider;
        state.config.model.model = model;
        Ok(())
    }

    /// Drive `TurnEngine::step` in a loop until the turn lands on a phase
    /// that requires another event (approval, escalation, completion) or
    /// hands off to compaction (spec.md §4.4/§4.8).
    async fn drive(&self, state: &mut SessionState) -> CoreResult<()> {
        // spec.md §4.4 step 7: one compaction retry is attempted in-line; if
        // the *same iteration* still overflows afterward, the turn can't be
        // brought under budget by summarization alone and we fall through to
        // a continuation instead of retrying forever.
        let mut compaction_attempts = 0u32;
        loop {
            let turn_id = state
                .current_turn_id
                .clone()
                .ok_or_else(|| CoreError::Fatal("drive called with no active turn".to_string()))?;

            let dispatcher = ToolDispatcher::new(Arc::clone(&self.tools));
            let engine = TurnEngine::new(Arc::clone(&self.chat), &dispatcher, Arc::clone(&self.runtime));

            match engine.step(state, &turn_id, self.counter.as_ref()).await {
                Ok(TurnOutcome::Completed(_)) => {
                    state.phase = Phase::Idle;
                    return Ok(());
                }
                Ok(TurnOutcome::AwaitingApproval) => {
                    state.phase = Phase::AwaitingApproval;
                    return Ok(());
                }
                Ok(TurnOutcome::AwaitingEscalation) => {
                    state.phase = Phase::AwaitingEscalation;
                    return Ok(());
                }
                Ok(TurnOutcome::ContinueTurn) => continue,
                Ok(TurnOutcome::ContextOverflow) => {
                    if compaction_attempts >= 1 {
                        return self.request_continuation(state).await;
                    }
                    state.phase = Phase::Compacting;
                    let compactor = Compactor::new(self.runtime.clone());
                    match compactor.compact(state, self.counter.as_ref()).await {
                        Ok(()) => {
                            compaction_attempts += 1;
                            state.phase = Phase::AwaitingLlm;
                            continue;
                        }
                        Err(_) => return self.request_continuation(state).await,
                    }
                }
                Err(CoreError::Transient(_)) => {
                    // Backoff already applied inside the engine; retry the
                    // same round.
                    continue;
                }
                Err(CoreError::RateLimited { .. }) => {
                    continue;
                }
                Err(err @ CoreError::Fatal(_)) => {
                    state.phase = Phase::Error;
                    state.last_error = Some(err.to_string());
                    return Err(err);
                }
                Err(err) => {
                    state.phase = Phase::Error;
                    state.last_error = Some(err.to_string());
                    return Err(err);
                }
            }
        }
    }

    /// spec.md §4.4 step 7 / §6 "Persisted state layout": package a
    /// condensed handoff and end this execution via the runtime port's
    /// `continue_as_new`. A successful return from the port means a
    /// replacement execution now owns the session, so we mark this one
    /// `Shutdown` rather than `Error` — the conversation continues, just not
    /// in this execution.
    async fn request_continuation(&self, state: &mut SessionState) -> CoreResult<()> {
        let tail_start = state.log.len().saturating_sub(CONTINUATION_TAIL_LEN);
        let recent_items_tail = state.log[tail_start..].iter().map(|e| e.item.clone()).collect();
        let handoff = crate::config::ContinuationHandoff {
            last_summary: state.last_summary.clone(),
            recent_items_tail,
            totals: state.totals.clone(),
            config: state.config.clone(),
            model: state.config.model.clone(),
        };
        self.runtime.continue_as_new(handoff).await?;
        state.phase = Phase::Shutdown;
        Ok(())
    }
}

/// Entries carried verbatim across a continuation boundary, in addition to
/// `last_summary` (spec.md §6 "recent_items_tail[N]").
const CONTINUATION_TAIL_LEN: usize = 20;
