//! C6 — Update Handlers: the signal/query surface a workflow host exposes
//! for this session (spec.md §4.6). `SessionHandle` owns the
//! `SessionState` and `Controller`, and wakes any outstanding
//! `get_state_update` long-poll after every mutating call — this crate's
//! equivalent of the teacher's `event_sink`/`thread_event_sink` notification
//! fan-out in `AgentSessionController`, narrowed to a single `Notify` since
//! there is exactly one logical watcher per cursor value rather than a
//! broadcast stream of UI events.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::{EndReason, SessionConfiguration, WorkflowInput, WorkflowResult};
use crate::controller::{Controller, Event};
use crate::error::CoreResult;
use crate::model::LogEntry;
use crate::ports::{ChatPort, ToolRegistry, WorkflowRuntime};
use crate::projection::{Cursor, StateProjection, StateUpdate, TurnStatus};
use crate::state::{Phase, SessionState};

/// How long `get_state_update` waits for a fresh cursor before resolving
/// anyway with the unchanged cursor (spec.md §4.6 "a configured keepalive
/// interval elapses"), so a long-polling caller's connection doesn't sit
/// open forever across an idle session.
pub const DEFAULT_KEEPALIVE_MS: u64 = 30_000;

pub struct SessionHandle {
    state: SessionState,
    controller: Controller,
    runtime: Arc<dyn WorkflowRuntime>,
    update_notify: Arc<Notify>,
    keepalive_ms: u64,
}

impl SessionHandle {
    pub fn new(
        conversation_id: String,
        mut config: SessionConfiguration,
        chat: Arc<dyn ChatPort>,
        tools: Arc<dyn ToolRegistry>,
        runtime: Arc<dyn WorkflowRuntime>,
        counter: Box<dyn crate::history::TokenCounter>,
    ) -> Self {
        config.normalize();
        Self {
            state: SessionState::new(conversation_id, config),
            controller: Controller::new(chat, tools, Arc::clone(&runtime), counter),
            runtime,
            update_notify: Arc::new(Notify::new()),
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
        }
    }

    /// Rehydrate a handle from a persisted `SessionState` (workflow replay
    /// or a `continue_as_new` handoff), per spec.md §7.
    pub fn from_state(
        state: SessionState,
        chat: Arc<dyn ChatPort>,
        tools: Arc<dyn ToolRegistry>,
        runtime: Arc<dyn WorkflowRuntime>,
        counter: Box<dyn crate::history::TokenCounter>,
    ) -> Self {
        Self {
            state,
            controller: Controller::new(chat, tools, Arc::clone(&runtime), counter),
            runtime,
            update_notify: Arc::new(Notify::new()),
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
        }
    }

    pub fn with_keepalive_ms(mut self, keepalive_ms: u64) -> Self {
        self.keepalive_ms = keepalive_ms;
        self
    }

    /// Start a fresh session from a workflow's start input (spec.md §6),
    /// seeding the first turn from `user_message` when the caller supplied
    /// one rather than waiting for a separate `submit_user_message` call.
    pub async fn start(
        input: WorkflowInput,
        chat: Arc<dyn ChatPort>,
        tools: Arc<dyn ToolRegistry>,
        runtime: Arc<dyn WorkflowRuntime>,
        counter: Box<dyn crate::history::TokenCounter>,
    ) -> CoreResult<Self> {
        let mut handle = Self::new(input.conversation_id, input.config, chat, tools, runtime, counter);
        if let Some(text) = input.user_message {
            handle.submit_user_message(text).await?;
        }
        Ok(handle)
    }

    /// Build the terminal payload a workflow host reads back on completion
    /// (spec.md §6). `tool_calls_executed` flattens the session's per-tool
    /// call counts into one entry per call, tool names sorted for
    /// determinism.
    pub fn workflow_result(&self) -> WorkflowResult {
        let totals = &self.state.totals;
        let mut tool_names: Vec<&String> = totals.tool_calls_executed.keys().collect();
        tool_names.sort();
        let mut tool_calls_executed = Vec::new();
        for name in tool_names {
            let count = totals.tool_calls_executed[name];
            tool_calls_executed.extend(std::iter::repeat(name.clone()).take(count as usize));
        }

        let end_reason = match self.state.phase {
            Phase::Shutdown => EndReason::Shutdown,
            Phase::Error => EndReason::Error,
            _ => EndReason::Completed,
        };

        WorkflowResult {
            conversation_id: self.state.conversation_id.clone(),
            total_tokens: totals.total_tokens(),
            total_cached_tokens: totals.cached_tokens,
            total_iterations: totals.iterations,
            tool_calls_executed,
            end_reason,
        }
    }

    async fn apply(&mut self, event: Event) -> CoreResult<()> {
        let result = self.controller.handle(&mut self.state, event).await;
        self.update_notify.notify_waiters();
        result
    }

    pub async fn submit_user_message(&mut self, text: String) -> CoreResult<()> {
        self.apply(Event::UserMessage { text }).await
    }

    /// spec.md §4.6 `approval_response{approved[], denied[]}`. `approved`
    /// and `denied` must partition the pending set (P4); any id the caller
    /// omits from both lists still counts as denied (§4.2). `auto_approve`
    /// corresponds to a user "always allow" response: it's remembered for
    /// the rest of the session per `(tool_name, reason)` pair.
    pub async fn submit_approval_response(
        &mut self,
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
        auto_approve_session: bool,
    ) -> CoreResult<()> {
        self.apply(Event::ApprovalResponse {
            approved_call_ids,
            denied_call_ids,
            auto_approve_session,
        })
        .await
    }

    /// spec.md §4.6 `escalation_response{approved[], denied[]}`, staged only
    /// after a sandboxed tool call fails under `on-failure` policy (§4.2).
    pub async fn submit_escalation_response(
        &mut self,
        approved_call_ids: Vec<String>,
        denied_call_ids: Vec<String>,
    ) -> CoreResult<()> {
        self.apply(Event::EscalationResponse { approved_call_ids, denied_call_ids }).await
    }

    pub async fn interrupt(&mut self) -> CoreResult<()> {
        self.apply(Event::Interrupt).await
    }

    pub async fn shutdown(&mut self) -> CoreResult<()> {
        self.apply(Event::Shutdown).await
    }

    /// spec.md §4.6 `compact{}`.
    pub async fn compact(&mut self) -> CoreResult<()> {
        self.apply(Event::Compact).await
    }

    /// spec.md §4.6 `update_model{provider, model}`.
    pub async fn update_model(&mut self, provider: String, model: String) -> CoreResult<()> {
        self.apply(Event::UpdateModel { provider, model }).await
    }

    pub fn get_conversation_items(&self, since_seq: u64) -> Vec<LogEntry> {
        StateProjection::new(&self.state)
            .conversation_items_since(since_seq)
            .to_vec()
    }

    pub fn get_turn_status(&self) -> TurnStatus {
        StateProjection::new(&self.state).turn_status()
    }

    pub fn get_totals(&self) -> crate::model::Totals {
        StateProjection::new(&self.state).totals().clone()
    }

    pub fn cursor(&self) -> Cursor {
        StateProjection::new(&self.state).cursor()
    }

    /// Resolve as soon as the session's `(seq, phase)` cursor differs from
    /// `since`, or `keepalive_ms` elapses, per spec.md §4.6. Resolves
    /// immediately without waiting if the cursor already differs.
    pub async fn get_state_update(&self, since: Cursor) -> StateUpdate {
        if self.cursor() != since {
            return StateProjection::new(&self.state).state_update_since(since);
        }
        let notified = self.update_notify.notified();
        // Re-check after registering interest, guarding the race where a
        // mutation lands between the cursor read above and the
        // `notified()` call.
        if self.cursor() != since {
            return StateProjection::new(&self.state).state_update_since(since);
        }
        tokio::select! {
            _ = notified => {}
            _ = self.runtime.sleep(self.keepalive_ms) => {}
        }
        StateProjection::new(&self.state).state_update_since(since)
    }

    pub fn snapshot_state(&self) -> &SessionState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::ports::{FinishReason, LlmRequest, LlmResponse, ToolCapability, ToolInvocation, ToolOutcome};
    use async_trait::async_trait;

    struct StubChat;

    #[async_trait]
    impl ChatPort for StubChat {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, CoreError> {
            Ok(LlmResponse {
                assistant_text: Some("done".to_string()),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
                usage: Default::default(),
            })
        }
    }

    struct StubTools;

    #[async_trait]
    impl ToolRegistry for StubTools {
        fn capability(&self, _tool_name: &str) -> Option<ToolCapability> {
            Some(ToolCapability { is_trusted_by_default: true })
        }
        async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolOutcome, CoreError> {
            Ok(ToolOutcome { call_id: invocation.call_id, content: "ok".to_string(), success: true })
        }
    }

    struct StubRuntime {
        counter: std::sync::atomic::AtomicU64,
    }

    impl StubRuntime {
        fn new() -> Self {
            Self { counter: std::sync::atomic::AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl WorkflowRuntime for StubRuntime {
        async fn new_id(&self) -> Result<String, CoreError> {
            let id = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(format!("id-{id}"))
        }
        async fn now_tick(&self) -> Result<u64, CoreError> {
            Ok(self.counter.load(std::sync::atomic::Ordering::SeqCst))
        }
        async fn sleep(&self, _duration_ms: u64) -> Result<(), CoreError> {
            Ok(())
        }
        async fn continue_as_new(&self, _handoff: crate::config::ContinuationHandoff) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn handle() -> SessionHandle {
        SessionHandle::new(
            "conv-1".to_string(),
            SessionConfiguration::default(),
            Arc::new(StubChat),
            Arc::new(StubTools),
            Arc::new(StubRuntime::new()),
            Box::new(crate::history::HeuristicTokenCounter),
        )
    }

    #[tokio::test]
    async fn submitting_a_user_message_appends_and_completes_the_turn() {
        let mut h = handle();
        h.submit_user_message("hello".to_string()).await.unwrap();
        let items = h.get_conversation_items(0);
        assert!(items.iter().any(|e| matches!(e.item, crate::model::ConversationItem::UserMessage { .. })));
        assert!(items.iter().any(|e| matches!(e.item, crate::model::ConversationItem::TurnComplete { .. })));
    }

    #[tokio::test]
    async fn get_state_update_resolves_immediately_for_a_stale_cursor() {
        let mut h = handle();
        let before = h.cursor();
        h.submit_user_message("hello".to_string()).await.unwrap();
        let update = h.get_state_update(before).await;
        assert_ne!(update.cursor, before);
        assert!(!update.new_items.is_empty());
    }

    #[tokio::test]
    async fn get_state_update_resolves_on_keepalive_when_nothing_changes() {
        let h = handle().with_keepalive_ms(0);
        let before = h.cursor();
        let update = h.get_state_update(before).await;
        assert_eq!(update.cursor, before);
        assert!(update.new_items.is_empty());
    }

    #[tokio::test]
    async fn start_seeds_the_first_turn_from_the_workflow_input_message() {
        let h = SessionHandle::start(
            crate::config::WorkflowInput {
                conversation_id: "conv-1".to_string(),
                user_message: Some("hello".to_string()),
                config: SessionConfiguration::default(),
            },
            Arc::new(StubChat),
            Arc::new(StubTools),
            Arc::new(StubRuntime::new()),
            Box::new(crate::history::HeuristicTokenCounter),
        )
        .await
        .unwrap();
        let items = h.get_conversation_items(0);
        assert!(items.iter().any(|e| matches!(e.item, crate::model::ConversationItem::UserMessage { text } if text == "hello")));
        assert!(items.iter().any(|e| matches!(e.item, crate::model::ConversationItem::TurnComplete { .. })));
    }

    #[tokio::test]
    async fn start_with_no_message_leaves_the_session_idle() {
        let h = SessionHandle::start(
            crate::config::WorkflowInput {
                conversation_id: "conv-1".to_string(),
                user_message: None,
                config: SessionConfiguration::default(),
            },
            Arc::new(StubChat),
            Arc::new(StubTools),
            Arc::new(StubRuntime::new()),
            Box::new(crate::history::HeuristicTokenCounter),
        )
        .await
        .unwrap();
        assert!(h.get_conversation_items(0).is_empty());
    }

    #[tokio::test]
    async fn workflow_result_reports_totals_and_end_reason() {
        let mut h = handle();
        h.submit_user_message("hello".to_string()).await.unwrap();
        let result = h.workflow_result();
        assert_eq!(result.conversation_id, "conv-1");
        assert_eq!(result.end_reason, crate::config::EndReason::Completed);
        assert!(result.tool_calls_executed.is_empty());
    }
}
