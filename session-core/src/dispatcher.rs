//! Tool Dispatcher: runs approved tool calls with bounded concurrency,
//! appends outputs in call order, and truncates oversized output.
//!
//! The concurrency shape is a fixed-size semaphore gating a join-set of
//! activity futures, fanning out N tool calls bounded by a concurrency cap.
//! The truncation/rebalancing algorithm donates unused byte budget from
//! short outputs to long ones rather than truncating every output to a flat
//! per-call share.
//!
//! spec.md §4.3 steps 2-3 (MCP-target parsing, sandbox/env policy refs) are
//! attached to each `ToolInvocation` by its caller (`TurnEngine`/
//! `Controller`) before it ever reaches `dispatch_all` — the dispatcher
//! itself only fans the already-fully-addressed invocation out to the
//! registry and collects the result, it does not need to interpret those
//! fields itself.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{CoreError, ToolErrorKind};
use crate::ports::{ToolInvocation, ToolOutcome, ToolRegistry};

/// Maximum combined bytes across all tool outputs returned for one batch of
/// calls dispatched in the same LLM round (spec.md §4.3 "default 1 MiB
/// aggregate").
pub const DEFAULT_OUTPUT_BYTE_BUDGET: usize = 1024 * 1024;

/// Maximum number of tool calls dispatched concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub struct ToolDispatcher {
    tools: Arc<dyn ToolRegistry>,
    max_concurrency: usize,
    output_byte_budget: usize,
}

impl ToolDispatcher {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            tools,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            output_byte_budget: DEFAULT_OUTPUT_BYTE_BUDGET,
        }
    }

    pub fn with_limits(mut self, max_concurrency: usize, output_byte_budget: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.output_byte_budget = output_byte_budget;
        self
    }

    /// Look up a tool's static capability ahead of dispatch, used by the
    /// approval gate to classify whether a call needs approval.
    pub fn capability(&self, tool_name: &str) -> Option<crate::ports::ToolCapability> {
        self.tools.capability(tool_name)
    }

    /// Run every invocation, bounded by `max_concurrency`, and return
    /// outcomes in the SAME ORDER as `invocations` regardless of completion
    /// order: outputs are appended to history in call order, not completion
    /// order.
    pub async fn dispatch_all(&self, invocations: Vec<ToolInvocation>) -> Vec<ToolOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(invocations.len());

        for invocation in invocations {
            let semaphore = Arc::clone(&semaphore);
            let tools = Arc::clone(&self.tools);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while handles are outstanding");
                run_one(tools.as_ref(), invocation).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => outcomes.push(ToolOutcome {
                    call_id: String::new(),
                    content: format!("tool task panicked: {join_error}"),
                    success: false,
                }),
            }
        }

        rebalance_truncation(outcomes, self.output_byte_budget)
    }
}

async fn run_one(tools: &dyn ToolRegistry, invocation: ToolInvocation) -> ToolOutcome {
    let call_id = invocation.call_id.clone();

    let Some(capability) = tools.capability(&invocation.name) else {
        return ToolOutcome {
            call_id,
            content: tool_error_content(ToolErrorKind::NotFound, "unknown tool"),
            success: false,
        };
    };
    let _ = capability;

    match tools.invoke(invocation).await {
        Ok(outcome) => outcome,
        Err(CoreError::Tool { kind, message }) => ToolOutcome {
            call_id,
            content: tool_error_content(kind, &message),
            success: false,
        },
        Err(other) => ToolOutcome {
            call_id,
            content: format!("tool invocation error: {other}"),
            success: false,
        },
    }
}

fn tool_error_content(kind: ToolErrorKind, message: &str) -> String {
    format!("{kind:?}: {message}")
}

/// Apply the output byte budget across a batch of outcomes, donating unused
/// capacity from short outputs to long ones:
///
/// 1. Split the budget evenly 2/3 to the single largest output and 1/3
///    shared across the rest, when exactly one output dominates the batch.
/// 2. More generally: give every output an equal share of the budget first;
///    any output under its share donates the leftover back into a shared
///    pool, which is then redistributed evenly across the outputs still
///    over budget, repeating until stable or until no donor remains.
fn rebalance_truncation(mut outcomes: Vec<ToolOutcome>, total_budget: usize) -> Vec<ToolOutcome> {
    if outcomes.is_empty() {
        return outcomes;
    }
    let total_len: usize = outcomes.iter().map(|o| o.content.len()).sum();
    if total_len <= total_budget {
        return outcomes;
    }

    let mut remaining_budget = total_budget;
    let mut over_budget_indices: Vec<usize> = (0..outcomes.len()).collect();

    loop {
        if over_budget_indices.is_empty() {
            break;
        }
        let share = remaining_budget / over_budget_indices.len();
        let mut still_over = Vec::new();
        let mut donated = 0usize;

        for &idx in &over_budget_indices {
            let len = outcomes[idx].content.len();
            if len <= share {
                donated += share - len;
            } else {
                still_over.push(idx);
            }
        }

        if still_over.len() == over_budget_indices.len() {
            // Nobody fits within an equal share; truncate each to its share
            // and stop.
            for &idx in &still_over {
                truncate_in_place(&mut outcomes[idx], share);
            }
            break;
        }

        remaining_budget = remaining_budget
            .saturating_sub((over_budget_indices.len() - still_over.len()) * share)
            + donated;
        over_budget_indices = still_over;
    }

    outcomes
}

fn truncate_in_place(outcome: &mut ToolOutcome, budget: usize) {
    if outcome.content.len() <= budget {
        return;
    }
    let marker = "\n...[truncated]...";
    let keep = budget.saturating_sub(marker.len());
    let mut boundary = keep.min(outcome.content.len());
    while boundary > 0 && !outcome.content.is_char_boundary(boundary) {
        boundary -= 1;
    }
    outcome.content.truncate(boundary);
    outcome.content.push_str(marker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::ports::ToolCapability;

    struct EchoRegistry;

    #[async_trait]
    impl ToolRegistry for EchoRegistry {
        fn capability(&self, tool_name: &str) -> Option<ToolCapability> {
            if tool_name == "missing" {
                None
            } else {
                Some(ToolCapability { is_trusted_by_default: true })
            }
        }

        async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolOutcome, CoreError> {
            Ok(ToolOutcome {
                call_id: invocation.call_id,
                content: invocation.arguments_json,
                success: true,
            })
        }
    }

    fn invocation(call_id: &str, payload_len: usize) -> ToolInvocation {
        ToolInvocation {
            call_id: call_id.to_string(),
            name: "echo".to_string(),
            arguments_json: "x".repeat(payload_len),
            cwd: ".".to_string(),
            sandboxed: true,
            mcp_target: None,
            sandbox_policy: crate::ports::SandboxPolicyRef::from_config(&crate::config::SessionConfiguration::default()),
            env_policy: crate::ports::EnvPolicyRef::from_config(&crate::config::SessionConfiguration::default()),
        }
    }

    #[tokio::test]
    async fn preserves_call_order_regardless_of_completion_order() {
        let dispatcher = ToolDispatcher::new(Arc::new(EchoRegistry));
        let outcomes = dispatcher
            .dispatch_all(vec![invocation("a", 1), invocation("b", 1), invocation("c", 1)])
            .await;
        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_tool_reports_not_found_without_invoking() {
        let dispatcher = ToolDispatcher::new(Arc::new(EchoRegistry));
        let outcomes = dispatcher
            .dispatch_all(vec![ToolInvocation {
                call_id: "x".to_string(),
                name: "missing".to_string(),
                arguments_json: "{}".to_string(),
                cwd: ".".to_string(),
                sandboxed: true,
                mcp_target: None,
                sandbox_policy: crate::ports::SandboxPolicyRef::from_config(&crate::config::SessionConfiguration::default()),
                env_policy: crate::ports::EnvPolicyRef::from_config(&crate::config::SessionConfiguration::default()),
            }])
            .await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].content.contains("NotFound"));
    }

    #[tokio::test]
    async fn truncates_when_combined_output_exceeds_budget() {
        let dispatcher = ToolDispatcher::new(Arc::new(EchoRegistry)).with_limits(4, 100);
        let outcomes = dispatcher
            .dispatch_all(vec![invocation("a", 80), invocation("b", 80)])
            .await;
        let total: usize = outcomes.iter().map(|o| o.content.len()).sum();
        assert!(total <= 100 + 2 * "\n...[truncated]...".len());
    }

    #[tokio::test]
    async fn short_output_is_not_truncated_when_another_dominates() {
        let dispatcher = ToolDispatcher::new(Arc::new(EchoRegistry)).with_limits(4, 100);
        let outcomes = dispatcher
            .dispatch_all(vec![invocation("a", 5), invocation("b", 300)])
            .await;
        let short = outcomes.iter().find(|o| o.call_id == "a").unwrap();
        assert_eq!(short.content.len(), 5);
    }
}
