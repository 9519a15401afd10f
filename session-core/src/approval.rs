//! Approval Gate: decides whether a tool call needs a user prompt, and
//! tracks escalation after a sandboxed failure.
//!
//! `ApprovalMode` (config.rs) / `ApprovalDecision` here keep a three-mode
//! shape (`Never` / `UnlessTrusted` / `OnFailure`) with a "skip vs. needs
//! approval vs. forbidden" three-way outcome.

use crate::config::ApprovalMode;
use crate::ports::ToolCapability;
use crate::state::{PendingApproval, PendingEscalation, SessionState};

/// Outcome of classifying one tool call against the session's approval
/// policy, before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Dispatch immediately, no prompt needed.
    Proceed,
    /// Stage a `PendingApproval` and transition to `AwaitingApproval`.
    NeedsApproval { reason: String },
    /// Deny without ever staging a prompt: a tool name the registry could
    /// not resolve can't succeed no matter what a user answers, so it is
    /// short-circuited ahead of the policy mode entirely (spec.md §4.2's
    /// tie-break order: "explicit deny (unknown tool) → mode `never` →
    /// non-mutating/trusted ⇒ AutoAllow → else NeedsUser").
    AutoDeny { reason: String },
}

/// Classify a requested tool call against the configured `ApprovalMode` and
/// the tool's static capability.
///
/// Tie-break order (spec.md §4.2 / SPEC_FULL.md §4.2): an unresolved tool is
/// denied before the approval mode is even consulted — a `never`-mode
/// session proceeding straight to dispatch on a tool the registry can't
/// resolve would just produce a `NotFound` tool error instead of a useful
/// deny, and an `unless-trusted` session would otherwise stage a real
/// approval prompt for a call that can never succeed. Once a tool resolves:
///
/// - `Never`: always proceed.
/// - `UnlessTrusted`: proceed only if the tool is trusted by default, or the
///   user already auto-approved this exact `(tool_name, reason)` pair this
///   session.
/// - `OnFailure`: proceed unconditionally; approval is only requested after
///   a sandboxed attempt actually fails (see `should_escalate_on_failure`
///   below), never ahead of dispatch.
pub fn classify(
    state: &SessionState,
    tool_name: &str,
    resolved: bool,
    capability: Option<ToolCapability>,
) -> ApprovalDecision {
    if !resolved {
        return ApprovalDecision::AutoDeny { reason: "unknown tool".to_string() };
    }

    match state.config.approval_mode {
        ApprovalMode::Never => ApprovalDecision::Proceed,
        ApprovalMode::OnFailure => ApprovalDecision::Proceed,
        ApprovalMode::UnlessTrusted => {
            let trusted = capability.map(|c| c.is_trusted_by_default).unwrap_or(false);
            if trusted {
                return ApprovalDecision::Proceed;
            }
            let reason = "tool is not trusted by default".to_string();
            if state.is_auto_approved(tool_name, &reason) {
                return ApprovalDecision::Proceed;
            }
            ApprovalDecision::NeedsApproval { reason }
        }
    }
}

/// Stage a pending approval, returning the entry to push onto
/// `state.pending_approvals` (callers own the phase transition to
/// `AwaitingApproval`).
pub fn stage_approval(
    call_id: String,
    tool_name: String,
    arguments_json: String,
    reason: String,
) -> PendingApproval {
    PendingApproval {
        call_id,
        tool_name,
        arguments_json,
        reason,
    }
}

/// After a sandboxed tool invocation fails, decide whether `OnFailure`
/// policy calls for an escalation prompt.
/// `UnlessTrusted`/`Never` never escalate on failure: the call already went
/// through the pre-dispatch gate (or was exempted from it), so a runtime
/// failure is just a normal tool error, not a sandbox-policy question.
pub fn should_escalate_on_failure(state: &SessionState) -> bool {
    matches!(state.config.approval_mode, ApprovalMode::OnFailure)
}

pub fn stage_escalation(
    call_id: String,
    tool_name: String,
    arguments_json: String,
    failure_reason: String,
) -> PendingEscalation {
    PendingEscalation {
        call_id,
        tool_name,
        arguments_json,
        failure_reason,
    }
}

/// Resolve a user's approval response: remove the matching entries from
/// `pending_approvals` and, if `auto_approve_session` was set, remember the
/// `(tool_name, reason)` pair so future identical calls skip the prompt.
pub fn resolve_approval(
    state: &mut SessionState,
    approved_call_ids: &[String],
    auto_approve_session: bool,
) -> Vec<PendingApproval> {
    let mut resolved = Vec::new();
    state.pending_approvals.retain(|pending| {
        if approved_call_ids.contains(&pending.call_id) {
            if auto_approve_session {
                state_mark_auto_approved(state, &pending.tool_name, &pending.reason);
            }
            resolved.push(pending.clone());
            false
        } else {
            true
        }
    });
    resolved
}

fn state_mark_auto_approved(state: &mut SessionState, tool_name: &str, reason: &str) {
    state.mark_auto_approved(tool_name, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfiguration;

    fn state_with_mode(mode: ApprovalMode) -> SessionState {
        let mut config = SessionConfiguration::default();
        config.approval_mode = mode;
        SessionState::new("conv-1".to_string(), config)
    }

    #[test]
    fn never_mode_always_proceeds() {
        let state = state_with_mode(ApprovalMode::Never);
        let decision = classify(&state, "shell", true, None);
        assert_eq!(decision, ApprovalDecision::Proceed);
    }

    #[test]
    fn unless_trusted_requires_approval_for_untrusted_tool() {
        let state = state_with_mode(ApprovalMode::UnlessTrusted);
        let decision = classify(&state, "shell", true, Some(ToolCapability { is_trusted_by_default: false }));
        assert!(matches!(decision, ApprovalDecision::NeedsApproval { .. }));
    }

    #[test]
    fn unless_trusted_proceeds_for_trusted_tool() {
        let state = state_with_mode(ApprovalMode::UnlessTrusted);
        let decision = classify(&state, "read_file", true, Some(ToolCapability { is_trusted_by_default: true }));
        assert_eq!(decision, ApprovalDecision::Proceed);
    }

    #[test]
    fn auto_approved_pair_skips_future_prompts() {
        let mut state = state_with_mode(ApprovalMode::UnlessTrusted);
        state.mark_auto_approved("shell", "tool is not trusted by default");
        let decision = classify(&state, "shell", true, Some(ToolCapability { is_trusted_by_default: false }));
        assert_eq!(decision, ApprovalDecision::Proceed);
    }

    #[test]
    fn on_failure_mode_never_prompts_ahead_of_dispatch() {
        let state = state_with_mode(ApprovalMode::OnFailure);
        let decision = classify(&state, "shell", true, Some(ToolCapability { is_trusted_by_default: false }));
        assert_eq!(decision, ApprovalDecision::Proceed);
        assert!(should_escalate_on_failure(&state));
    }

    #[test]
    fn unresolved_tool_is_denied_before_any_mode_is_consulted() {
        for mode in [ApprovalMode::Never, ApprovalMode::UnlessTrusted, ApprovalMode::OnFailure] {
            let state = state_with_mode(mode);
            let decision = classify(&state, "nonexistent_tool", false, None);
            assert_eq!(
                decision,
                ApprovalDecision::AutoDeny { reason: "unknown tool".to_string() },
                "mode {mode:?} must deny an unresolved tool ahead of its own policy"
            );
        }
    }

    #[test]
    fn resolve_approval_removes_matching_entries_and_records_auto_approval() {
        let mut state = state_with_mode(ApprovalMode::UnlessTrusted);
        state.pending_approvals.push(stage_approval(
            "call-1".to_string(),
            "shell".to_string(),
            "{}".to_string(),
            "tool is not trusted by default".to_string(),
        ));
        let resolved = resolve_approval(&mut state, &["call-1".to_string()], true);
        assert_eq!(resolved.len(), 1);
        assert!(state.pending_approvals.is_empty());
        assert!(state.is_auto_approved("shell", "tool is not trusted by default"));
    }
}
