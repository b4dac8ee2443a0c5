use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hooks::HookPhase;
use super::{
    BusinessRuleValidator, OperationKind, RepoId, RepoStateMachine, RepoStatus, StateError,
    StateTransition, TransitionHistory, TransitionHooks,
};
use crate::events::{Event, EventEmitter};

#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub repo_id: RepoId,
    pub reason: Option<String>,
    pub request_id: String,
}

impl TransitionContext {
    pub fn new(repo_id: RepoId) -> Self {
        Self {
            repo_id,
            reason: None,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub success: bool,
    pub from: RepoStatus,
    pub to: RepoStatus,
    pub reason: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "durationMs", serialize_with = "duration_millis")]
    pub duration: Duration,
}

fn duration_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A transition that did not happen. `result` is what was recorded.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TransitionRejected {
    pub result: TransitionResult,
    #[source]
    pub error: StateError,
}

/// Default human-readable reason for a transition.
pub fn transition_reason(from: RepoStatus, to: RepoStatus, operation: Option<OperationKind>) -> String {
    match (to, operation) {
        (RepoStatus::Idle, Some(kind)) => format!("{} operation finished", kind),
        (RepoStatus::Idle, None) if from == RepoStatus::Mounted => "repository unmounted".to_string(),
        (RepoStatus::Idle, None) if from == RepoStatus::Error => "recovered from error".to_string(),
        (RepoStatus::Error, Some(kind)) => format!("{} operation failed", kind),
        (RepoStatus::Mounted, _) => "repository mounted".to_string(),
        (_, Some(kind)) => format!("starting {} operation", kind),
        _ => format!("transition from {} to {}", from, to),
    }
}

/// Validates and applies transitions: table check, business rules,
/// pre-hooks, state update, post-hooks, then one `RepoStateChanged` event.
pub struct TransitionExecutor {
    machine: Arc<RepoStateMachine>,
    validator: Arc<BusinessRuleValidator>,
    hooks: Arc<TransitionHooks>,
    history: TransitionHistory,
    emitter: Arc<dyn EventEmitter>,
}

impl TransitionExecutor {
    pub fn new(
        machine: Arc<RepoStateMachine>,
        history: TransitionHistory,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self::with_parts(
            machine,
            Arc::new(BusinessRuleValidator::new()),
            Arc::new(TransitionHooks::new()),
            history,
            emitter,
        )
    }

    pub fn with_parts(
        machine: Arc<RepoStateMachine>,
        validator: Arc<BusinessRuleValidator>,
        hooks: Arc<TransitionHooks>,
        history: TransitionHistory,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            machine,
            validator,
            hooks,
            history,
            emitter,
        }
    }

    pub fn machine(&self) -> &Arc<RepoStateMachine> {
        &self.machine
    }

    pub fn validator(&self) -> &Arc<BusinessRuleValidator> {
        &self.validator
    }

    pub fn hooks(&self) -> &Arc<TransitionHooks> {
        &self.hooks
    }

    pub fn history(&self) -> &TransitionHistory {
        &self.history
    }

    pub fn execute_transition(
        &self,
        ctx: &TransitionContext,
        from: RepoStatus,
        to: RepoStatus,
    ) -> Result<TransitionResult, TransitionRejected> {
        let started = Instant::now();
        let timestamp = Utc::now();
        let reason = resolve_reason(ctx, from, to);

        let checked = self
            .machine
            .validate_transition(ctx.repo_id, from, to, &reason)
            .and_then(|()| self.validator.validate(ctx, from, to));
        if let Err(error) = checked {
            return Err(self.reject(ctx, from, to, reason, timestamp, started, error));
        }

        let transition = StateTransition {
            repo_id: ctx.repo_id,
            from,
            to,
            reason: reason.clone(),
            timestamp,
            success: true,
            error: None,
        };

        for hook in self.hooks.hooks_for(HookPhase::Pre, to) {
            if let Err(e) = hook(&transition) {
                let error = StateError::PreHook(e.to_string());
                return Err(self.reject(ctx, from, to, reason, timestamp, started, error));
            }
        }

        self.machine.set_current_state(ctx.repo_id, to);
        self.history.record(transition.clone());
        debug!(
            repo_id = ctx.repo_id,
            request_id = %ctx.request_id,
            from = %from,
            to = %to,
            reason = %reason,
            "Repository state changed"
        );

        self.run_post_hooks(&transition);
        self.emitter.emit(Event::RepoStateChanged {
            repo_id: ctx.repo_id,
        });

        Ok(TransitionResult {
            success: true,
            from,
            to,
            reason,
            error: None,
            timestamp,
            duration: started.elapsed(),
        })
    }

    /// Applies `from -> to` without any validation. Post-hooks and the
    /// change event still fire.
    pub fn force_transition(
        &self,
        ctx: &TransitionContext,
        from: RepoStatus,
        to: RepoStatus,
    ) -> TransitionResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        let reason = format!("FORCED: {}", resolve_reason(ctx, from, to));

        let transition = StateTransition {
            repo_id: ctx.repo_id,
            from,
            to,
            reason: reason.clone(),
            timestamp,
            success: true,
            error: None,
        };

        self.machine.set_current_state(ctx.repo_id, to);
        self.history.record(transition.clone());
        info!(
            repo_id = ctx.repo_id,
            from = %from,
            to = %to,
            reason = %reason,
            "Forced repository state change"
        );

        self.run_post_hooks(&transition);
        self.emitter.emit(Event::RepoStateChanged {
            repo_id: ctx.repo_id,
        });

        TransitionResult {
            success: true,
            from,
            to,
            reason,
            error: None,
            timestamp,
            duration: started.elapsed(),
        }
    }

    fn run_post_hooks(&self, transition: &StateTransition) {
        for hook in self.hooks.hooks_for(HookPhase::Post, transition.to) {
            if let Err(e) = hook(transition) {
                warn!(
                    repo_id = transition.repo_id,
                    to = %transition.to,
                    "Post-transition hook failed: {}", e
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        ctx: &TransitionContext,
        from: RepoStatus,
        to: RepoStatus,
        reason: String,
        timestamp: DateTime<Utc>,
        started: Instant,
        error: StateError,
    ) -> TransitionRejected {
        debug!(
            repo_id = ctx.repo_id,
            request_id = %ctx.request_id,
            from = %from,
            to = %to,
            "Transition rejected: {}", error
        );
        self.history.record(StateTransition {
            repo_id: ctx.repo_id,
            from,
            to,
            reason: reason.clone(),
            timestamp,
            success: false,
            error: Some(error.to_string()),
        });
        TransitionRejected {
            result: TransitionResult {
                success: false,
                from,
                to,
                reason,
                error: Some(error.to_string()),
                timestamp,
                duration: started.elapsed(),
            },
            error,
        }
    }
}

fn resolve_reason(ctx: &TransitionContext, from: RepoStatus, to: RepoStatus) -> String {
    match ctx.reason.as_deref().map(str::trim) {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => transition_reason(from, to, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEmitter;
    use crate::state::rules::NO_CONCURRENT_OPERATIONS;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn executor() -> (TransitionExecutor, RecordingEmitter) {
        let emitter = RecordingEmitter::new();
        let executor = TransitionExecutor::new(
            Arc::new(RepoStateMachine::new()),
            TransitionHistory::new(100),
            Arc::new(emitter.clone()),
        );
        (executor, emitter)
    }

    fn state_changes(emitter: &RecordingEmitter) -> usize {
        emitter.count(|e| matches!(e, Event::RepoStateChanged { .. }))
    }

    #[test]
    fn successful_transition_updates_state_and_emits_once() {
        let (executor, emitter) = executor();
        let ctx = TransitionContext::new(1).with_reason("scheduled backup");

        let result = executor
            .execute_transition(&ctx, RepoStatus::Idle, RepoStatus::BackingUp)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.reason, "scheduled backup");
        assert_eq!(executor.machine().current_state(1), RepoStatus::BackingUp);
        assert_eq!(state_changes(&emitter), 1);
        assert_eq!(executor.history().for_repo(1, None).len(), 1);
    }

    #[test]
    fn missing_reason_falls_back_to_generated_one() {
        let (executor, _) = executor();
        let result = executor
            .execute_transition(&TransitionContext::new(1), RepoStatus::Idle, RepoStatus::Mounted)
            .unwrap();
        assert_eq!(result.reason, "repository mounted");
    }

    #[test]
    fn rejected_transition_leaves_state_and_emits_nothing() {
        let (executor, emitter) = executor();
        executor.machine().set_current_state(1, RepoStatus::Error);
        let ctx = TransitionContext::new(1).with_reason("retry");

        let rejected = executor
            .execute_transition(&ctx, RepoStatus::Error, RepoStatus::BackingUp)
            .unwrap_err();

        assert!(!rejected.result.success);
        assert!(rejected.result.error.is_some());
        assert_eq!(executor.machine().current_state(1), RepoStatus::Error);
        assert_eq!(state_changes(&emitter), 0);
        assert_eq!(executor.history().stats().failed, 1);
    }

    #[test]
    fn business_rules_run_after_the_table() {
        let (executor, _) = executor();
        executor.validator().add_rule(
            "block_pruning",
            Arc::new(|_, _, to| {
                if to == RepoStatus::Pruning {
                    Err("maintenance window".into())
                } else {
                    Ok(())
                }
            }),
        );
        let ctx = TransitionContext::new(1).with_reason("prune");
        let rejected = executor
            .execute_transition(&ctx, RepoStatus::Idle, RepoStatus::Pruning)
            .unwrap_err();
        assert_eq!(
            rejected.error.to_string(),
            "business rule 'block_pruning' failed: maintenance window"
        );
        assert!(executor.validator().rule_names().contains(&NO_CONCURRENT_OPERATIONS.to_string()));
    }

    #[test]
    fn failing_pre_hook_aborts() {
        let (executor, emitter) = executor();
        executor.hooks().add_pre_hook(
            RepoStatus::Deleting,
            Arc::new(|_| Err(anyhow::anyhow!("refusing delete"))),
        );
        let ctx = TransitionContext::new(1).with_reason("delete repository");

        let rejected = executor
            .execute_transition(&ctx, RepoStatus::Idle, RepoStatus::Deleting)
            .unwrap_err();

        assert_eq!(rejected.error, StateError::PreHook("refusing delete".into()));
        assert_eq!(executor.machine().current_state(1), RepoStatus::Idle);
        assert_eq!(state_changes(&emitter), 0);
    }

    #[test]
    fn failing_post_hook_does_not_roll_back() {
        let (executor, emitter) = executor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_hook = seen.clone();
        executor.hooks().add_post_hook(
            RepoStatus::Mounted,
            Arc::new(move |t| {
                seen_in_hook.lock().push(t.to);
                Err(anyhow::anyhow!("hook broke"))
            }),
        );
        let ctx = TransitionContext::new(1).with_reason("browse archives");

        let result = executor
            .execute_transition(&ctx, RepoStatus::Idle, RepoStatus::Mounted)
            .unwrap();

        assert!(result.success);
        assert_eq!(*seen.lock(), vec![RepoStatus::Mounted]);
        assert_eq!(executor.machine().current_state(1), RepoStatus::Mounted);
        assert_eq!(state_changes(&emitter), 1);
    }

    #[test]
    fn forced_transition_skips_validation_and_prefixes_reason() {
        let (executor, emitter) = executor();
        let post_ran = Arc::new(Mutex::new(false));
        let flag = post_ran.clone();
        executor
            .hooks()
            .add_post_hook(RepoStatus::Pruning, Arc::new(move |_| {
                *flag.lock() = true;
                Ok(())
            }));
        executor.machine().set_current_state(1, RepoStatus::Error);
        let ctx = TransitionContext::new(1).with_reason("operator override");

        let result = executor.force_transition(&ctx, RepoStatus::Error, RepoStatus::Pruning);

        assert_eq!(result.reason, "FORCED: operator override");
        assert_eq!(executor.machine().current_state(1), RepoStatus::Pruning);
        assert!(*post_ran.lock());
        assert_eq!(state_changes(&emitter), 1);
    }

    proptest! {
        #[test]
        fn force_transition_always_emits(
            from in prop::sample::select(RepoStatus::ALL.to_vec()),
            to in prop::sample::select(RepoStatus::ALL.to_vec()),
        ) {
            let (executor, emitter) = executor();
            let ctx = TransitionContext::new(9).with_reason("forced");
            let result = executor.force_transition(&ctx, from, to);
            prop_assert!(result.success);
            prop_assert_eq!(executor.machine().current_state(9), to);
            prop_assert_eq!(state_changes(&emitter), 1);
        }

        #[test]
        fn allowed_pairs_succeed(
            from in prop::sample::select(RepoStatus::ALL.to_vec()),
            to in prop::sample::select(RepoStatus::ALL.to_vec()),
        ) {
            let (executor, _) = executor();
            let ctx = TransitionContext::new(5).with_reason("property");
            let (table_ok, _) = executor.machine().can_transition(from, to);
            let rules_ok = executor.validator().validate(&ctx, from, to).is_ok();
            executor.machine().set_current_state(5, from);

            let outcome = executor.execute_transition(&ctx, from, to);
            prop_assert_eq!(outcome.is_ok(), table_ok && rules_ok);
            let expected = if table_ok && rules_ok { to } else { from };
            prop_assert_eq!(executor.machine().current_state(5), expected);
        }
    }
}
