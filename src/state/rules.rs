use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{RepoStatus, StateError, TransitionContext};

/// A named runtime predicate over a proposed transition. `Err` carries the
/// human-readable refusal.
pub type BusinessRule =
    Arc<dyn Fn(&TransitionContext, RepoStatus, RepoStatus) -> Result<(), String> + Send + Sync>;

pub const NO_CONCURRENT_OPERATIONS: &str = "no_concurrent_operations";
pub const UNMOUNT_BEFORE_OPERATIONS: &str = "unmount_before_operations";
pub const ERROR_STATE_RECOVERY: &str = "error_state_recovery";

/// Rules are evaluated in name order; the first failure wins.
pub struct BusinessRuleValidator {
    rules: RwLock<BTreeMap<String, BusinessRule>>,
}

impl BusinessRuleValidator {
    /// Validator preloaded with the three default rules.
    pub fn new() -> Self {
        let validator = Self::empty();
        validator.add_rule(NO_CONCURRENT_OPERATIONS, Arc::new(no_concurrent_operations));
        validator.add_rule(UNMOUNT_BEFORE_OPERATIONS, Arc::new(unmount_before_operations));
        validator.add_rule(ERROR_STATE_RECOVERY, Arc::new(error_state_recovery));
        validator
    }

    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds or replaces the rule registered under `name`.
    pub fn add_rule(&self, name: impl Into<String>, rule: BusinessRule) {
        self.rules.write().insert(name.into(), rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.write().remove(name).is_some()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().keys().cloned().collect()
    }

    pub fn validate(
        &self,
        ctx: &TransitionContext,
        from: RepoStatus,
        to: RepoStatus,
    ) -> Result<(), StateError> {
        // Snapshot so a rule can never deadlock against add_rule
        let rules: Vec<(String, BusinessRule)> = self
            .rules
            .read()
            .iter()
            .map(|(name, rule)| (name.clone(), rule.clone()))
            .collect();

        for (name, rule) in rules {
            if let Err(message) = rule(ctx, from, to) {
                return Err(StateError::BusinessRule {
                    rule: name,
                    message,
                });
            }
        }
        Ok(())
    }
}

impl Default for BusinessRuleValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn no_concurrent_operations(
    _ctx: &TransitionContext,
    from: RepoStatus,
    to: RepoStatus,
) -> Result<(), String> {
    if from.is_busy() && to.is_busy() && from != to {
        return Err(format!(
            "cannot start {} while {} is in progress",
            to, from
        ));
    }
    Ok(())
}

fn unmount_before_operations(
    _ctx: &TransitionContext,
    from: RepoStatus,
    to: RepoStatus,
) -> Result<(), String> {
    if from == RepoStatus::Mounted
        && matches!(
            to,
            RepoStatus::BackingUp | RepoStatus::Pruning | RepoStatus::Deleting
        )
    {
        return Err(format!("repository must be unmounted before {}", to));
    }
    Ok(())
}

fn error_state_recovery(
    _ctx: &TransitionContext,
    from: RepoStatus,
    to: RepoStatus,
) -> Result<(), String> {
    if from == RepoStatus::Error && to != RepoStatus::Idle {
        return Err("repository in error state can only transition to idle".to_string());
    }
    Ok(())
}
