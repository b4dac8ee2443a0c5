//! Repository lifecycle state.
//!
//! Every repository is in exactly one [`RepoStatus`] at a time. Changes go
//! through [`TransitionExecutor`], which checks the transition table in
//! [`RepoStateMachine`] and the named rules in [`BusinessRuleValidator`]
//! before anything is mutated. [`RepositoryStateManager`] wraps that with
//! the per-repository operation bookkeeping used by the runner and the API.

pub mod error;
pub mod executor;
pub mod history;
pub mod hooks;
pub mod machine;
pub mod manager;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::types::RepoId;
pub use error::StateError;
pub use executor::{transition_reason, TransitionContext, TransitionExecutor, TransitionRejected, TransitionResult};
pub use history::{TransitionHistory, TransitionStats};
pub use hooks::{HookId, TransitionHook, TransitionHooks};
pub use machine::RepoStateMachine;
pub use manager::{
    BackupStats, MountInfo, OperationStats, PruneStats, RepoErrorAction, RepoErrorInfo,
    RepoErrorType, RepoSnapshot, RepositoryStateManager,
};
pub use rules::{BusinessRule, BusinessRuleValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepoStatus {
    #[default]
    Idle,
    BackingUp,
    Pruning,
    Deleting,
    Mounted,
    PerformingOperation,
    Error,
}

impl RepoStatus {
    pub const ALL: [RepoStatus; 7] = [
        RepoStatus::Idle,
        RepoStatus::BackingUp,
        RepoStatus::Pruning,
        RepoStatus::Deleting,
        RepoStatus::Mounted,
        RepoStatus::PerformingOperation,
        RepoStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Idle => "idle",
            RepoStatus::BackingUp => "backingUp",
            RepoStatus::Pruning => "pruning",
            RepoStatus::Deleting => "deleting",
            RepoStatus::Mounted => "mounted",
            RepoStatus::PerformingOperation => "performingOperation",
            RepoStatus::Error => "error",
        }
    }

    /// States in which an engine operation is actively running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            RepoStatus::BackingUp
                | RepoStatus::Pruning
                | RepoStatus::Deleting
                | RepoStatus::PerformingOperation
        )
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state change, successful or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub repo_id: RepoId,
    pub from: RepoStatus,
    pub to: RepoStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Prune,
    Delete,
    Mount,
    General,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Prune => "prune",
            OperationKind::Delete => "delete",
            OperationKind::Mount => "mount",
            OperationKind::General => "general",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation currently attached to a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationData {
    pub kind: OperationKind,
    pub start_time: DateTime<Utc>,
    pub options: Option<serde_json::Value>,
}

impl OperationData {
    pub fn new(kind: OperationKind, options: Option<serde_json::Value>) -> Self {
        Self {
            kind,
            start_time: Utc::now(),
            options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_serialized_form() {
        for status in RepoStatus::ALL {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
    }

    #[test]
    fn only_engine_states_are_busy() {
        let busy: Vec<_> = RepoStatus::ALL.into_iter().filter(|s| s.is_busy()).collect();
        assert_eq!(
            busy,
            vec![
                RepoStatus::BackingUp,
                RepoStatus::Pruning,
                RepoStatus::Deleting,
                RepoStatus::PerformingOperation
            ]
        );
    }
}
