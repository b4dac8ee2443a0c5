use thiserror::Error;

use super::{OperationKind, RepoId, RepoStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("transition reason is required")]
    MissingReason,

    #[error("cannot transition to the same state: {0}")]
    SameState(RepoStatus),

    #[error("transition validation failed for repo {repo_id}: {message}")]
    IllegalTransition {
        repo_id: RepoId,
        from: RepoStatus,
        to: RepoStatus,
        message: String,
    },

    #[error("business rule '{rule}' failed: {message}")]
    BusinessRule { rule: String, message: String },

    #[error("pre-transition hook failed: {0}")]
    PreHook(String),

    #[error("repository {0} is already idle")]
    AlreadyIdle(RepoId),

    #[error("repository is not mounted, current state: {0}")]
    NotMounted(RepoStatus),

    #[error("repository is not in error state, current state: {0}")]
    NotInError(RepoStatus),

    #[error("deletion requires a detailed reason (minimum {0} characters)")]
    ReasonTooShort(usize),

    #[error("cannot start {kind} operation: {source}")]
    StartOperation {
        kind: OperationKind,
        #[source]
        source: Box<StateError>,
    },

    #[error("failed to complete operation: {0}")]
    CompleteOperation(#[source] Box<StateError>),
}

impl StateError {
    /// The innermost transition error, skipping operation wrappers.
    pub fn root(&self) -> &StateError {
        match self {
            StateError::StartOperation { source, .. } => source.root(),
            StateError::CompleteOperation(source) => source.root(),
            other => other,
        }
    }
}
