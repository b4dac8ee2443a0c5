use parking_lot::RwLock;
use std::collections::HashMap;

use super::{RepoId, RepoStatus, StateError};

/// The fixed transition table plus the current state of each repository.
///
/// The table is built once and never mutated. Current state is created
/// lazily as `idle` on first reference.
pub struct RepoStateMachine {
    transitions: HashMap<RepoStatus, Vec<RepoStatus>>,
    current: RwLock<HashMap<RepoId, RepoStatus>>,
}

impl RepoStateMachine {
    pub fn new() -> Self {
        Self {
            transitions: transition_table(),
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the table allows `from -> to`. The string explains a refusal
    /// and is empty when the transition is allowed.
    pub fn can_transition(&self, from: RepoStatus, to: RepoStatus) -> (bool, String) {
        if from == to {
            return (false, format!("already in state {}", from));
        }
        match self.transitions.get(&from) {
            Some(targets) if targets.contains(&to) => (true, String::new()),
            Some(_) => (false, format!("transition from {} to {} is not allowed", from, to)),
            None => (false, format!("no transitions defined from state {}", from)),
        }
    }

    pub fn validate_transition(
        &self,
        repo_id: RepoId,
        from: RepoStatus,
        to: RepoStatus,
        reason: &str,
    ) -> Result<(), StateError> {
        if reason.trim().is_empty() {
            return Err(StateError::MissingReason);
        }
        if from == to {
            return Err(StateError::SameState(from));
        }
        let (allowed, message) = self.can_transition(from, to);
        if !allowed {
            return Err(StateError::IllegalTransition {
                repo_id,
                from,
                to,
                message,
            });
        }
        Ok(())
    }

    /// Targets reachable from `from` according to the table alone.
    pub fn valid_transitions(&self, from: RepoStatus) -> Vec<RepoStatus> {
        self.transitions.get(&from).cloned().unwrap_or_default()
    }

    pub fn current_state(&self, repo_id: RepoId) -> RepoStatus {
        if let Some(state) = self.current.read().get(&repo_id) {
            return *state;
        }
        *self.current.write().entry(repo_id).or_default()
    }

    pub fn set_current_state(&self, repo_id: RepoId, state: RepoStatus) {
        self.current.write().insert(repo_id, state);
    }

    pub fn known_repositories(&self) -> Vec<(RepoId, RepoStatus)> {
        let mut repos: Vec<_> = self.current.read().iter().map(|(id, s)| (*id, *s)).collect();
        repos.sort_by_key(|(id, _)| *id);
        repos
    }
}

impl Default for RepoStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn transition_table() -> HashMap<RepoStatus, Vec<RepoStatus>> {
    use RepoStatus::*;

    let mut table = HashMap::new();
    table.insert(
        Idle,
        vec![BackingUp, Pruning, Deleting, Mounted, PerformingOperation, Error],
    );
    for busy in [BackingUp, Pruning, Deleting, Mounted, PerformingOperation] {
        table.insert(busy, vec![Idle, Error]);
    }
    table.insert(Error, vec![Idle]);
    table
}
