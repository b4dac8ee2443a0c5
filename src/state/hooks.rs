use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{RepoStatus, StateTransition};

/// Callback run around a transition into a given state.
///
/// Hooks run synchronously while the repository's transition is in flight,
/// so they must not start another transition on the same repository.
pub type TransitionHook = Arc<dyn Fn(&StateTransition) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

type HookList = Vec<(HookId, TransitionHook)>;

/// Pre and post hooks keyed by target state, run in registration order.
pub struct TransitionHooks {
    next_id: AtomicU64,
    pre: RwLock<HashMap<RepoStatus, HookList>>,
    post: RwLock<HashMap<RepoStatus, HookList>>,
}

impl TransitionHooks {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pre: RwLock::new(HashMap::new()),
            post: RwLock::new(HashMap::new()),
        }
    }

    /// A failing pre-hook aborts the transition.
    pub fn add_pre_hook(&self, state: RepoStatus, hook: TransitionHook) -> HookId {
        self.add(HookPhase::Pre, state, hook)
    }

    /// Post-hook failures are logged and never undo the transition.
    pub fn add_post_hook(&self, state: RepoStatus, hook: TransitionHook) -> HookId {
        self.add(HookPhase::Post, state, hook)
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut removed = false;
        for table in [&self.pre, &self.post] {
            for hooks in table.write().values_mut() {
                let before = hooks.len();
                hooks.retain(|(hook_id, _)| *hook_id != id);
                removed |= hooks.len() != before;
            }
        }
        removed
    }

    /// Snapshot of the hooks for `state`, so they run without holding the table lock.
    pub fn hooks_for(&self, phase: HookPhase, state: RepoStatus) -> Vec<TransitionHook> {
        let table = match phase {
            HookPhase::Pre => self.pre.read(),
            HookPhase::Post => self.post.read(),
        };
        table
            .get(&state)
            .map(|hooks| hooks.iter().map(|(_, hook)| hook.clone()).collect())
            .unwrap_or_default()
    }

    fn add(&self, phase: HookPhase, state: RepoStatus, hook: TransitionHook) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let table = match phase {
            HookPhase::Pre => &self.pre,
            HookPhase::Post => &self.post,
        };
        table.write().entry(state).or_default().push((id, hook));
        id
    }
}

impl Default for TransitionHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_scoped_to_phase_and_state() {
        let hooks = TransitionHooks::new();
        hooks.add_pre_hook(RepoStatus::BackingUp, Arc::new(|_| Ok(())));
        hooks.add_post_hook(RepoStatus::Idle, Arc::new(|_| Ok(())));

        assert_eq!(hooks.hooks_for(HookPhase::Pre, RepoStatus::BackingUp).len(), 1);
        assert!(hooks.hooks_for(HookPhase::Post, RepoStatus::BackingUp).is_empty());
        assert_eq!(hooks.hooks_for(HookPhase::Post, RepoStatus::Idle).len(), 1);
    }

    #[test]
    fn removing_a_hook_by_id() {
        let hooks = TransitionHooks::new();
        let id = hooks.add_post_hook(RepoStatus::Error, Arc::new(|_| Ok(())));
        assert!(hooks.remove_hook(id));
        assert!(!hooks.remove_hook(id));
        assert!(hooks.hooks_for(HookPhase::Post, RepoStatus::Error).is_empty());
    }
}
