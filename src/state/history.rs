use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{RepoId, RepoStatus, StateTransition};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub by_target: HashMap<RepoStatus, usize>,
}

/// Bounded ring of recent transitions, oldest dropped first.
#[derive(Clone)]
pub struct TransitionHistory {
    buffer: Arc<Mutex<VecDeque<StateTransition>>>,
    max_entries: usize,
}

impl TransitionHistory {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn record(&self, transition: StateTransition) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(transition);
    }

    /// Most recent entries in chronological order.
    pub fn recent(&self, limit: Option<usize>) -> Vec<StateTransition> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn for_repo(&self, repo_id: RepoId, limit: Option<usize>) -> Vec<StateTransition> {
        let mut entries: Vec<_> = self
            .buffer
            .lock()
            .iter()
            .filter(|t| t.repo_id == repo_id)
            .cloned()
            .collect();
        if let Some(n) = limit {
            let skip = entries.len().saturating_sub(n);
            entries.drain(..skip);
        }
        entries
    }

    pub fn stats(&self) -> TransitionStats {
        let buffer = self.buffer.lock();
        let mut stats = TransitionStats {
            total: buffer.len(),
            ..Default::default()
        };
        for transition in buffer.iter() {
            if transition.success {
                stats.succeeded += 1;
                *stats.by_target.entry(transition.to).or_default() += 1;
            } else {
                stats.failed += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transition(repo_id: RepoId, to: RepoStatus, success: bool) -> StateTransition {
        StateTransition {
            repo_id,
            from: RepoStatus::Idle,
            to,
            reason: "test".into(),
            timestamp: Utc::now(),
            success,
            error: None,
        }
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let history = TransitionHistory::new(2);
        history.record(transition(1, RepoStatus::BackingUp, true));
        history.record(transition(2, RepoStatus::Pruning, true));
        history.record(transition(3, RepoStatus::Mounted, true));

        let ids: Vec<_> = history.recent(None).iter().map(|t| t.repo_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let history = TransitionHistory::new(10);
        for id in 1..=5 {
            history.record(transition(id, RepoStatus::BackingUp, true));
        }
        let ids: Vec<_> = history.recent(Some(2)).iter().map(|t| t.repo_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn filters_and_counts_per_repo() {
        let history = TransitionHistory::new(10);
        history.record(transition(1, RepoStatus::BackingUp, true));
        history.record(transition(2, RepoStatus::Pruning, false));
        history.record(transition(1, RepoStatus::Idle, true));

        assert_eq!(history.for_repo(1, None).len(), 2);
        assert_eq!(history.for_repo(1, Some(1))[0].to, RepoStatus::Idle);

        let stats = history.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_target.get(&RepoStatus::Idle), Some(&1));
    }
}
