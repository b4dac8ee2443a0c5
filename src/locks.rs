//! Per-repository mutual exclusion.
//!
//! Every mutating engine operation on a repository runs while holding that
//! repository's lock. Locks are created lazily and live until explicitly
//! deleted. A guard releases its lock when dropped, including on panic
//! unwinding and when the owning future is cancelled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::types::RepoId;

pub struct LockRegistry {
    locks: Mutex<HashMap<RepoId, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one repository.
pub struct RepoLockGuard {
    repo_id: RepoId,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl RepoLockGuard {
    pub fn repo_id(&self) -> RepoId {
        self.repo_id
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        debug!(
            repo_id = self.repo_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Repository lock released"
        );
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The lock object for a repository, created on first use. Concurrent
    /// callers always get the same instance.
    pub fn get_lock(&self, repo_id: RepoId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(repo_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits until the repository is free. Waiters are served in FIFO order.
    pub async fn acquire(&self, repo_id: RepoId) -> RepoLockGuard {
        let lock = self.get_lock(repo_id);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(repo_id, "Waiting for repository lock");
                lock.lock_owned().await
            }
        };
        debug!(repo_id, "Repository lock acquired");
        RepoLockGuard {
            repo_id,
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    pub fn try_acquire(&self, repo_id: RepoId) -> Option<RepoLockGuard> {
        let guard = self.get_lock(repo_id).try_lock_owned().ok()?;
        Some(RepoLockGuard {
            repo_id,
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, repo_id: RepoId) -> bool {
        let lock = match self.locks.lock().get(&repo_id) {
            Some(lock) => lock.clone(),
            None => return false,
        };
        let locked = lock.try_lock().is_err();
        locked
    }

    /// Forgets the lock of a deleted repository. Refuses while anyone holds
    /// or waits on it.
    pub fn delete_lock(&self, repo_id: RepoId) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(&repo_id) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(&repo_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn same_repository_shares_one_lock() {
        let registry = LockRegistry::new();
        let a = registry.get_lock(1);
        let b = registry.get_lock(1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.get_lock(2)));
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let registry = Arc::new(LockRegistry::new());
        let first = registry.acquire(1).await;
        assert!(registry.is_locked(1));
        assert!(registry.try_acquire(1).is_none());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
        assert!(!registry.is_locked(1));
    }

    #[tokio::test]
    async fn different_repositories_do_not_block() {
        let registry = LockRegistry::new();
        let _one = registry.acquire(1).await;
        assert!(registry.try_acquire(2).is_some());
    }

    #[tokio::test]
    async fn cancelled_holder_releases_lock() {
        let registry = Arc::new(LockRegistry::new());
        let holder = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(7).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_locked(7));

        holder.abort();
        let _ = holder.await;
        assert!(!registry.is_locked(7));
    }

    #[tokio::test]
    async fn panicking_holder_releases_lock() {
        let registry = Arc::new(LockRegistry::new());
        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire(3).await;
                panic!("engine blew up");
            })
        };
        assert!(task.await.is_err());
        assert!(registry.try_acquire(3).is_some());
    }

    #[tokio::test]
    async fn delete_only_when_unused() {
        let registry = LockRegistry::new();
        let guard = registry.acquire(5).await;
        assert!(!registry.delete_lock(5));

        drop(guard);
        assert!(registry.delete_lock(5));
        assert!(registry.is_empty());
        assert!(!registry.delete_lock(5));
    }
}
