use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ArchiveInfo, BackupEngine, BackupProgress, Completed, EngineError, EngineResult, PruneSummary,
    RepositoryInfo,
};
use crate::schedule::policy::PruningPolicy;
use crate::storage::{BackupProfile, Repository};
use crate::types::RepoId;

#[derive(Debug, Clone)]
pub struct FakeCall {
    pub op: &'static str,
    pub repo_id: Option<RepoId>,
    pub started: Instant,
    pub finished: Instant,
}

/// Scriptable engine: every call sleeps for `delay` (cancellable), then
/// pops the next queued error, if any.
pub struct FakeEngine {
    delay: Duration,
    errors: Mutex<VecDeque<EngineError>>,
    warnings: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            errors: Mutex::new(VecDeque::new()),
            warnings: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, error: EngineError) {
        self.errors.lock().push_back(error);
    }

    pub fn warn_next(&self, warning: &str) {
        self.warnings.lock().push_back(warning.to_string());
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<FakeCall> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    async fn step<T: Send>(
        &self,
        op: &'static str,
        repo_id: Option<RepoId>,
        cancel: &CancellationToken,
        value: T,
    ) -> EngineResult<T> {
        let started = Instant::now();
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.calls.lock().push(FakeCall {
            op,
            repo_id,
            started,
            finished: Instant::now(),
        });
        if cancelled {
            return Err(EngineError::Cancelled);
        }
        if let Some(error) = self.errors.lock().pop_front() {
            return Err(error);
        }
        Ok(Completed {
            value,
            warning: self.warnings.lock().pop_front(),
        })
    }
}

#[async_trait]
impl BackupEngine for FakeEngine {
    async fn init(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        self.step("init", Some(repo.id), cancel, ()).await
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        profile: &BackupProfile,
        progress: mpsc::Sender<BackupProgress>,
    ) -> EngineResult<String> {
        for processed in [1, 2] {
            let _ = progress
                .send(BackupProgress {
                    total_files: 2,
                    processed_files: processed,
                })
                .await;
        }
        let archive = format!("{}::{}archive", repo.location, profile.prefix);
        self.step("create", Some(repo.id), cancel, archive).await
    }

    async fn list(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<Vec<ArchiveInfo>> {
        self.step("list", Some(repo.id), cancel, Vec::new()).await
    }

    async fn prune(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        _prefix: &str,
        _policy: &PruningPolicy,
        _dry_run: bool,
    ) -> EngineResult<PruneSummary> {
        let summary = PruneSummary {
            pruned: vec!["old".to_string()],
            kept: vec!["new".to_string()],
        };
        self.step("prune", Some(repo.id), cancel, summary).await
    }

    async fn info(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<RepositoryInfo> {
        self.step("info", Some(repo.id), cancel, RepositoryInfo::default())
            .await
    }

    async fn mount_repository(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        _mount_path: &Path,
    ) -> EngineResult<()> {
        self.step("mount_repository", Some(repo.id), cancel, ()).await
    }

    async fn mount_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        _archive: &str,
        _mount_path: &Path,
    ) -> EngineResult<()> {
        self.step("mount_archive", Some(repo.id), cancel, ()).await
    }

    async fn umount(&self, cancel: &CancellationToken, _mount_path: &Path) -> EngineResult<()> {
        self.step("umount", None, cancel, ()).await
    }

    async fn break_lock(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        self.step("break_lock", Some(repo.id), cancel, ()).await
    }

    async fn delete_repository(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        self.step("delete_repository", Some(repo.id), cancel, ()).await
    }

    async fn delete_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        _archive: &str,
    ) -> EngineResult<()> {
        self.step("delete_archive", Some(repo.id), cancel, ()).await
    }

    async fn rename(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        _archive: &str,
        _new_name: &str,
    ) -> EngineResult<()> {
        self.step("rename", Some(repo.id), cancel, ()).await
    }
}
