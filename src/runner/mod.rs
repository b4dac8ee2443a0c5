//! Runs engine operations against repositories.
//!
//! Every operation follows the same shape: wait for the repository lock
//! (cancellable), move the repository into its busy state, run the engine,
//! then classify the result into a state transition, a job status and,
//! where the user has to act, a notification. The lock is released when the
//! operation's guard drops, on every path.

pub mod jobs;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{
    ArchiveInfo, BackupEngine, BackupProgress, EngineError, EngineResult, RepositoryInfo,
};
use crate::events::{Event, EventEmitter};
use crate::locks::{LockRegistry, RepoLockGuard};
use crate::notifications::{NewNotification, NotificationAction, NotificationLevel, Notifier};
use crate::state::{
    BackupStats, OperationKind, PruneStats, RepoErrorAction, RepoErrorInfo, RepoErrorType,
    RepoStatus, RepositoryStateManager, StateError, TransitionResult,
};
use crate::storage::{BackupProfile, Repository, Store};
use crate::types::{BackupId, RepoId};

pub use jobs::{ButtonStatus, JobKey, JobSnapshot, JobStatus, JobTracker};

/// How long a force reset waits for cancelled work to let go of the repository.
const FORCE_RESET_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Where the scheduler hands off due work. Implementations only enqueue;
/// the operation itself runs independently of the caller.
#[async_trait]
pub trait OperationQueue: Send + Sync {
    async fn queue_backup(&self, backup_id: BackupId) -> anyhow::Result<()>;
    async fn queue_prune(&self, backup_id: BackupId) -> anyhow::Result<()>;
    async fn queue_archive_delete(&self, backup_id: BackupId, archive: String) -> anyhow::Result<()>;
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum OperationOutcome {
    Success,
    Cancelled,
    LockTimeout,
    Error { message: String },
}

#[derive(Clone, Copy)]
struct RunCtx {
    repo_id: RepoId,
    key: Option<JobKey>,
    label: &'static str,
}

impl RunCtx {
    fn job(key: JobKey, label: &'static str) -> Self {
        Self {
            repo_id: key.backup_id.repository_id,
            key: Some(key),
            label,
        }
    }

    fn repo(repo_id: RepoId, label: &'static str) -> Self {
        Self {
            repo_id,
            key: None,
            label,
        }
    }

    fn backup_id(&self) -> Option<BackupId> {
        self.key.map(|key| key.backup_id)
    }
}

struct RunnerInner {
    /// Repository lifecycle state
    state: Arc<RepositoryStateManager>,

    /// Per-repository mutual exclusion
    locks: Arc<LockRegistry>,

    engine: Arc<dyn BackupEngine>,
    store: Arc<dyn Store>,

    /// User-facing notifications, persisted through `store`
    notifier: Notifier,
    emitter: Arc<dyn EventEmitter>,

    /// Job status per backup id and operation kind
    jobs: JobTracker,

    /// Bound on buffered progress samples (backpressure on the engine)
    progress_capacity: usize,

    /// Parent of every operation's cancellation token
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct OperationRunner {
    inner: Arc<RunnerInner>,
}

impl OperationRunner {
    pub fn new(
        state: Arc<RepositoryStateManager>,
        locks: Arc<LockRegistry>,
        engine: Arc<dyn BackupEngine>,
        store: Arc<dyn Store>,
        emitter: Arc<dyn EventEmitter>,
        progress_capacity: usize,
    ) -> Self {
        let notifier = Notifier::new(store.clone(), emitter.clone());
        Self {
            inner: Arc::new(RunnerInner {
                state,
                locks,
                engine,
                store,
                notifier,
                emitter,
                jobs: JobTracker::new(),
                progress_capacity: progress_capacity.max(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> &Arc<RepositoryStateManager> {
        &self.inner.state
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.inner.locks
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub async fn run_backup(&self, backup_id: BackupId) -> anyhow::Result<OperationOutcome> {
        let cancel = self.claim(JobKey::backup(backup_id))?;
        Ok(self.execute_backup(backup_id, cancel).await)
    }

    pub async fn run_prune(&self, backup_id: BackupId) -> anyhow::Result<OperationOutcome> {
        let cancel = self.claim(JobKey::prune(backup_id))?;
        Ok(self.execute_prune(backup_id, cancel).await)
    }

    pub async fn run_archive_delete(
        &self,
        backup_id: BackupId,
        archive: &str,
    ) -> anyhow::Result<OperationOutcome> {
        let cancel = self.claim(JobKey::archive_delete(backup_id))?;
        Ok(self.execute_archive_delete(backup_id, archive, cancel).await)
    }

    /// Deletes the repository and everything in it. Needs a descriptive
    /// reason; the repository's lock is dropped once the deletion succeeds.
    pub async fn delete_repository(
        &self,
        repo_id: RepoId,
        reason: &str,
    ) -> anyhow::Result<OperationOutcome> {
        let repo = self.load_repository(repo_id).await?;
        let ctx = RunCtx::repo(repo_id, "Repository deletion");
        let cancel = self.inner.shutdown.child_token();

        let outcome = {
            let Some(_guard) = self.acquire(ctx, &cancel).await else {
                return Ok(OperationOutcome::Cancelled);
            };
            if let Err(outcome) = self.begin(ctx, self.inner.state.start_deleting(repo_id, reason)).await {
                return Ok(outcome);
            }
            let result = self.inner.engine.delete_repository(&cancel, &repo).await;
            self.settle(ctx, result, |_| {
                self.inner.state.complete_deleting(repo_id).map(drop)
            })
            .await
        };

        if outcome == OperationOutcome::Success {
            self.inner.locks.delete_lock(repo_id);
        }
        Ok(outcome)
    }

    pub async fn mount_repository(
        &self,
        repo_id: RepoId,
        mount_path: PathBuf,
    ) -> anyhow::Result<OperationOutcome> {
        self.mount(repo_id, None, mount_path).await
    }

    pub async fn mount_archive(
        &self,
        repo_id: RepoId,
        archive: &str,
        mount_path: PathBuf,
    ) -> anyhow::Result<OperationOutcome> {
        self.mount(repo_id, Some(archive.to_string()), mount_path).await
    }

    pub async fn unmount(&self, repo_id: RepoId) -> anyhow::Result<OperationOutcome> {
        let ctx = RunCtx::repo(repo_id, "Unmount");
        let cancel = self.inner.shutdown.child_token();
        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return Ok(OperationOutcome::Cancelled);
        };
        let mount = self.inner.state.mount_info(repo_id)?;

        match self.inner.engine.umount(&cancel, Path::new(&mount.path)).await {
            Ok(_) => {
                self.inner.state.unmount_repository(repo_id)?;
                info!(repo_id, path = %mount.path, "Repository unmounted");
                Ok(OperationOutcome::Success)
            }
            Err(EngineError::Cancelled) => Ok(OperationOutcome::Cancelled),
            Err(e) => {
                let message = e.to_string();
                self.inner
                    .notifier
                    .error(None, format!("Unmount of {} failed: {}", mount.path, message))
                    .await;
                Ok(OperationOutcome::Error { message })
            }
        }
    }

    /// Re-reads repository statistics from the engine.
    pub async fn refresh_repository(&self, repo_id: RepoId) -> anyhow::Result<RepositoryInfo> {
        let engine = self.inner.engine.clone();
        self.run_general(repo_id, "refresh", move |repo, cancel| async move {
            engine.info(&cancel, &repo).await
        })
        .await
    }

    pub async fn list_archives(&self, repo_id: RepoId) -> anyhow::Result<Vec<ArchiveInfo>> {
        let engine = self.inner.engine.clone();
        self.run_general(repo_id, "archive listing", move |repo, cancel| async move {
            engine.list(&cancel, &repo).await
        })
        .await
    }

    pub async fn init_repository(&self, repo_id: RepoId) -> anyhow::Result<()> {
        let engine = self.inner.engine.clone();
        self.run_general(repo_id, "init", move |repo, cancel| async move {
            engine.init(&cancel, &repo).await
        })
        .await
    }

    pub async fn rename_archive(
        &self,
        repo_id: RepoId,
        archive: &str,
        new_name: &str,
    ) -> anyhow::Result<()> {
        let engine = self.inner.engine.clone();
        let (archive, new_name) = (archive.to_string(), new_name.to_string());
        self.run_general(repo_id, "archive rename", move |repo, cancel| async move {
            engine.rename(&cancel, &repo, &archive, &new_name).await
        })
        .await
    }

    /// Removes a stale engine lock and, if the repository was in `error`,
    /// returns it to `idle`.
    pub async fn break_lock(&self, repo_id: RepoId) -> anyhow::Result<()> {
        let repo = self.load_repository(repo_id).await?;
        let cancel = self.inner.shutdown.child_token();
        let _guard = self.inner.locks.acquire(repo_id).await;

        self.inner
            .engine
            .break_lock(&cancel, &repo)
            .await
            .with_context(|| format!("failed to break lock of repository {}", repo_id))?;

        if self.inner.state.has_error(repo_id) {
            self.inner
                .state
                .recover_from_error(repo_id, "repository lock broken")?;
        } else {
            self.inner.state.clear_error(repo_id);
        }
        info!(repo_id, "Repository lock broken");
        Ok(())
    }

    /// Returns a repository in `error` to `idle`. Refused while another
    /// operation holds the repository.
    pub async fn recover(&self, repo_id: RepoId, resolution: &str) -> anyhow::Result<TransitionResult> {
        let Some(_guard) = self.inner.locks.try_acquire(repo_id) else {
            return Err(anyhow!("repository {} is busy", repo_id));
        };
        Ok(self.inner.state.recover_from_error(repo_id, resolution)?)
    }

    /// Cancels everything queued or running on the repository, waits for
    /// its lock, then forces it back to `idle`.
    pub async fn force_reset(&self, repo_id: RepoId, reason: &str) -> anyhow::Result<TransitionResult> {
        let cancelled = self.inner.jobs.cancel_repository(repo_id);
        if cancelled > 0 {
            info!(repo_id, cancelled, "Cancelled jobs ahead of force reset");
        }
        let _guard = tokio::time::timeout(FORCE_RESET_LOCK_WAIT, self.inner.locks.acquire(repo_id))
            .await
            .map_err(|_| {
                anyhow!(
                    "repository {} is still busy after {}s",
                    repo_id,
                    FORCE_RESET_LOCK_WAIT.as_secs()
                )
            })?;
        Ok(self.inner.state.force_reset(repo_id, reason))
    }

    /// Cancels a queued or running job. Returns false if nothing was active.
    pub fn abort(&self, kind: OperationKind, backup_id: BackupId) -> bool {
        let key = JobKey { kind, backup_id };
        let aborted = self.inner.jobs.cancel(key);
        if aborted {
            info!(backup_id = %backup_id, kind = %kind, "Abort requested");
        }
        aborted
    }

    pub fn job(&self, kind: OperationKind, backup_id: BackupId) -> JobSnapshot {
        self.inner.jobs.get(JobKey { kind, backup_id })
    }

    pub fn active_jobs(&self) -> Vec<(JobKey, JobSnapshot)> {
        self.inner.jobs.active()
    }

    pub fn button_status(&self, backup_id: BackupId) -> ButtonStatus {
        match self.inner.jobs.get(JobKey::backup(backup_id)).status {
            JobStatus::Running => return ButtonStatus::Abort,
            JobStatus::Waiting => return ButtonStatus::Waiting,
            _ => {}
        }
        let repo_id = backup_id.repository_id;
        match self.inner.state.status(repo_id) {
            RepoStatus::Mounted => ButtonStatus::Unmount,
            RepoStatus::Error
                if self.inner.state.error_info(repo_id).error_type == RepoErrorType::LockTimeout =>
            {
                ButtonStatus::Locked
            }
            status if status.is_busy() => ButtonStatus::Busy,
            _ => ButtonStatus::RunBackup,
        }
    }

    /// Cancels every queued and running operation.
    pub fn shutdown(&self) {
        info!("Operation runner shutting down");
        self.inner.shutdown.cancel();
    }

    fn claim(&self, key: JobKey) -> anyhow::Result<CancellationToken> {
        let cancel = self.inner.shutdown.child_token();
        if !self.inner.jobs.claim(key, cancel.clone()) {
            return Err(anyhow!(
                "{} for {} is already queued or running",
                key.kind,
                key.backup_id
            ));
        }
        self.emit_job(key);
        Ok(cancel)
    }

    async fn execute_backup(&self, backup_id: BackupId, cancel: CancellationToken) -> OperationOutcome {
        let ctx = RunCtx::job(JobKey::backup(backup_id), "Backup");
        let (repo, profile) = match self.load(backup_id).await {
            Ok(loaded) => loaded,
            Err(e) => return self.reject(ctx, e).await,
        };

        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return OperationOutcome::Cancelled;
        };
        let options = serde_json::json!({ "backupProfileId": profile.id });
        if let Err(outcome) = self.begin(ctx, self.inner.state.start_backup(repo.id, Some(options))).await {
            return outcome;
        }

        let started = Instant::now();
        let (tx, rx) = mpsc::channel(self.inner.progress_capacity);
        let consumer = tokio::spawn(self.clone().consume_progress(JobKey::backup(backup_id), rx));
        let result = self.inner.engine.create(&cancel, &repo, &profile, tx).await;
        if let Err(e) = consumer.await {
            warn!(repo_id = repo.id, "Progress consumer failed: {}", e);
        }

        let files_processed = self
            .inner
            .jobs
            .get(JobKey::backup(backup_id))
            .progress
            .map(|p| p.processed_files)
            .unwrap_or(0);
        self.settle(ctx, result, |archive| {
            let stats = BackupStats {
                archive_name: archive.clone(),
                files_processed,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            self.inner.state.complete_backup(repo.id, stats).map(drop)
        })
        .await
    }

    async fn execute_prune(&self, backup_id: BackupId, cancel: CancellationToken) -> OperationOutcome {
        let ctx = RunCtx::job(JobKey::prune(backup_id), "Prune");
        let loaded = async {
            let (repo, profile) = self.load(backup_id).await?;
            let rule = self
                .inner
                .store
                .pruning_rule_for_profile(profile.id)
                .await?
                .ok_or_else(|| anyhow!("backup profile {} has no pruning rule", profile.id))?;
            anyhow::Ok((repo, profile, rule))
        };
        let (repo, profile, rule) = match loaded.await {
            Ok(loaded) => loaded,
            Err(e) => return self.reject(ctx, e).await,
        };

        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return OperationOutcome::Cancelled;
        };
        let options = serde_json::to_value(&rule.policy).ok();
        if let Err(outcome) = self.begin(ctx, self.inner.state.start_pruning(repo.id, options)).await {
            return outcome;
        }

        let started = Instant::now();
        let result = self
            .inner
            .engine
            .prune(&cancel, &repo, &profile.prefix, &rule.policy, false)
            .await;
        self.settle(ctx, result, |summary| {
            let stats = PruneStats {
                archives_pruned: summary.pruned.len(),
                archives_kept: summary.kept.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            self.inner.state.complete_pruning(repo.id, stats).map(drop)
        })
        .await
    }

    async fn execute_archive_delete(
        &self,
        backup_id: BackupId,
        archive: &str,
        cancel: CancellationToken,
    ) -> OperationOutcome {
        let ctx = RunCtx::job(JobKey::archive_delete(backup_id), "Archive deletion");
        let repo = match self.load_repository(backup_id.repository_id).await {
            Ok(repo) => repo,
            Err(e) => return self.reject(ctx, e).await,
        };

        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return OperationOutcome::Cancelled;
        };
        let started = self.inner.state.start_operation(
            repo.id,
            OperationKind::Delete,
            RepoStatus::Deleting,
            format!("deleting archive {}", archive),
            Some(serde_json::json!({ "archive": archive })),
        );
        if let Err(outcome) = self.begin(ctx, started).await {
            return outcome;
        }

        let result = self.inner.engine.delete_archive(&cancel, &repo, archive).await;
        self.settle(ctx, result, |_| {
            self.inner.state.complete_deleting(repo.id).map(drop)
        })
        .await
    }

    async fn mount(
        &self,
        repo_id: RepoId,
        archive: Option<String>,
        mount_path: PathBuf,
    ) -> anyhow::Result<OperationOutcome> {
        let repo = self.load_repository(repo_id).await?;
        let ctx = RunCtx::repo(repo_id, "Mount");
        let cancel = self.inner.shutdown.child_token();
        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return Ok(OperationOutcome::Cancelled);
        };

        let path = mount_path.to_string_lossy().to_string();
        let started = self
            .inner
            .state
            .mount_repository(repo_id, path, archive.clone());
        if let Err(outcome) = self.begin(ctx, started).await {
            return Ok(outcome);
        }

        let result = match &archive {
            Some(name) => {
                self.inner
                    .engine
                    .mount_archive(&cancel, &repo, name, &mount_path)
                    .await
            }
            None => self.inner.engine.mount_repository(&cancel, &repo, &mount_path).await,
        };
        // Success leaves the repository mounted until `unmount`
        Ok(self.settle(ctx, result, |_| Ok(())).await)
    }

    async fn run_general<T, F, Fut>(&self, repo_id: RepoId, name: &'static str, work: F) -> anyhow::Result<T>
    where
        T: Clone + Send,
        F: FnOnce(Repository, CancellationToken) -> Fut,
        Fut: Future<Output = EngineResult<T>> + Send,
    {
        let repo = self.load_repository(repo_id).await?;
        let ctx = RunCtx::repo(repo_id, name);
        let cancel = self.inner.shutdown.child_token();
        let Some(_guard) = self.acquire(ctx, &cancel).await else {
            return Err(anyhow!("{} cancelled", name));
        };
        if let Err(outcome) = self
            .begin(ctx, self.inner.state.start_general_operation(repo_id, name))
            .await
        {
            return Err(anyhow!("{} not started: {:?}", name, outcome));
        }

        let result = work(repo, cancel).await;
        let mut value = None;
        let outcome = self
            .settle(ctx, result, |v| {
                value = Some(v.clone());
                self.inner
                    .state
                    .complete_general_operation(repo_id, name)
                    .map(drop)
            })
            .await;

        match (outcome, value) {
            (OperationOutcome::Success, Some(value)) => Ok(value),
            (OperationOutcome::Error { message }, _) => Err(anyhow!(message)),
            (outcome, _) => Err(anyhow!("{} did not complete: {:?}", name, outcome)),
        }
    }

    async fn load_repository(&self, repo_id: RepoId) -> anyhow::Result<Repository> {
        self.inner
            .store
            .get_repository(repo_id)
            .await?
            .ok_or_else(|| anyhow!("repository {} not found", repo_id))
    }

    async fn load(&self, backup_id: BackupId) -> anyhow::Result<(Repository, BackupProfile)> {
        let repo = self.load_repository(backup_id.repository_id).await?;
        let profile = self
            .inner
            .store
            .get_backup_profile(backup_id.backup_profile_id)
            .await?
            .ok_or_else(|| anyhow!("backup profile {} not found", backup_id.backup_profile_id))?;
        if !profile.repository_ids.contains(&repo.id) {
            return Err(anyhow!(
                "backup profile {} does not use repository {}",
                profile.id,
                repo.id
            ));
        }
        Ok((repo, profile))
    }

    /// Waits for the repository lock. Returns `None` if the operation was
    /// cancelled while waiting; the repository state is left untouched.
    async fn acquire(&self, ctx: RunCtx, cancel: &CancellationToken) -> Option<RepoLockGuard> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(repo_id = ctx.repo_id, "{} cancelled while waiting for the repository", ctx.label);
                if let Some(key) = ctx.key {
                    self.finish_job(key, JobStatus::Cancelled, None);
                }
                None
            }
            guard = self.inner.locks.acquire(ctx.repo_id) => Some(guard),
        }
    }

    async fn begin(
        &self,
        ctx: RunCtx,
        started: Result<TransitionResult, StateError>,
    ) -> Result<(), OperationOutcome> {
        match started {
            Ok(_) => {
                if let Some(key) = ctx.key {
                    self.inner.jobs.set_running(key);
                    self.emit_job(key);
                }
                debug!(repo_id = ctx.repo_id, "{} started", ctx.label);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(key) = ctx.key {
                    self.finish_job(key, JobStatus::Failed, Some(message.clone()));
                }
                self.inner
                    .notifier
                    .error(ctx.backup_id(), format!("{} could not start: {}", ctx.label, message))
                    .await;
                Err(OperationOutcome::Error { message })
            }
        }
    }

    async fn reject(&self, ctx: RunCtx, error: anyhow::Error) -> OperationOutcome {
        let message = format!("{:#}", error);
        if let Some(key) = ctx.key {
            self.finish_job(key, JobStatus::Failed, Some(message.clone()));
        }
        self.inner
            .notifier
            .error(ctx.backup_id(), format!("{} failed: {}", ctx.label, message))
            .await;
        OperationOutcome::Error { message }
    }

    /// Turns an engine result into the final repository state, job status
    /// and notification. `complete` moves the repository out of its busy
    /// state on success.
    async fn settle<T, C>(&self, ctx: RunCtx, result: EngineResult<T>, complete: C) -> OperationOutcome
    where
        T: Send,
        C: FnOnce(&T) -> Result<(), StateError> + Send,
    {
        let repo_id = ctx.repo_id;
        match result {
            Ok(done) => {
                if let Err(e) = complete(&done.value) {
                    error!(repo_id, "{} finished but its state could not be completed: {}", ctx.label, e);
                    return self.abandon(ctx, e).await;
                }
                if let Some(warning) = done.warning {
                    self.inner.state.set_warning(repo_id, warning.clone());
                    self.inner
                        .notifier
                        .warning(
                            ctx.backup_id(),
                            format!("{} completed with warnings: {}", ctx.label, warning),
                        )
                        .await;
                } else {
                    self.inner.state.clear_warning(repo_id);
                }
                if let Some(key) = ctx.key {
                    self.finish_job(key, JobStatus::Completed, None);
                }
                info!(repo_id, "{} completed", ctx.label);
                OperationOutcome::Success
            }
            Err(EngineError::Cancelled) => {
                let reason = format!("{} cancelled", ctx.label.to_lowercase());
                if let Err(e) = self.inner.state.complete_operation(repo_id, Some(reason), None) {
                    warn!(repo_id, "Could not return repository to idle after cancel: {}", e);
                    return self.abandon(ctx, e).await;
                }
                if let Some(key) = ctx.key {
                    self.finish_job(key, JobStatus::Cancelled, None);
                }
                info!(repo_id, "{} cancelled", ctx.label);
                OperationOutcome::Cancelled
            }
            Err(error) => {
                let message = error.to_string();
                let (error_info, action) = classify(&error);
                self.inner
                    .state
                    .fail_with_error_info(repo_id, &message, error_info);
                if let Some(key) = ctx.key {
                    self.finish_job(key, JobStatus::Failed, Some(message.clone()));
                }

                let mut notification = NewNotification::new(
                    ctx.backup_id(),
                    NotificationLevel::Error,
                    format!("{} failed: {}", ctx.label, message),
                );
                if let Some(action) = action {
                    notification = notification.with_action(action);
                }
                self.inner.notifier.notify(notification).await;

                match error {
                    EngineError::LockTimeout(_) => OperationOutcome::LockTimeout,
                    _ => OperationOutcome::Error { message },
                }
            }
        }
    }

    /// The engine is done but the repository refused to leave its busy
    /// state. Park it in `error` so it can be recovered instead of staying
    /// busy with no lock held.
    async fn abandon(&self, ctx: RunCtx, error: StateError) -> OperationOutcome {
        let message = error.to_string();
        self.inner
            .state
            .fail_with_error_info(ctx.repo_id, &message, RepoErrorInfo::default());
        if let Some(key) = ctx.key {
            self.finish_job(key, JobStatus::Failed, Some(message.clone()));
        }
        self.inner
            .notifier
            .error(ctx.backup_id(), format!("{} failed: {}", ctx.label, message))
            .await;
        OperationOutcome::Error { message }
    }

    async fn consume_progress(self, key: JobKey, mut rx: mpsc::Receiver<BackupProgress>) {
        loop {
            tokio::select! {
                sample = rx.recv() => match sample {
                    Some(progress) => {
                        self.inner.jobs.set_progress(key, progress);
                        self.emit_job(key);
                    }
                    None => break,
                },
                _ = self.inner.shutdown.cancelled() => break,
            }
        }
    }

    fn finish_job(&self, key: JobKey, status: JobStatus, error: Option<String>) {
        self.inner.jobs.finish(key, status, error);
        self.emit_job(key);
    }

    fn emit_job(&self, key: JobKey) {
        let backup_id = key.backup_id;
        self.inner.emitter.emit(match key.kind {
            OperationKind::Prune => Event::PruneStateChanged { backup_id },
            _ => Event::BackupStateChanged { backup_id },
        });
    }
}

fn classify(error: &EngineError) -> (RepoErrorInfo, Option<NotificationAction>) {
    match error {
        EngineError::LockTimeout(message) => (
            RepoErrorInfo::new(RepoErrorType::LockTimeout, message, RepoErrorAction::UnlockRepository),
            Some(NotificationAction::UnlockRepository),
        ),
        EngineError::Passphrase(message) => (
            RepoErrorInfo::new(RepoErrorType::Passphrase, message, RepoErrorAction::None),
            None,
        ),
        EngineError::SshKey(message) => (
            RepoErrorInfo::new(RepoErrorType::SshKey, message, RepoErrorAction::RegenerateSsh),
            Some(NotificationAction::RegenerateSsh),
        ),
        _ => (RepoErrorInfo::default(), None),
    }
}

#[async_trait]
impl OperationQueue for OperationRunner {
    async fn queue_backup(&self, backup_id: BackupId) -> anyhow::Result<()> {
        self.load(backup_id).await?;
        let cancel = self.claim(JobKey::backup(backup_id))?;
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.execute_backup(backup_id, cancel).await;
            debug!(backup_id = %backup_id, ?outcome, "Queued backup finished");
        });
        Ok(())
    }

    async fn queue_prune(&self, backup_id: BackupId) -> anyhow::Result<()> {
        self.load(backup_id).await?;
        let cancel = self.claim(JobKey::prune(backup_id))?;
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.execute_prune(backup_id, cancel).await;
            debug!(backup_id = %backup_id, ?outcome, "Queued prune finished");
        });
        Ok(())
    }

    async fn queue_archive_delete(&self, backup_id: BackupId, archive: String) -> anyhow::Result<()> {
        self.load_repository(backup_id.repository_id).await?;
        let cancel = self.claim(JobKey::archive_delete(backup_id))?;
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.execute_archive_delete(backup_id, &archive, cancel).await;
            debug!(backup_id = %backup_id, archive = %archive, ?outcome, "Queued archive deletion finished");
        });
        Ok(())
    }
}
