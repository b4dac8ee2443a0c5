use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    transition_reason, OperationData, OperationKind, RepoId, RepoStateMachine, RepoStatus,
    StateError, TransitionContext, TransitionExecutor, TransitionHistory, TransitionResult,
};
use crate::events::{Event, EventEmitter};

const MIN_DELETE_REASON_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    /// Local mount point
    pub path: String,
    pub mounted_at: DateTime<Utc>,

    /// Set when a single archive is mounted instead of the whole repository
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub archive_name: String,
    pub files_processed: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneStats {
    pub archives_pruned: usize,
    pub archives_kept: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStats {
    Backup(BackupStats),
    Prune(PruneStats),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepoErrorType {
    #[default]
    None,
    SshKey,
    Passphrase,
    LockTimeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepoErrorAction {
    #[default]
    None,
    #[serde(rename = "regenerateSSH")]
    RegenerateSsh,
    UnlockRepository,
}

/// Classified error state shown next to a repository, with the suggested fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoErrorInfo {
    pub error_type: RepoErrorType,
    pub message: String,
    pub action: RepoErrorAction,
}

impl RepoErrorInfo {
    pub fn new(error_type: RepoErrorType, message: impl Into<String>, action: RepoErrorAction) -> Self {
        Self {
            error_type,
            message: message.into(),
            action,
        }
    }

    pub fn is_set(&self) -> bool {
        self.error_type != RepoErrorType::None
    }
}

#[derive(Debug, Default)]
struct RepoDetails {
    /// Attached while the repository is busy
    operation: Option<OperationData>,

    /// Set only while `mounted`
    mount: Option<MountInfo>,

    /// Message of the last failure, cleared on recovery
    last_error: Option<String>,

    /// Classified failure and suggested action
    error_info: RepoErrorInfo,

    /// Last successful operation finished with a warning
    warning: Option<String>,

    last_backup: Option<BackupStats>,
    last_prune: Option<PruneStats>,
}

/// Everything known about one repository, for the API and the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSnapshot {
    pub repo_id: RepoId,
    pub status: RepoStatus,
    pub operation: Option<OperationData>,
    pub mount: Option<MountInfo>,
    pub last_error: Option<String>,
    pub error_info: RepoErrorInfo,
    pub warning: Option<String>,
    pub last_backup: Option<BackupStats>,
    pub last_prune: Option<PruneStats>,
    pub valid_transitions: Vec<RepoStatus>,
}

/// Per-repository lifecycle bookkeeping on top of [`TransitionExecutor`].
///
/// Each repository has its own details mutex which is held across the
/// transition and the bookkeeping update, so observers never see a status
/// that disagrees with the attached operation.
pub struct RepositoryStateManager {
    executor: Arc<TransitionExecutor>,
    repos: RwLock<HashMap<RepoId, Arc<Mutex<RepoDetails>>>>,
    emitter: Arc<dyn EventEmitter>,
}

impl RepositoryStateManager {
    pub fn new(history_size: usize, emitter: Arc<dyn EventEmitter>) -> Self {
        let executor = TransitionExecutor::new(
            Arc::new(RepoStateMachine::new()),
            TransitionHistory::new(history_size),
            emitter.clone(),
        );
        Self::with_executor(Arc::new(executor), emitter)
    }

    pub fn with_executor(executor: Arc<TransitionExecutor>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            executor,
            repos: RwLock::new(HashMap::new()),
            emitter,
        }
    }

    pub fn executor(&self) -> &Arc<TransitionExecutor> {
        &self.executor
    }

    pub fn history(&self) -> &TransitionHistory {
        self.executor.history()
    }

    pub fn status(&self, repo_id: RepoId) -> RepoStatus {
        self.executor.machine().current_state(repo_id)
    }

    pub fn is_backup_running(&self, repo_id: RepoId) -> bool {
        self.status(repo_id) == RepoStatus::BackingUp
    }

    pub fn has_error(&self, repo_id: RepoId) -> bool {
        self.status(repo_id) == RepoStatus::Error
    }

    pub fn current_operation(&self, repo_id: RepoId) -> Option<OperationData> {
        self.details(repo_id).lock().operation.clone()
    }

    /// Table plus business-rule check, without mutating anything.
    pub fn can_transition_to(&self, repo_id: RepoId, target: RepoStatus) -> (bool, String) {
        let current = self.status(repo_id);
        let (allowed, reason) = self.executor.machine().can_transition(current, target);
        if !allowed {
            return (false, reason);
        }
        let ctx = TransitionContext::new(repo_id).with_reason("check");
        match self.executor.validator().validate(&ctx, current, target) {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        }
    }

    pub fn start_operation(
        &self,
        repo_id: RepoId,
        kind: OperationKind,
        target: RepoStatus,
        reason: impl Into<String>,
        options: Option<serde_json::Value>,
    ) -> Result<TransitionResult, StateError> {
        let details = self.details(repo_id);
        let mut details = details.lock();
        let result = self
            .transition(repo_id, target, reason.into())
            .map_err(|e| StateError::StartOperation {
                kind,
                source: Box::new(e),
            })?;
        details.operation = Some(OperationData::new(kind, options));
        details.warning = None;
        drop(details);

        info!(repo_id, operation = %kind, "Repository operation started");
        self.emitter.emit(Event::OperationStarted { repo_id, kind });
        Ok(result)
    }

    /// Moves a busy repository back to idle and records the outcome.
    pub fn complete_operation(
        &self,
        repo_id: RepoId,
        reason: Option<String>,
        stats: Option<OperationStats>,
    ) -> Result<TransitionResult, StateError> {
        let details = self.details(repo_id);
        let mut details = details.lock();
        let current = self.status(repo_id);
        if current == RepoStatus::Idle {
            return Err(StateError::AlreadyIdle(repo_id));
        }
        let kind = details.operation.as_ref().map(|op| op.kind);
        let reason = reason.unwrap_or_else(|| transition_reason(current, RepoStatus::Idle, kind));
        let result = self
            .transition(repo_id, RepoStatus::Idle, reason)
            .map_err(|e| StateError::CompleteOperation(Box::new(e)))?;

        details.operation = None;
        details.mount = None;
        match stats {
            Some(OperationStats::Backup(stats)) => details.last_backup = Some(stats),
            Some(OperationStats::Prune(stats)) => details.last_prune = Some(stats),
            None => {}
        }
        drop(details);

        self.emitter.emit(Event::OperationCompleted { repo_id });
        Ok(result)
    }

    pub fn fail_operation(&self, repo_id: RepoId, error: impl fmt::Display) -> TransitionResult {
        self.fail_with_error_info(repo_id, error, RepoErrorInfo::default())
    }

    /// Moves the repository to `error`. If the transition is refused, the
    /// repository is forced into `error` anyway; failure is always recorded.
    pub fn fail_with_error_info(
        &self,
        repo_id: RepoId,
        error: impl fmt::Display,
        error_info: RepoErrorInfo,
    ) -> TransitionResult {
        let message = error.to_string();
        let details = self.details(repo_id);
        let mut details = details.lock();
        let current = self.status(repo_id);
        let kind = details.operation.as_ref().map(|op| op.kind);
        let reason = format!("{}: {}", transition_reason(current, RepoStatus::Error, kind), message);

        let result = if current == RepoStatus::Error {
            // Already failed; refresh the recorded error only
            TransitionResult {
                success: true,
                from: current,
                to: current,
                reason,
                error: None,
                timestamp: Utc::now(),
                duration: Default::default(),
            }
        } else {
            let ctx = TransitionContext::new(repo_id).with_reason(reason);
            match self.executor.execute_transition(&ctx, current, RepoStatus::Error) {
                Ok(result) => result,
                Err(rejected) => {
                    warn!(repo_id, "Transition to error refused ({}), forcing", rejected.error);
                    self.executor.force_transition(&ctx, current, RepoStatus::Error)
                }
            }
        };

        details.operation = None;
        details.mount = None;
        details.last_error = Some(message.clone());
        details.error_info = error_info;
        drop(details);

        warn!(repo_id, "Repository operation failed: {}", message);
        self.emitter.emit(Event::OperationFailed { repo_id });
        result
    }

    pub fn start_backup(
        &self,
        repo_id: RepoId,
        options: Option<serde_json::Value>,
    ) -> Result<TransitionResult, StateError> {
        self.start_operation(
            repo_id,
            OperationKind::Backup,
            RepoStatus::BackingUp,
            "starting backup operation",
            options,
        )
    }

    pub fn complete_backup(
        &self,
        repo_id: RepoId,
        stats: BackupStats,
    ) -> Result<TransitionResult, StateError> {
        self.complete_operation(
            repo_id,
            Some("backup completed successfully".to_string()),
            Some(OperationStats::Backup(stats)),
        )
    }

    pub fn fail_backup(&self, repo_id: RepoId, error: impl fmt::Display) -> TransitionResult {
        self.fail_operation(repo_id, format!("backup failed: {}", error))
    }

    pub fn start_pruning(
        &self,
        repo_id: RepoId,
        options: Option<serde_json::Value>,
    ) -> Result<TransitionResult, StateError> {
        self.start_operation(
            repo_id,
            OperationKind::Prune,
            RepoStatus::Pruning,
            "starting prune operation",
            options,
        )
    }

    pub fn complete_pruning(
        &self,
        repo_id: RepoId,
        stats: PruneStats,
    ) -> Result<TransitionResult, StateError> {
        self.complete_operation(
            repo_id,
            Some("prune completed successfully".to_string()),
            Some(OperationStats::Prune(stats)),
        )
    }

    pub fn fail_pruning(&self, repo_id: RepoId, error: impl fmt::Display) -> TransitionResult {
        self.fail_operation(repo_id, format!("prune failed: {}", error))
    }

    /// Deletion needs an explicit, descriptive reason.
    pub fn start_deleting(&self, repo_id: RepoId, reason: &str) -> Result<TransitionResult, StateError> {
        if reason.trim().chars().count() < MIN_DELETE_REASON_LEN {
            return Err(StateError::ReasonTooShort(MIN_DELETE_REASON_LEN));
        }
        self.start_operation(
            repo_id,
            OperationKind::Delete,
            RepoStatus::Deleting,
            reason.trim(),
            Some(serde_json::json!({ "reason": reason.trim() })),
        )
    }

    pub fn complete_deleting(&self, repo_id: RepoId) -> Result<TransitionResult, StateError> {
        self.complete_operation(repo_id, Some("deletion completed".to_string()), None)
    }

    pub fn fail_deleting(&self, repo_id: RepoId, error: impl fmt::Display) -> TransitionResult {
        self.fail_operation(repo_id, format!("deletion failed: {}", error))
    }

    pub fn start_general_operation(
        &self,
        repo_id: RepoId,
        name: &str,
    ) -> Result<TransitionResult, StateError> {
        self.start_operation(
            repo_id,
            OperationKind::General,
            RepoStatus::PerformingOperation,
            format!("starting {}", name),
            Some(serde_json::json!({ "name": name })),
        )
    }

    pub fn complete_general_operation(
        &self,
        repo_id: RepoId,
        name: &str,
    ) -> Result<TransitionResult, StateError> {
        self.complete_operation(repo_id, Some(format!("{} finished", name)), None)
    }

    pub fn fail_general_operation(
        &self,
        repo_id: RepoId,
        name: &str,
        error: impl fmt::Display,
    ) -> TransitionResult {
        self.fail_operation(repo_id, format!("{} failed: {}", name, error))
    }

    pub fn mount_repository(
        &self,
        repo_id: RepoId,
        path: impl Into<String>,
        archive: Option<String>,
    ) -> Result<TransitionResult, StateError> {
        let path = path.into();
        let details = self.details(repo_id);
        let mut details = details.lock();
        let reason = match &archive {
            Some(name) => format!("mounting archive {} at {}", name, path),
            None => format!("mounting repository at {}", path),
        };
        let result = self
            .transition(repo_id, RepoStatus::Mounted, reason)
            .map_err(|e| StateError::StartOperation {
                kind: OperationKind::Mount,
                source: Box::new(e),
            })?;
        details.mount = Some(MountInfo {
            path,
            mounted_at: Utc::now(),
            archive,
        });
        drop(details);

        self.emitter.emit(Event::RepoMounted { repo_id });
        Ok(result)
    }

    pub fn unmount_repository(&self, repo_id: RepoId) -> Result<TransitionResult, StateError> {
        let details = self.details(repo_id);
        let mut details = details.lock();
        let current = self.status(repo_id);
        if current != RepoStatus::Mounted {
            return Err(StateError::NotMounted(current));
        }
        let result = self.transition(repo_id, RepoStatus::Idle, "repository unmounted".to_string())?;
        details.mount = None;
        drop(details);

        self.emitter.emit(Event::RepoUnmounted { repo_id });
        Ok(result)
    }

    pub fn mount_info(&self, repo_id: RepoId) -> Result<MountInfo, StateError> {
        let details = self.details(repo_id);
        let details = details.lock();
        match (&details.mount, self.status(repo_id)) {
            (Some(mount), RepoStatus::Mounted) => Ok(mount.clone()),
            (_, status) => Err(StateError::NotMounted(status)),
        }
    }

    pub fn recover_from_error(
        &self,
        repo_id: RepoId,
        resolution: &str,
    ) -> Result<TransitionResult, StateError> {
        let details = self.details(repo_id);
        let mut details = details.lock();
        let current = self.status(repo_id);
        if current != RepoStatus::Error {
            return Err(StateError::NotInError(current));
        }
        let result = self.transition(
            repo_id,
            RepoStatus::Idle,
            format!("recovered from error: {}", resolution),
        )?;
        details.last_error = None;
        details.error_info = RepoErrorInfo::default();
        drop(details);

        info!(repo_id, resolution, "Repository recovered from error");
        self.emitter.emit(Event::RepoRecovered { repo_id });
        Ok(result)
    }

    /// Unconditionally returns the repository to `idle` and clears all
    /// attached data.
    pub fn force_reset(&self, repo_id: RepoId, reason: &str) -> TransitionResult {
        let details = self.details(repo_id);
        let mut details = details.lock();
        let current = self.status(repo_id);
        let ctx = TransitionContext::new(repo_id).with_reason(reason);
        let result = self
            .executor
            .force_transition(&ctx, current, RepoStatus::Idle);
        *details = RepoDetails::default();
        drop(details);

        warn!(repo_id, from = %current, reason, "Repository state force reset");
        self.emitter.emit(Event::RepoForceReset { repo_id });
        result
    }

    pub fn set_warning(&self, repo_id: RepoId, warning: impl Into<String>) {
        self.details(repo_id).lock().warning = Some(warning.into());
        self.emitter.emit(Event::RepoStateChanged { repo_id });
    }

    pub fn clear_warning(&self, repo_id: RepoId) {
        self.details(repo_id).lock().warning = None;
    }

    pub fn warning(&self, repo_id: RepoId) -> Option<String> {
        self.details(repo_id).lock().warning.clone()
    }

    pub fn error_info(&self, repo_id: RepoId) -> RepoErrorInfo {
        self.details(repo_id).lock().error_info.clone()
    }

    pub fn set_error_info(&self, repo_id: RepoId, error_info: RepoErrorInfo) {
        self.details(repo_id).lock().error_info = error_info;
        self.emitter.emit(Event::RepoStateChanged { repo_id });
    }

    /// Drops the classified error without leaving the `error` state.
    pub fn clear_error(&self, repo_id: RepoId) {
        let details = self.details(repo_id);
        let mut details = details.lock();
        details.error_info = RepoErrorInfo::default();
        details.last_error = None;
    }

    pub fn snapshot(&self, repo_id: RepoId) -> RepoSnapshot {
        let details = self.details(repo_id);
        let details = details.lock();
        let status = self.status(repo_id);
        RepoSnapshot {
            repo_id,
            status,
            operation: details.operation.clone(),
            mount: details.mount.clone(),
            last_error: details.last_error.clone(),
            error_info: details.error_info.clone(),
            warning: details.warning.clone(),
            last_backup: details.last_backup.clone(),
            last_prune: details.last_prune.clone(),
            valid_transitions: self.executor.machine().valid_transitions(status),
        }
    }

    pub fn list_statuses(&self) -> Vec<(RepoId, RepoStatus)> {
        self.executor.machine().known_repositories()
    }

    pub fn snapshots(&self) -> Vec<RepoSnapshot> {
        self.executor
            .machine()
            .known_repositories()
            .into_iter()
            .map(|(repo_id, _)| self.snapshot(repo_id))
            .collect()
    }

    fn details(&self, repo_id: RepoId) -> Arc<Mutex<RepoDetails>> {
        if let Some(details) = self.repos.read().get(&repo_id) {
            return details.clone();
        }
        // Touch the machine so the repository shows up as idle
        let _ = self.executor.machine().current_state(repo_id);
        self.repos.write().entry(repo_id).or_default().clone()
    }

    /// Caller must hold the repository's details lock.
    fn transition(
        &self,
        repo_id: RepoId,
        target: RepoStatus,
        reason: String,
    ) -> Result<TransitionResult, StateError> {
        let current = self.status(repo_id);
        let ctx = TransitionContext::new(repo_id).with_reason(reason);
        self.executor
            .execute_transition(&ctx, current, target)
            .map_err(|rejected| rejected.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEmitter;

    fn manager() -> (RepositoryStateManager, RecordingEmitter) {
        let emitter = RecordingEmitter::new();
        (RepositoryStateManager::new(100, Arc::new(emitter.clone())), emitter)
    }

    #[test]
    fn backup_lifecycle_round_trip() {
        let (manager, emitter) = manager();

        manager.start_backup(1, None).unwrap();
        assert!(manager.is_backup_running(1));
        assert_eq!(manager.current_operation(1).unwrap().kind, OperationKind::Backup);

        let stats = BackupStats {
            archive_name: "repo::daily-1".into(),
            files_processed: 12,
            duration_ms: 40,
        };
        manager.complete_backup(1, stats.clone()).unwrap();

        let snapshot = manager.snapshot(1);
        assert_eq!(snapshot.status, RepoStatus::Idle);
        assert!(snapshot.operation.is_none());
        assert_eq!(snapshot.last_backup, Some(stats));
        assert_eq!(emitter.count(|e| matches!(e, Event::OperationStarted { .. })), 1);
        assert_eq!(emitter.count(|e| matches!(e, Event::OperationCompleted { .. })), 1);
    }

    #[test]
    fn second_operation_is_refused_while_busy() {
        let (manager, _) = manager();
        manager.start_pruning(1, None).unwrap();

        let err = manager.start_backup(1, None).unwrap_err();
        assert!(matches!(err.root(), StateError::IllegalTransition { .. }));
        assert_eq!(manager.status(1), RepoStatus::Pruning);
    }

    #[test]
    fn mounted_repository_must_unmount_first() {
        let (manager, _) = manager();
        manager.mount_repository(1, "/mnt/repo", None).unwrap();

        let err = manager.start_backup(1, None).unwrap_err();
        assert!(matches!(
            err.root(),
            StateError::IllegalTransition { from: RepoStatus::Mounted, to: RepoStatus::BackingUp, .. }
        ));
        assert_eq!(manager.mount_info(1).unwrap().path, "/mnt/repo");

        manager.unmount_repository(1).unwrap();
        assert!(manager.mount_info(1).is_err());
        assert_eq!(manager.unmount_repository(1), Err(StateError::NotMounted(RepoStatus::Idle)));
    }

    #[test]
    fn failure_records_error_details() {
        let (manager, emitter) = manager();
        manager.start_backup(1, None).unwrap();

        let info = RepoErrorInfo::new(
            RepoErrorType::LockTimeout,
            "repository is locked",
            RepoErrorAction::UnlockRepository,
        );
        let result = manager.fail_with_error_info(1, "lock timeout", info.clone());

        assert!(result.success);
        assert!(manager.has_error(1));
        let snapshot = manager.snapshot(1);
        assert_eq!(snapshot.last_error.as_deref(), Some("lock timeout"));
        assert_eq!(snapshot.error_info, info);
        assert_eq!(snapshot.valid_transitions, vec![RepoStatus::Idle]);
        assert_eq!(emitter.count(|e| matches!(e, Event::OperationFailed { .. })), 1);
    }

    #[test]
    fn refused_failure_is_forced() {
        let (manager, _) = manager();
        manager.executor().validator().add_rule(
            "never_error",
            Arc::new(|_, _, to| {
                if to == RepoStatus::Error {
                    Err("no".into())
                } else {
                    Ok(())
                }
            }),
        );
        manager.start_general_operation(1, "refresh").unwrap();

        let result = manager.fail_operation(1, "engine crashed");
        assert!(result.reason.starts_with("FORCED: "));
        assert!(manager.has_error(1));
    }

    #[test]
    fn recovery_clears_error() {
        let (manager, _) = manager();
        assert_eq!(
            manager.recover_from_error(1, "nothing to do"),
            Err(StateError::NotInError(RepoStatus::Idle))
        );

        manager.start_backup(1, None).unwrap();
        manager.fail_with_error_info(
            1,
            "locked",
            RepoErrorInfo::new(RepoErrorType::LockTimeout, "locked", RepoErrorAction::UnlockRepository),
        );
        manager.recover_from_error(1, "lock broken").unwrap();

        let snapshot = manager.snapshot(1);
        assert_eq!(snapshot.status, RepoStatus::Idle);
        assert!(snapshot.last_error.is_none());
        assert!(!snapshot.error_info.is_set());
    }

    #[test]
    fn delete_requires_descriptive_reason() {
        let (manager, _) = manager();
        assert_eq!(manager.start_deleting(1, "oops"), Err(StateError::ReasonTooShort(10)));
        assert_eq!(manager.status(1), RepoStatus::Idle);

        manager.start_deleting(1, "repository decommissioned").unwrap();
        assert_eq!(manager.status(1), RepoStatus::Deleting);
        manager.complete_deleting(1).unwrap();
        assert_eq!(manager.status(1), RepoStatus::Idle);
    }

    #[test]
    fn completing_an_idle_repository_fails() {
        let (manager, _) = manager();
        assert_eq!(
            manager.complete_operation(1, None, None),
            Err(StateError::AlreadyIdle(1))
        );
    }

    #[test]
    fn force_reset_clears_everything() {
        let (manager, emitter) = manager();
        manager.mount_repository(1, "/mnt/a", Some("archive-1".into())).unwrap();
        manager.set_warning(1, "some files were skipped");

        let result = manager.force_reset(1, "operator reset");
        assert_eq!(result.to, RepoStatus::Idle);

        let snapshot = manager.snapshot(1);
        assert_eq!(snapshot.status, RepoStatus::Idle);
        assert!(snapshot.mount.is_none());
        assert!(snapshot.warning.is_none());
        assert_eq!(emitter.count(|e| matches!(e, Event::RepoForceReset { repo_id: 1 })), 1);
    }

    #[test]
    fn can_transition_to_consults_rules() {
        let (manager, _) = manager();
        assert_eq!(manager.can_transition_to(1, RepoStatus::BackingUp), (true, String::new()));

        manager.executor().validator().add_rule(
            "maintenance_window",
            Arc::new(|_, _, to| {
                if to == RepoStatus::Pruning {
                    Err("pruning paused".into())
                } else {
                    Ok(())
                }
            }),
        );
        let (ok, reason) = manager.can_transition_to(1, RepoStatus::Pruning);
        assert!(!ok);
        assert_eq!(reason, "business rule 'maintenance_window' failed: pruning paused");
        assert_eq!(manager.status(1), RepoStatus::Idle);

        manager.mount_repository(1, "/mnt/a", None).unwrap();
        let (ok, reason) = manager.can_transition_to(1, RepoStatus::Deleting);
        assert!(!ok);
        assert_eq!(reason, "transition from mounted to deleting is not allowed");
    }

    #[test]
    fn error_types_serialize_for_clients() {
        assert_eq!(
            serde_json::to_value(RepoErrorAction::RegenerateSsh).unwrap(),
            "regenerateSSH"
        );
        assert_eq!(serde_json::to_value(RepoErrorType::LockTimeout).unwrap(), "lockTimeout");
    }
}
