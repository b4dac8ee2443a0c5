use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::BackupProgress;
use crate::state::OperationKind;
use crate::types::{BackupId, RepoId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub kind: OperationKind,
    pub backup_id: BackupId,
}

impl JobKey {
    pub fn backup(backup_id: BackupId) -> Self {
        Self {
            kind: OperationKind::Backup,
            backup_id,
        }
    }

    pub fn prune(backup_id: BackupId) -> Self {
        Self {
            kind: OperationKind::Prune,
            backup_id,
        }
    }

    pub fn archive_delete(backup_id: BackupId) -> Self {
        Self {
            kind: OperationKind::Delete,
            backup_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[default]
    Idle,
    Waiting,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Running)
    }
}

/// What the backup button of a profile/repository pair should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonStatus {
    RunBackup,
    Waiting,
    Abort,
    Locked,
    Unmount,
    Busy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub status: JobStatus,

    /// Latest sample, backups only
    pub progress: Option<BackupProgress>,

    /// Why the job failed
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    snapshot: JobSnapshot,

    /// Present while the job is waiting or running
    cancel: Option<CancellationToken>,
}

/// Status of queued and running jobs, one slot per [`JobKey`].
#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<JobKey, JobEntry>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job as waiting. Returns false if it is already queued or
    /// running.
    pub fn claim(&self, key: JobKey, cancel: CancellationToken) -> bool {
        let mut jobs = self.jobs.write();
        if let Some(entry) = jobs.get(&key) {
            if entry.snapshot.status.is_active() {
                return false;
            }
        }
        jobs.insert(
            key,
            JobEntry {
                snapshot: JobSnapshot {
                    status: JobStatus::Waiting,
                    ..Default::default()
                },
                cancel: Some(cancel),
            },
        );
        true
    }

    pub fn set_running(&self, key: JobKey) {
        if let Some(entry) = self.jobs.write().get_mut(&key) {
            entry.snapshot.status = JobStatus::Running;
            entry.snapshot.started_at = Some(Utc::now());
        }
    }

    pub fn set_progress(&self, key: JobKey, progress: BackupProgress) {
        if let Some(entry) = self.jobs.write().get_mut(&key) {
            entry.snapshot.progress = Some(progress);
        }
    }

    pub fn finish(&self, key: JobKey, status: JobStatus, error: Option<String>) {
        let mut jobs = self.jobs.write();
        let entry = jobs.entry(key).or_insert_with(|| JobEntry {
            snapshot: JobSnapshot::default(),
            cancel: None,
        });
        entry.snapshot.status = status;
        entry.snapshot.error = error;
        entry.snapshot.finished_at = Some(Utc::now());
        entry.cancel = None;
    }

    /// Cancels a waiting or running job.
    pub fn cancel(&self, key: JobKey) -> bool {
        match self.jobs.read().get(&key) {
            Some(JobEntry {
                snapshot,
                cancel: Some(token),
            }) if snapshot.status.is_active() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancels every waiting or running job on one repository. Returns how
    /// many were signalled.
    pub fn cancel_repository(&self, repo_id: RepoId) -> usize {
        let jobs = self.jobs.read();
        let mut cancelled = 0;
        for (key, entry) in jobs.iter() {
            if key.backup_id.repository_id != repo_id || !entry.snapshot.status.is_active() {
                continue;
            }
            if let Some(token) = &entry.cancel {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn get(&self, key: JobKey) -> JobSnapshot {
        self.jobs
            .read()
            .get(&key)
            .map(|entry| entry.snapshot.clone())
            .unwrap_or_default()
    }

    pub fn active(&self) -> Vec<(JobKey, JobSnapshot)> {
        self.jobs
            .read()
            .iter()
            .filter(|(_, entry)| entry.snapshot.status.is_active())
            .map(|(key, entry)| (*key, entry.snapshot.clone()))
            .collect()
    }
}
