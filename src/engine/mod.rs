//! The backup engine seam.
//!
//! Every operation takes a cancellation token; cancelling it must stop the
//! underlying process promptly and yield [`EngineError::Cancelled`].

pub mod borg;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::schedule::policy::PruningPolicy;
use crate::storage::{BackupProfile, Repository};

pub use borg::BorgEngine;

/// A finished engine call. `warning` is set when the engine succeeded but
/// reported something the user should see.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed<T> {
    pub value: T,
    pub warning: Option<String>,
}

impl<T> Completed<T> {
    pub fn ok(value: T) -> Self {
        Self { value, warning: None }
    }

    pub fn with_warning(value: T, warning: impl Into<String>) -> Self {
        Self {
            value,
            warning: Some(warning.into()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("repository is locked: {0}")]
    LockTimeout(String),

    #[error("repository lock error: {0}")]
    Lock(String),

    #[error("wrong passphrase: {0}")]
    Passphrase(String),

    #[error("ssh authentication failed: {0}")]
    SshKey(String),

    #[error("repository does not exist: {0}")]
    RepositoryMissing(String),

    #[error("{message} (exit code {exit_code})")]
    Failed { exit_code: i32, message: String },

    #[error("failed to run backup engine: {0}")]
    Spawn(String),

    #[error("unexpected engine output: {0}")]
    Output(String),
}

pub type EngineResult<T> = Result<Completed<T>, EngineError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub total_files: u64,
    pub processed_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub name: String,
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub total_size: u64,
    pub total_compressed_size: u64,
    pub unique_compressed_size: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneSummary {
    pub pruned: Vec<String>,
    pub kept: Vec<String>,
}

#[async_trait]
pub trait BackupEngine: Send + Sync {
    async fn init(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()>;

    /// Creates an archive and returns its name. Progress samples are sent
    /// on `progress`; the sender is dropped when the call returns.
    async fn create(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        profile: &BackupProfile,
        progress: mpsc::Sender<BackupProgress>,
    ) -> EngineResult<String>;

    async fn list(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<Vec<ArchiveInfo>>;

    async fn prune(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        prefix: &str,
        policy: &PruningPolicy,
        dry_run: bool,
    ) -> EngineResult<PruneSummary>;

    async fn info(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<RepositoryInfo>;

    async fn mount_repository(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        mount_path: &Path,
    ) -> EngineResult<()>;

    async fn mount_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
        mount_path: &Path,
    ) -> EngineResult<()>;

    async fn umount(&self, cancel: &CancellationToken, mount_path: &Path) -> EngineResult<()>;

    async fn break_lock(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()>;

    async fn delete_repository(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()>;

    async fn delete_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
    ) -> EngineResult<()>;

    async fn rename(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
        new_name: &str,
    ) -> EngineResult<()>;
}
