//! Persistence for repositories, profiles, schedules and notifications.

mod memory;
pub mod models;
mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use models::{BackupProfile, Repository};
pub use sqlite::SqliteStore;

use crate::notifications::{NewNotification, Notification};
use crate::schedule::policy::{BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy, RunRecord};
use crate::types::{BackupId, ProfileId, RepoId};

/// Storage seam shared by the scheduler, the runner and the API.
///
/// Saving a schedule or pruning rule always bumps its revision so armed
/// timers can tell they were superseded.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_repository(&self, repository: &Repository) -> Result<()>;
    async fn get_repository(&self, id: RepoId) -> Result<Option<Repository>>;
    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    async fn save_backup_profile(&self, profile: &BackupProfile) -> Result<()>;
    async fn get_backup_profile(&self, id: ProfileId) -> Result<Option<BackupProfile>>;
    async fn list_backup_profiles(&self) -> Result<Vec<BackupProfile>>;

    async fn save_backup_schedule(
        &self,
        profile_id: ProfileId,
        policy: &RecurrencePolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<BackupSchedule>;
    async fn get_backup_schedule(&self, id: i64) -> Result<Option<BackupSchedule>>;
    async fn backup_schedule_for_profile(&self, profile_id: ProfileId) -> Result<Option<BackupSchedule>>;
    async fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>>;
    async fn delete_backup_schedule(&self, profile_id: ProfileId) -> Result<bool>;
    async fn record_backup_run(&self, id: i64, run: &RunRecord) -> Result<()>;

    async fn save_pruning_rule(
        &self,
        profile_id: ProfileId,
        policy: &PruningPolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<PruningRule>;
    async fn get_pruning_rule(&self, id: i64) -> Result<Option<PruningRule>>;
    async fn pruning_rule_for_profile(&self, profile_id: ProfileId) -> Result<Option<PruningRule>>;
    async fn list_pruning_rules(&self) -> Result<Vec<PruningRule>>;
    async fn delete_pruning_rule(&self, profile_id: ProfileId) -> Result<bool>;
    async fn record_prune_run(&self, id: i64, run: &RunRecord) -> Result<()>;

    async fn add_notification(&self, notification: NewNotification) -> Result<Notification>;
    async fn list_notifications(
        &self,
        backup_id: Option<BackupId>,
        limit: usize,
    ) -> Result<Vec<Notification>>;
}
