use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{BackupProfile, Repository, Store};
use crate::notifications::{NewNotification, Notification};
use crate::schedule::policy::{BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy, RunRecord};
use crate::types::{BackupId, ProfileId, RepoId};

#[derive(Default)]
struct Tables {
    repositories: BTreeMap<RepoId, Repository>,
    profiles: BTreeMap<ProfileId, BackupProfile>,
    schedules: BTreeMap<i64, BackupSchedule>,
    pruning_rules: BTreeMap<i64, PruningRule>,
    notifications: Vec<Notification>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Non-persistent store used by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_repository(&self, repository: &Repository) -> Result<()> {
        self.tables
            .write()
            .repositories
            .insert(repository.id, repository.clone());
        Ok(())
    }

    async fn get_repository(&self, id: RepoId) -> Result<Option<Repository>> {
        Ok(self.tables.read().repositories.get(&id).cloned())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.tables.read().repositories.values().cloned().collect())
    }

    async fn save_backup_profile(&self, profile: &BackupProfile) -> Result<()> {
        self.tables.write().profiles.insert(profile.id, profile.clone());
        Ok(())
    }

    async fn get_backup_profile(&self, id: ProfileId) -> Result<Option<BackupProfile>> {
        Ok(self.tables.read().profiles.get(&id).cloned())
    }

    async fn list_backup_profiles(&self) -> Result<Vec<BackupProfile>> {
        Ok(self.tables.read().profiles.values().cloned().collect())
    }

    async fn save_backup_schedule(
        &self,
        profile_id: ProfileId,
        policy: &RecurrencePolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<BackupSchedule> {
        let mut tables = self.tables.write();
        let existing = tables
            .schedules
            .values_mut()
            .find(|s| s.backup_profile_id == profile_id);
        if let Some(schedule) = existing {
            schedule.policy = policy.clone();
            schedule.revision += 1;
            schedule.next_run = next_run;
            return Ok(schedule.clone());
        }
        let schedule = BackupSchedule {
            id: tables.next_id(),
            backup_profile_id: profile_id,
            policy: policy.clone(),
            revision: 1,
            next_run,
            last_run: None,
            last_run_status: None,
        };
        tables.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_backup_schedule(&self, id: i64) -> Result<Option<BackupSchedule>> {
        Ok(self.tables.read().schedules.get(&id).cloned())
    }

    async fn backup_schedule_for_profile(&self, profile_id: ProfileId) -> Result<Option<BackupSchedule>> {
        Ok(self
            .tables
            .read()
            .schedules
            .values()
            .find(|s| s.backup_profile_id == profile_id)
            .cloned())
    }

    async fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>> {
        Ok(self.tables.read().schedules.values().cloned().collect())
    }

    async fn delete_backup_schedule(&self, profile_id: ProfileId) -> Result<bool> {
        let mut tables = self.tables.write();
        let before = tables.schedules.len();
        tables.schedules.retain(|_, s| s.backup_profile_id != profile_id);
        Ok(tables.schedules.len() != before)
    }

    async fn record_backup_run(&self, id: i64, run: &RunRecord) -> Result<()> {
        if let Some(schedule) = self.tables.write().schedules.get_mut(&id) {
            schedule.last_run = Some(run.last_run);
            schedule.last_run_status = Some(run.last_run_status.clone());
            schedule.next_run = run.next_run;
        }
        Ok(())
    }

    async fn save_pruning_rule(
        &self,
        profile_id: ProfileId,
        policy: &PruningPolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<PruningRule> {
        let mut tables = self.tables.write();
        let existing = tables
            .pruning_rules
            .values_mut()
            .find(|r| r.backup_profile_id == profile_id);
        if let Some(rule) = existing {
            rule.policy = policy.clone();
            rule.revision += 1;
            rule.next_run = next_run;
            return Ok(rule.clone());
        }
        let rule = PruningRule {
            id: tables.next_id(),
            backup_profile_id: profile_id,
            policy: policy.clone(),
            revision: 1,
            next_run,
            last_run: None,
            last_run_status: None,
        };
        tables.pruning_rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get_pruning_rule(&self, id: i64) -> Result<Option<PruningRule>> {
        Ok(self.tables.read().pruning_rules.get(&id).cloned())
    }

    async fn pruning_rule_for_profile(&self, profile_id: ProfileId) -> Result<Option<PruningRule>> {
        Ok(self
            .tables
            .read()
            .pruning_rules
            .values()
            .find(|r| r.backup_profile_id == profile_id)
            .cloned())
    }

    async fn list_pruning_rules(&self) -> Result<Vec<PruningRule>> {
        Ok(self.tables.read().pruning_rules.values().cloned().collect())
    }

    async fn delete_pruning_rule(&self, profile_id: ProfileId) -> Result<bool> {
        let mut tables = self.tables.write();
        let before = tables.pruning_rules.len();
        tables.pruning_rules.retain(|_, r| r.backup_profile_id != profile_id);
        Ok(tables.pruning_rules.len() != before)
    }

    async fn record_prune_run(&self, id: i64, run: &RunRecord) -> Result<()> {
        if let Some(rule) = self.tables.write().pruning_rules.get_mut(&id) {
            rule.last_run = Some(run.last_run);
            rule.last_run_status = Some(run.last_run_status.clone());
            rule.next_run = run.next_run;
        }
        Ok(())
    }

    async fn add_notification(&self, notification: NewNotification) -> Result<Notification> {
        let mut tables = self.tables.write();
        let saved = Notification {
            id: tables.next_id(),
            backup_id: notification.backup_id,
            level: notification.level,
            message: notification.message,
            action: notification.action,
            created_at: Utc::now(),
        };
        tables.notifications.push(saved.clone());
        Ok(saved)
    }

    async fn list_notifications(
        &self,
        backup_id: Option<BackupId>,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        Ok(self
            .tables
            .read()
            .notifications
            .iter()
            .rev()
            .filter(|n| backup_id.is_none() || n.backup_id == backup_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
