use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::calc::{next_prune_run, next_run};
use super::error::{Result, ScheduleError};
use super::policy::{BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy};
use super::scheduler::ScheduleChangeSignal;
use crate::events::{Event, EventEmitter};
use crate::storage::Store;
use crate::types::ProfileId;

/// Validates and persists schedule edits. Every successful edit signals the
/// scheduler and announces `scheduleChanged`.
#[derive(Clone)]
pub struct ScheduleService {
    store: Arc<dyn Store>,
    signal: ScheduleChangeSignal,
    emitter: Arc<dyn EventEmitter>,
}

impl ScheduleService {
    pub fn new(store: Arc<dyn Store>, signal: ScheduleChangeSignal, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            store,
            signal,
            emitter,
        }
    }

    pub async fn save_backup_schedule(
        &self,
        profile_id: ProfileId,
        policy: RecurrencePolicy,
    ) -> Result<BackupSchedule> {
        policy.validate()?;
        self.ensure_profile(profile_id).await?;

        let next = next_run(&policy, Utc::now());
        let schedule = self
            .store
            .save_backup_schedule(profile_id, &policy, next)
            .await?;
        info!(profile_id, revision = schedule.revision, "Backup schedule saved");
        self.changed();
        Ok(schedule)
    }

    pub async fn delete_backup_schedule(&self, profile_id: ProfileId) -> Result<bool> {
        let deleted = self.store.delete_backup_schedule(profile_id).await?;
        if deleted {
            info!(profile_id, "Backup schedule deleted");
            self.changed();
        }
        Ok(deleted)
    }

    pub async fn backup_schedule(&self, profile_id: ProfileId) -> Result<Option<BackupSchedule>> {
        Ok(self.store.backup_schedule_for_profile(profile_id).await?)
    }

    pub async fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>> {
        Ok(self.store.list_backup_schedules().await?)
    }

    pub async fn save_pruning_rule(
        &self,
        profile_id: ProfileId,
        policy: PruningPolicy,
    ) -> Result<PruningRule> {
        policy.validate()?;
        self.ensure_profile(profile_id).await?;

        let now = Utc::now();
        let next = if policy.enabled {
            let backup_next = self
                .store
                .backup_schedule_for_profile(profile_id)
                .await?
                .and_then(|schedule| next_run(&schedule.policy, now));
            Some(next_prune_run(backup_next, now))
        } else {
            None
        };
        let rule = self.store.save_pruning_rule(profile_id, &policy, next).await?;
        info!(profile_id, revision = rule.revision, "Pruning rule saved");
        self.changed();
        Ok(rule)
    }

    pub async fn delete_pruning_rule(&self, profile_id: ProfileId) -> Result<bool> {
        let deleted = self.store.delete_pruning_rule(profile_id).await?;
        if deleted {
            info!(profile_id, "Pruning rule deleted");
            self.changed();
        }
        Ok(deleted)
    }

    pub async fn pruning_rule(&self, profile_id: ProfileId) -> Result<Option<PruningRule>> {
        Ok(self.store.pruning_rule_for_profile(profile_id).await?)
    }

    async fn ensure_profile(&self, profile_id: ProfileId) -> Result<()> {
        match self.store.get_backup_profile(profile_id).await? {
            Some(_) => Ok(()),
            None => Err(ScheduleError::ProfileNotFound(profile_id)),
        }
    }

    fn changed(&self) {
        self.signal.notify();
        self.emitter.emit(Event::ScheduleChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEmitter;
    use crate::schedule::scheduler::channel;
    use crate::storage::{BackupProfile, MemoryStore};
    use chrono::NaiveTime;

    async fn setup() -> (ScheduleService, tokio::sync::mpsc::Receiver<()>, RecordingEmitter) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_backup_profile(&BackupProfile {
                id: 3,
                name: "documents".to_string(),
                prefix: "docs-".to_string(),
                backup_paths: vec!["/home/docs".to_string()],
                exclude_paths: vec![],
                repository_ids: vec![1],
            })
            .await
            .unwrap();
        let (signal, rx) = channel();
        let emitter = RecordingEmitter::new();
        let service = ScheduleService::new(store, signal, Arc::new(emitter.clone()));
        (service, rx, emitter)
    }

    #[tokio::test]
    async fn saving_a_schedule_signals_and_announces() {
        let (service, mut rx, emitter) = setup().await;

        let schedule = service
            .save_backup_schedule(3, RecurrencePolicy::MinuteInterval { interval_minutes: 30 })
            .await
            .unwrap();

        assert_eq!(schedule.revision, 1);
        assert!(schedule.next_run.unwrap() > Utc::now());
        assert!(rx.try_recv().is_ok());
        assert_eq!(emitter.events(), vec![Event::ScheduleChanged]);

        let edited = service
            .save_backup_schedule(3, RecurrencePolicy::Hourly)
            .await
            .unwrap();
        assert_eq!(edited.id, schedule.id);
        assert_eq!(edited.revision, 2);
    }

    #[tokio::test]
    async fn invalid_edits_change_nothing() {
        let (service, mut rx, emitter) = setup().await;

        let err = service
            .save_backup_schedule(3, RecurrencePolicy::MinuteInterval { interval_minutes: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPolicy(_)));

        let err = service
            .save_backup_schedule(99, RecurrencePolicy::Hourly)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::ProfileNotFound(99)));

        let err = service
            .save_pruning_rule(
                3,
                PruningPolicy {
                    enabled: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPolicy(_)));

        assert!(rx.try_recv().is_err());
        assert!(emitter.events().is_empty());
        assert!(service.backup_schedule(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pruning_rule_trails_the_backup() {
        let (service, _rx, _emitter) = setup().await;
        let backup = service
            .save_backup_schedule(
                3,
                RecurrencePolicy::Daily {
                    at: NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
                },
            )
            .await
            .unwrap();

        let rule = service
            .save_pruning_rule(
                3,
                PruningPolicy {
                    enabled: true,
                    keep_daily: 7,
                    keep_weekly: 4,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(rule.next_run.unwrap() > backup.next_run.unwrap());
    }

    #[tokio::test]
    async fn deleting_a_missing_policy_is_quiet() {
        let (service, mut rx, _emitter) = setup().await;

        assert!(!service.delete_backup_schedule(3).await.unwrap());
        assert!(rx.try_recv().is_err());

        service
            .save_backup_schedule(3, RecurrencePolicy::Hourly)
            .await
            .unwrap();
        let _ = rx.try_recv();
        assert!(service.delete_backup_schedule(3).await.unwrap());
        assert!(rx.try_recv().is_ok());
        assert!(service.backup_schedule(3).await.unwrap().is_none());
    }
}
