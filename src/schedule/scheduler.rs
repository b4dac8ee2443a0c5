use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::calc::{next_prune_run, next_run};
use super::policy::RunRecord;
use crate::runner::OperationQueue;
use crate::storage::{BackupProfile, Store};
use crate::types::{BackupId, ProfileId};

/// Delay before retrying a timer whose policy could not be loaded.
const RETRY_DELAY_MINUTES: i64 = 5;

/// Tells the scheduler that some policy changed. Signals sent while a
/// rebuild is pending collapse into one.
#[derive(Debug, Clone)]
pub struct ScheduleChangeSignal {
    tx: mpsc::Sender<()>,
}

impl ScheduleChangeSignal {
    pub fn notify(&self) {
        // A full channel already has a rebuild pending
        let _ = self.tx.try_send(());
    }
}

pub fn channel() -> (ScheduleChangeSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ScheduleChangeSignal { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerKind {
    Backup,
    Prune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerKey {
    pub kind: TimerKind,
    pub backup_id: BackupId,
}

impl TimerKey {
    pub fn backup(backup_id: BackupId) -> Self {
        Self {
            kind: TimerKind::Backup,
            backup_id,
        }
    }

    pub fn prune(backup_id: BackupId) -> Self {
        Self {
            kind: TimerKind::Prune,
            backup_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmedTimer {
    pub key: TimerKey,
    pub due: DateTime<Utc>,

    /// Schedule or pruning rule id the timer was armed from
    pub policy_id: i64,

    /// Policy revision at arm time; a mismatch on firing means superseded
    pub revision: i64,
}

struct Timer {
    armed: ArmedTimer,
    generation: u64,
    cancel: CancellationToken,
}

struct SchedulerInner {
    /// Source of truth for policies; re-read on every firing
    store: Arc<dyn Store>,

    /// Where due work is handed off
    queue: Arc<dyn OperationQueue>,

    /// Currently armed timers
    timers: Mutex<HashMap<TimerKey, Timer>>,

    /// Bumped on every rebuild so late re-arms from an older build are dropped
    generation: AtomicU64,

    /// Serializes rebuilds
    rebuild: tokio::sync::Mutex<()>,

    shutdown: CancellationToken,
}

/// Keeps one timer armed per scheduled profile/repository pair.
///
/// Timers only hand work to the [`OperationQueue`]; cancelling a timer
/// never touches an operation that is already running.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn OperationQueue>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                queue,
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                rebuild: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Arms all timers, then rebuilds them on every change signal until
    /// shutdown or until every signal sender is gone.
    pub fn start(&self, mut changes: mpsc::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("Scheduler started");
            loop {
                match scheduler.rebuild().await {
                    Ok(armed) => info!(armed, "Schedules rebuilt"),
                    Err(e) => error!("Failed to rebuild schedules: {:#}", e),
                }
                tokio::select! {
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                    }
                    _ = scheduler.inner.shutdown.cancelled() => break,
                }
            }
            scheduler.cancel_all();
            info!("Scheduler stopped");
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        let mut armed: Vec<_> = self
            .inner
            .timers
            .lock()
            .values()
            .map(|timer| timer.armed.clone())
            .collect();
        armed.sort_by_key(|timer| timer.due);
        armed
    }

    /// Cancels every armed timer and arms fresh ones from the persisted
    /// policies. Returns the number of timers armed.
    pub async fn rebuild(&self) -> anyhow::Result<usize> {
        let _serial = self.inner.rebuild.lock().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_all();

        let now = Utc::now();
        let store = &self.inner.store;
        let profiles: HashMap<ProfileId, BackupProfile> = store
            .list_backup_profiles()
            .await?
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();
        let mut armed = 0;

        for schedule in store.list_backup_schedules().await? {
            let Some(profile) = profiles.get(&schedule.backup_profile_id) else {
                warn!(profile_id = schedule.backup_profile_id, "Schedule for unknown profile ignored");
                continue;
            };
            let Some(due) = next_run(&schedule.policy, now) else {
                debug!(profile_id = profile.id, "Backup schedule disabled");
                continue;
            };
            for repo_id in &profile.repository_ids {
                let key = TimerKey::backup(BackupId::new(profile.id, *repo_id));
                self.arm(generation, key, schedule.id, schedule.revision, due);
                armed += 1;
            }
        }

        for rule in store.list_pruning_rules().await? {
            if !rule.policy.enabled {
                continue;
            }
            let Some(profile) = profiles.get(&rule.backup_profile_id) else {
                warn!(profile_id = rule.backup_profile_id, "Pruning rule for unknown profile ignored");
                continue;
            };
            let due = next_prune_run(self.backup_next_run(profile.id, now).await, now);
            for repo_id in &profile.repository_ids {
                let key = TimerKey::prune(BackupId::new(profile.id, *repo_id));
                self.arm(generation, key, rule.id, rule.revision, due);
                armed += 1;
            }
        }

        Ok(armed)
    }

    fn arm(&self, generation: u64, key: TimerKey, policy_id: i64, revision: i64, due: DateTime<Utc>) {
        let cancel = self.inner.shutdown.child_token();
        let timer = Timer {
            armed: ArmedTimer {
                key,
                due,
                policy_id,
                revision,
            },
            generation,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.inner.timers.lock().insert(key, timer) {
            previous.cancel.cancel();
        }
        debug!(backup_id = %key.backup_id, kind = ?key.kind, %due, "Timer armed");

        let scheduler = self.clone();
        tokio::spawn(async move {
            let wait = (due - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
            scheduler.fire(generation, key, policy_id, revision).await;
        });
    }

    async fn fire(&self, generation: u64, key: TimerKey, policy_id: i64, revision: i64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!(backup_id = %key.backup_id, "Timer from an older rebuild ignored");
            return;
        }
        info!(backup_id = %key.backup_id, kind = ?key.kind, "Timer fired");
        match key.kind {
            TimerKind::Backup => self.fire_backup(generation, key, policy_id, revision).await,
            TimerKind::Prune => self.fire_prune(generation, key, policy_id, revision).await,
        }
    }

    async fn fire_backup(&self, generation: u64, key: TimerKey, schedule_id: i64, revision: i64) {
        let store = &self.inner.store;
        let current = match store.get_backup_schedule(schedule_id).await {
            Ok(Some(schedule)) if schedule.revision == revision && schedule.policy.is_enabled() => schedule,
            Ok(_) => {
                debug!(backup_id = %key.backup_id, "Backup schedule changed or removed, skipping");
                self.disarm(key, generation);
                return;
            }
            Err(e) => {
                error!(backup_id = %key.backup_id, "Failed to load backup schedule: {:#}", e);
                self.retry_later(generation, key, schedule_id, revision);
                return;
            }
        };

        let status = match self.inner.queue.queue_backup(key.backup_id).await {
            Ok(()) => "started".to_string(),
            Err(e) => {
                warn!(backup_id = %key.backup_id, "Scheduled backup not started: {:#}", e);
                format!("error: {:#}", e)
            }
        };

        let now = Utc::now();
        let latest = match store.get_backup_schedule(schedule_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(backup_id = %key.backup_id, "Failed to re-read backup schedule: {:#}", e);
                Some(current)
            }
        };
        let next = latest.as_ref().and_then(|s| next_run(&s.policy, now));
        let record = RunRecord {
            last_run: now,
            last_run_status: status,
            next_run: next,
        };
        if let Err(e) = store.record_backup_run(schedule_id, &record).await {
            error!(backup_id = %key.backup_id, "Failed to record backup run: {:#}", e);
        }

        match (latest, next) {
            (Some(latest), Some(next)) if latest.revision == revision => {
                self.rearm(generation, key, schedule_id, revision, next)
            }
            _ => self.disarm(key, generation),
        }
    }

    async fn fire_prune(&self, generation: u64, key: TimerKey, rule_id: i64, revision: i64) {
        let store = &self.inner.store;
        let current = match store.get_pruning_rule(rule_id).await {
            Ok(Some(rule)) if rule.revision == revision && rule.policy.enabled => rule,
            Ok(_) => {
                debug!(backup_id = %key.backup_id, "Pruning rule changed or removed, skipping");
                self.disarm(key, generation);
                return;
            }
            Err(e) => {
                error!(backup_id = %key.backup_id, "Failed to load pruning rule: {:#}", e);
                self.retry_later(generation, key, rule_id, revision);
                return;
            }
        };

        let status = match self.inner.queue.queue_prune(key.backup_id).await {
            Ok(()) => "started".to_string(),
            Err(e) => {
                warn!(backup_id = %key.backup_id, "Scheduled prune not started: {:#}", e);
                format!("error: {:#}", e)
            }
        };

        let now = Utc::now();
        let latest = match store.get_pruning_rule(rule_id).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(backup_id = %key.backup_id, "Failed to re-read pruning rule: {:#}", e);
                Some(current)
            }
        };
        let next = match &latest {
            Some(rule) if rule.policy.enabled => {
                Some(next_prune_run(self.backup_next_run(rule.backup_profile_id, now).await, now))
            }
            _ => None,
        };
        let record = RunRecord {
            last_run: now,
            last_run_status: status,
            next_run: next,
        };
        if let Err(e) = store.record_prune_run(rule_id, &record).await {
            error!(backup_id = %key.backup_id, "Failed to record prune run: {:#}", e);
        }

        match (latest, next) {
            (Some(latest), Some(next)) if latest.revision == revision => {
                self.rearm(generation, key, rule_id, revision, next)
            }
            _ => self.disarm(key, generation),
        }
    }

    /// Next backup of a profile, preferring the persisted value while it is
    /// still ahead of `now`.
    async fn backup_next_run(&self, profile_id: ProfileId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.inner.store.backup_schedule_for_profile(profile_id).await {
            Ok(Some(schedule)) if schedule.policy.is_enabled() => schedule
                .next_run
                .filter(|at| *at > now)
                .or_else(|| next_run(&schedule.policy, now)),
            Ok(_) => None,
            Err(e) => {
                warn!(profile_id, "Failed to load backup schedule: {:#}", e);
                None
            }
        }
    }

    fn rearm(&self, generation: u64, key: TimerKey, policy_id: i64, revision: i64, due: DateTime<Utc>) {
        if self.inner.generation.load(Ordering::SeqCst) != generation || self.inner.shutdown.is_cancelled() {
            return;
        }
        self.arm(generation, key, policy_id, revision, due);
    }

    fn retry_later(&self, generation: u64, key: TimerKey, policy_id: i64, revision: i64) {
        let due = Utc::now() + chrono::Duration::minutes(RETRY_DELAY_MINUTES);
        self.rearm(generation, key, policy_id, revision, due);
    }

    fn disarm(&self, key: TimerKey, generation: u64) {
        let mut timers = self.inner.timers.lock();
        if timers.get(&key).map(|t| t.generation) == Some(generation) {
            timers.remove(&key);
        }
    }

    fn cancel_all(&self) {
        for (_, timer) in self.inner.timers.lock().drain() {
            timer.cancel.cancel();
        }
    }

    /// Fires an armed timer immediately.
    #[cfg(test)]
    async fn fire_now(&self, key: TimerKey) {
        let timer = self.inner.timers.lock().remove(&key);
        let timer = timer.unwrap_or_else(|| panic!("no timer armed for {:?}", key));
        timer.cancel.cancel();
        self.fire(timer.generation, key, timer.armed.policy_id, timer.armed.revision)
            .await;
    }
}
