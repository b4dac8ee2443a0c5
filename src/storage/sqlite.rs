use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use super::{BackupProfile, Repository, Store};
use crate::notifications::{NewNotification, Notification, NotificationAction, NotificationLevel};
use crate::schedule::policy::{BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy, RunRecord};
use crate::types::{BackupId, ProfileId, RepoId};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create database directory if it doesn't exist
        if !database_url.contains(":memory:") {
            let path = database_url
                .strip_prefix("sqlite://")
                .or_else(|| database_url.strip_prefix("sqlite:"))
                .unwrap_or(database_url);
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {}", database_url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_profiles (
                id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_profile_id INTEGER NOT NULL UNIQUE,
                policy TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                next_run BIGINT,
                last_run BIGINT,
                last_run_status TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pruning_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_profile_id INTEGER NOT NULL UNIQUE,
                policy TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                next_run BIGINT,
                last_run BIGINT,
                last_run_status TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backup_profile_id INTEGER,
                repository_id INTEGER,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                action TEXT,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_backup ON notifications(backup_profile_id, repository_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_json(&self, table: &str, id: i64, data: String) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (id, data, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, table: &str, id: i64) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {table} WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        if let Some(row) = row {
            let data: String = row.get("data");
            Ok(Some(serde_json::from_str(&data)?))
        } else {
            Ok(None)
        }
    }

    async fn list_json<T: serde::de::DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let sql = format!("SELECT data FROM {table} ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<T> {
                let data: String = row.get("data");
                Ok(serde_json::from_str(&data)?)
            })
            .collect()
    }

    async fn upsert_timed(
        &self,
        table: &str,
        profile_id: ProfileId,
        policy: String,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let sql = format!(
            r#"
            INSERT INTO {table} (backup_profile_id, policy, revision, next_run)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(backup_profile_id) DO UPDATE SET
                policy = excluded.policy,
                revision = {table}.revision + 1,
                next_run = excluded.next_run
            "#
        );
        sqlx::query(&sql)
            .bind(profile_id)
            .bind(&policy)
            .bind(next_run.map(to_millis))
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(&format!("SELECT id FROM {table} WHERE backup_profile_id = ?1"))
            .bind(profile_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    async fn record_run(&self, table: &str, id: i64, run: &RunRecord) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET last_run = ?1, last_run_status = ?2, next_run = ?3 WHERE id = ?4"
        );
        sqlx::query(&sql)
            .bind(to_millis(run.last_run))
            .bind(&run.last_run_status)
            .bind(run.next_run.map(to_millis))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_for_profile(&self, table: &str, profile_id: ProfileId) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE backup_profile_id = ?1"))
            .bind(profile_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

const SCHEDULE_COLUMNS: &str =
    "id, backup_profile_id, policy, revision, next_run, last_run, last_run_status";

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn schedule_from_row(row: &SqliteRow) -> Result<BackupSchedule> {
    let policy: String = row.get("policy");
    Ok(BackupSchedule {
        id: row.get("id"),
        backup_profile_id: row.get("backup_profile_id"),
        policy: serde_json::from_str::<RecurrencePolicy>(&policy)?,
        revision: row.get("revision"),
        next_run: from_millis(row.get("next_run")),
        last_run: from_millis(row.get("last_run")),
        last_run_status: row.get("last_run_status"),
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<PruningRule> {
    let policy: String = row.get("policy");
    Ok(PruningRule {
        id: row.get("id"),
        backup_profile_id: row.get("backup_profile_id"),
        policy: serde_json::from_str::<PruningPolicy>(&policy)?,
        revision: row.get("revision"),
        next_run: from_millis(row.get("next_run")),
        last_run: from_millis(row.get("last_run")),
        last_run_status: row.get("last_run_status"),
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let level: String = row.get("level");
    let action: Option<String> = row.get("action");
    let profile_id: Option<i64> = row.get("backup_profile_id");
    let repository_id: Option<i64> = row.get("repository_id");
    let created_at: i64 = row.get("created_at");

    Ok(Notification {
        id: row.get("id"),
        backup_id: profile_id
            .zip(repository_id)
            .map(|(profile, repo)| BackupId::new(profile, repo)),
        level: NotificationLevel::parse(&level)
            .with_context(|| format!("unknown notification level {}", level))?,
        message: row.get("message"),
        action: action.as_deref().and_then(NotificationAction::parse),
        created_at: from_millis(Some(created_at)).unwrap_or_else(Utc::now),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_repository(&self, repository: &Repository) -> Result<()> {
        self.save_json("repositories", repository.id, serde_json::to_string(repository)?)
            .await
    }

    async fn get_repository(&self, id: RepoId) -> Result<Option<Repository>> {
        self.load_json("repositories", id).await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        self.list_json("repositories").await
    }

    async fn save_backup_profile(&self, profile: &BackupProfile) -> Result<()> {
        self.save_json("backup_profiles", profile.id, serde_json::to_string(profile)?)
            .await
    }

    async fn get_backup_profile(&self, id: ProfileId) -> Result<Option<BackupProfile>> {
        self.load_json("backup_profiles", id).await
    }

    async fn list_backup_profiles(&self) -> Result<Vec<BackupProfile>> {
        self.list_json("backup_profiles").await
    }

    async fn save_backup_schedule(
        &self,
        profile_id: ProfileId,
        policy: &RecurrencePolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<BackupSchedule> {
        let id = self
            .upsert_timed("backup_schedules", profile_id, serde_json::to_string(policy)?, next_run)
            .await?;
        self.get_backup_schedule(id)
            .await?
            .context("backup schedule vanished after save")
    }

    async fn get_backup_schedule(&self, id: i64) -> Result<Option<BackupSchedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn backup_schedule_for_profile(&self, profile_id: ProfileId) -> Result<Option<BackupSchedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE backup_profile_id = ?1");
        let row = sqlx::query(&sql)
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_backup_schedules(&self) -> Result<Vec<BackupSchedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM backup_schedules ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn delete_backup_schedule(&self, profile_id: ProfileId) -> Result<bool> {
        self.delete_for_profile("backup_schedules", profile_id).await
    }

    async fn record_backup_run(&self, id: i64, run: &RunRecord) -> Result<()> {
        self.record_run("backup_schedules", id, run).await
    }

    async fn save_pruning_rule(
        &self,
        profile_id: ProfileId,
        policy: &PruningPolicy,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<PruningRule> {
        let id = self
            .upsert_timed("pruning_rules", profile_id, serde_json::to_string(policy)?, next_run)
            .await?;
        self.get_pruning_rule(id)
            .await?
            .context("pruning rule vanished after save")
    }

    async fn get_pruning_rule(&self, id: i64) -> Result<Option<PruningRule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM pruning_rules WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn pruning_rule_for_profile(&self, profile_id: ProfileId) -> Result<Option<PruningRule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM pruning_rules WHERE backup_profile_id = ?1");
        let row = sqlx::query(&sql)
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_pruning_rules(&self) -> Result<Vec<PruningRule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM pruning_rules ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn delete_pruning_rule(&self, profile_id: ProfileId) -> Result<bool> {
        self.delete_for_profile("pruning_rules", profile_id).await
    }

    async fn record_prune_run(&self, id: i64, run: &RunRecord) -> Result<()> {
        self.record_run("pruning_rules", id, run).await
    }

    async fn add_notification(&self, notification: NewNotification) -> Result<Notification> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (backup_profile_id, repository_id, level, message, action, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(notification.backup_id.map(|id| id.backup_profile_id))
        .bind(notification.backup_id.map(|id| id.repository_id))
        .bind(notification.level.as_str())
        .bind(&notification.message)
        .bind(notification.action.map(|a| a.as_str()))
        .bind(to_millis(created_at))
        .execute(&self.pool)
        .await?;

        Ok(Notification {
            id: result.last_insert_rowid(),
            backup_id: notification.backup_id,
            level: notification.level,
            message: notification.message,
            action: notification.action,
            created_at,
        })
    }

    async fn list_notifications(
        &self,
        backup_id: Option<BackupId>,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let rows = match backup_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM notifications
                    WHERE backup_profile_id = ?1 AND repository_id = ?2
                    ORDER BY id DESC LIMIT ?3
                    "#,
                )
                .bind(id.backup_profile_id)
                .bind(id.repository_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM notifications ORDER BY id DESC LIMIT ?1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(notification_from_row).collect()
    }
}
