use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::events::{Event, EventEmitter};
use crate::storage::Store;
use crate::types::BackupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(NotificationLevel::Info),
            "warning" => Some(NotificationLevel::Warning),
            "error" => Some(NotificationLevel::Error),
            _ => None,
        }
    }
}

/// Remediation offered to the user alongside a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationAction {
    UnlockRepository,
    #[serde(rename = "regenerateSSH")]
    RegenerateSsh,
}

impl NotificationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationAction::UnlockRepository => "unlockRepository",
            NotificationAction::RegenerateSsh => "regenerateSSH",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unlockRepository" => Some(NotificationAction::UnlockRepository),
            "regenerateSSH" => Some(NotificationAction::RegenerateSsh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub backup_id: Option<BackupId>,
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub backup_id: Option<BackupId>,
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
}

impl NewNotification {
    pub fn new(backup_id: Option<BackupId>, level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            backup_id,
            level,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Persists user-facing notifications and announces them.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
    emitter: Arc<dyn EventEmitter>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { store, emitter }
    }

    /// Never fails; a storage error is logged and the notification dropped.
    pub async fn notify(&self, notification: NewNotification) {
        match notification.level {
            NotificationLevel::Info => info!(backup_id = ?notification.backup_id, "{}", notification.message),
            NotificationLevel::Warning => warn!(backup_id = ?notification.backup_id, "{}", notification.message),
            NotificationLevel::Error => error!(backup_id = ?notification.backup_id, "{}", notification.message),
        }

        if let Err(e) = self.store.add_notification(notification).await {
            error!("Failed to save notification: {}", e);
            return;
        }
        self.emitter.emit(Event::NotificationAvailable);
    }

    pub async fn warning(&self, backup_id: Option<BackupId>, message: impl Into<String>) {
        self.notify(NewNotification::new(backup_id, NotificationLevel::Warning, message))
            .await;
    }

    pub async fn error(&self, backup_id: Option<BackupId>, message: impl Into<String>) {
        self.notify(NewNotification::new(backup_id, NotificationLevel::Error, message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEmitter;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn notify_persists_and_announces() {
        let store = Arc::new(MemoryStore::new());
        let emitter = RecordingEmitter::new();
        let notifier = Notifier::new(store.clone(), Arc::new(emitter.clone()));

        notifier
            .notify(
                NewNotification::new(Some(BackupId::new(1, 2)), NotificationLevel::Error, "locked")
                    .with_action(NotificationAction::UnlockRepository),
            )
            .await;

        let saved = store.list_notifications(None, 10).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].action, Some(NotificationAction::UnlockRepository));
        assert_eq!(emitter.events(), vec![Event::NotificationAvailable]);
    }

    #[test]
    fn level_and_action_names_round_trip() {
        for level in [NotificationLevel::Info, NotificationLevel::Warning, NotificationLevel::Error] {
            assert_eq!(NotificationLevel::parse(level.as_str()), Some(level));
        }
        for action in [NotificationAction::UnlockRepository, NotificationAction::RegenerateSsh] {
            assert_eq!(NotificationAction::parse(action.as_str()), Some(action));
            assert_eq!(serde_json::to_value(action).unwrap(), action.as_str());
        }
    }
}
