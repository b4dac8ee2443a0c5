use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::state::OperationKind;
use crate::types::{BackupId, RepoId};

/// Notifications emitted by the core. Delivery is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    RepoStateChanged { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    OperationStarted { repo_id: RepoId, kind: OperationKind },
    #[serde(rename_all = "camelCase")]
    OperationCompleted { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    OperationFailed { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    RepoMounted { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    RepoUnmounted { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    RepoRecovered { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    RepoForceReset { repo_id: RepoId },
    #[serde(rename_all = "camelCase")]
    BackupStateChanged { backup_id: BackupId },
    #[serde(rename_all = "camelCase")]
    PruneStateChanged { backup_id: BackupId },
    ScheduleChanged,
    NotificationAvailable,
}

impl Event {
    /// Topic string, e.g. `repoStateChanged:3` or `backupStateChanged:1-3`.
    pub fn topic(&self) -> String {
        match self {
            Event::RepoStateChanged { repo_id } => format!("repoStateChanged:{}", repo_id),
            Event::OperationStarted { repo_id, kind } => {
                format!("repoOperationStarted:{}:{}", repo_id, kind)
            }
            Event::OperationCompleted { repo_id } => format!("repoOperationCompleted:{}", repo_id),
            Event::OperationFailed { repo_id } => format!("repoOperationFailed:{}", repo_id),
            Event::RepoMounted { repo_id } => format!("repoMounted:{}", repo_id),
            Event::RepoUnmounted { repo_id } => format!("repoUnmounted:{}", repo_id),
            Event::RepoRecovered { repo_id } => format!("repoRecovered:{}", repo_id),
            Event::RepoForceReset { repo_id } => format!("repoForceReset:{}", repo_id),
            Event::BackupStateChanged { backup_id } => format!(
                "backupStateChanged:{}-{}",
                backup_id.backup_profile_id, backup_id.repository_id
            ),
            Event::PruneStateChanged { backup_id } => format!(
                "pruneStateChanged:{}-{}",
                backup_id.backup_profile_id, backup_id.repository_id
            ),
            Event::ScheduleChanged => "scheduleChanged".to_string(),
            Event::NotificationAvailable => "notificationAvailable".to_string(),
        }
    }
}

/// Transport-agnostic sink for core events.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: Event);
}

/// Fans events out to any number of subscribers (WebSocket clients, tests).
#[derive(Clone)]
pub struct BroadcastEmitter {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEmitter {
    fn emit(&self, event: Event) {
        trace!(topic = %event.topic(), "Emitting event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Drops every event.
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: Event) {}
}

/// Keeps every emitted event in memory. Used by tests and diagnostics.
#[derive(Clone, Default)]
pub struct RecordingEmitter {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_carry_identifiers() {
        assert_eq!(
            Event::RepoStateChanged { repo_id: 3 }.topic(),
            "repoStateChanged:3"
        );
        assert_eq!(
            Event::BackupStateChanged {
                backup_id: BackupId::new(1, 3)
            }
            .topic(),
            "backupStateChanged:1-3"
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let emitter = BroadcastEmitter::new(8);
        let mut rx = emitter.subscribe();
        emitter.emit(Event::ScheduleChanged);
        assert_eq!(rx.recv().await.unwrap(), Event::ScheduleChanged);
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        let emitter = BroadcastEmitter::new(8);
        emitter.emit(Event::NotificationAvailable);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(Event::RepoMounted { repo_id: 7 }).unwrap();
        assert_eq!(json["type"], "repoMounted");
        assert_eq!(json["repoId"], 7);
    }
}
