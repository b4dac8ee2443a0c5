use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::events::BroadcastEmitter;
use crate::runner::OperationRunner;
use crate::schedule::{ScheduleService, Scheduler};
use crate::state::{StateTransition, TransitionStats};
use crate::storage::Store;

mod backups;
pub mod error;
mod repositories;
mod schedules;

pub use error::{ApiError, ApiResult};

/// Shared handles for every handler.
#[derive(Clone)]
pub struct AppState {
    pub runner: OperationRunner,
    pub schedules: ScheduleService,
    pub scheduler: Scheduler,
    pub store: Arc<dyn Store>,
    pub events: BroadcastEmitter,
}

/// The full application: REST under `/api`, the event stream under `/ws`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes())
        .nest("/ws", crate::web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/repositories", repositories::routes())
        .merge(backups::routes())
        .merge(schedules::routes())
        .route("/history", get(recent_history))
        .route("/history/stats", get(history_stats))
}

async fn recent_history(
    State(state): State<AppState>,
    Query(query): Query<repositories::LimitQuery>,
) -> Json<Vec<StateTransition>> {
    Json(state.runner.state().history().recent(query.limit))
}

async fn history_stats(State(state): State<AppState>) -> Json<TransitionStats> {
    Json(state.runner.state().history().stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::events::EventEmitter;
    use crate::locks::LockRegistry;
    use crate::schedule::scheduler::channel;
    use crate::state::RepositoryStateManager;
    use crate::storage::{BackupProfile, MemoryStore, Repository};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app(engine_delay: Duration) -> Router {
        let store = Arc::new(MemoryStore::new());
        store
            .save_repository(&Repository {
                id: 1,
                name: "nas".to_string(),
                location: "ssh://backup@nas/./borg".to_string(),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        store
            .save_backup_profile(&BackupProfile {
                id: 1,
                name: "home".to_string(),
                prefix: "home-".to_string(),
                backup_paths: vec!["/home".to_string()],
                exclude_paths: vec![],
                repository_ids: vec![1],
            })
            .await
            .unwrap();

        let events = BroadcastEmitter::new(64);
        let emitter: Arc<dyn EventEmitter> = Arc::new(events.clone());
        let runner = OperationRunner::new(
            Arc::new(RepositoryStateManager::new(100, emitter.clone())),
            Arc::new(LockRegistry::new()),
            Arc::new(FakeEngine::new(engine_delay)),
            store.clone(),
            emitter.clone(),
            16,
        );
        let (signal, _rx) = channel();
        let state = AppState {
            scheduler: Scheduler::new(store.clone(), Arc::new(runner.clone())),
            schedules: ScheduleService::new(store.clone(), signal, emitter),
            runner,
            store,
            events,
        };
        app(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn repositories_are_listed_without_credentials() {
        let app = test_app(Duration::from_millis(1)).await;

        let (status, body) = send(&app, "GET", "/api/repositories", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["location"], "ssh://backup@nas/./borg");
        assert_eq!(body[0]["state"]["status"], "idle");
        assert!(body[0].get("password").is_none());
        assert!(!body.to_string().contains("hunter2"));

        let (status, _) = send(&app, "GET", "/api/repositories/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_edits_are_validated() {
        let app = test_app(Duration::from_millis(1)).await;

        let (status, body) = send(
            &app,
            "PUT",
            "/api/profiles/1/schedule",
            Some(json!({ "mode": "minuteInterval", "intervalMinutes": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");

        let (status, _) = send(
            &app,
            "PUT",
            "/api/profiles/99/schedule",
            Some(json!({ "mode": "hourly" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            "PUT",
            "/api/profiles/1/schedule",
            Some(json!({ "mode": "daily", "at": "02:30:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revision"], 1);
        assert!(body["nextRun"].is_string());

        let (status, body) = send(&app, "DELETE", "/api/profiles/1/schedule", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
    }

    #[tokio::test]
    async fn backups_can_be_queued_once_and_aborted() {
        let app = test_app(Duration::from_secs(30)).await;

        let (status, body) = send(&app, "POST", "/api/backups/1/1/run", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["button"] == "waiting" || body["button"] == "abort");

        let (status, body) = send(&app, "POST", "/api/backups/1/1/run", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already queued or running"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/backups/1/1/abort",
            Some(json!({ "kind": "backup" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn refused_repository_actions_are_reported() {
        let app = test_app(Duration::from_millis(1)).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/repositories/1/delete",
            Some(json!({ "reason": "nope" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "error");

        let (status, _) = send(
            &app,
            "POST",
            "/api/repositories/1/recover",
            Some(json!({ "reason": "fixed the disk" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
