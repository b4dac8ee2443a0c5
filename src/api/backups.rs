use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::notifications::Notification;
use crate::runner::{ButtonStatus, JobKey, JobSnapshot, OperationQueue};
use crate::state::OperationKind;
use crate::types::{BackupId, ProfileId, RepoId};

const DEFAULT_NOTIFICATION_LIMIT: usize = 50;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(active_jobs))
        .route("/notifications", get(list_notifications))
        .route("/backups/:profile_id/:repo_id", get(backup_status))
        .route("/backups/:profile_id/:repo_id/run", post(run_backup))
        .route("/backups/:profile_id/:repo_id/prune", post(run_prune))
        .route("/backups/:profile_id/:repo_id/abort", post(abort))
        .route(
            "/backups/:profile_id/:repo_id/archives/:archive",
            delete(delete_archive),
        )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatusView {
    pub backup_id: BackupId,
    pub button: ButtonStatus,
    pub backup: JobSnapshot,
    pub prune: JobSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    #[serde(default = "default_kind")]
    pub kind: OperationKind,
}

fn default_kind() -> OperationKind {
    OperationKind::Backup
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    pub profile_id: Option<ProfileId>,
    pub repository_id: Option<RepoId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub key: JobKey,
    #[serde(flatten)]
    pub job: JobSnapshot,
}

fn status_view(state: &AppState, backup_id: BackupId) -> BackupStatusView {
    BackupStatusView {
        backup_id,
        button: state.runner.button_status(backup_id),
        backup: state.runner.job(OperationKind::Backup, backup_id),
        prune: state.runner.job(OperationKind::Prune, backup_id),
    }
}

async fn active_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    let jobs = state
        .runner
        .active_jobs()
        .into_iter()
        .map(|(key, job)| JobView { key, job })
        .collect();
    Json(jobs)
}

async fn backup_status(
    State(state): State<AppState>,
    Path((profile_id, repo_id)): Path<(ProfileId, RepoId)>,
) -> Json<BackupStatusView> {
    Json(status_view(&state, BackupId::new(profile_id, repo_id)))
}

async fn run_backup(
    State(state): State<AppState>,
    Path((profile_id, repo_id)): Path<(ProfileId, RepoId)>,
) -> ApiResult<(StatusCode, Json<BackupStatusView>)> {
    let backup_id = BackupId::new(profile_id, repo_id);
    state
        .runner
        .queue_backup(backup_id)
        .await
        .map_err(ApiError::conflict)?;
    Ok((StatusCode::ACCEPTED, Json(status_view(&state, backup_id))))
}

async fn run_prune(
    State(state): State<AppState>,
    Path((profile_id, repo_id)): Path<(ProfileId, RepoId)>,
) -> ApiResult<(StatusCode, Json<BackupStatusView>)> {
    let backup_id = BackupId::new(profile_id, repo_id);
    state
        .runner
        .queue_prune(backup_id)
        .await
        .map_err(ApiError::conflict)?;
    Ok((StatusCode::ACCEPTED, Json(status_view(&state, backup_id))))
}

async fn abort(
    State(state): State<AppState>,
    Path((profile_id, repo_id)): Path<(ProfileId, RepoId)>,
    Json(req): Json<AbortRequest>,
) -> ApiResult<Json<BackupStatusView>> {
    let backup_id = BackupId::new(profile_id, repo_id);
    if !state.runner.abort(req.kind, backup_id) {
        return Err(ApiError::NotFound(format!(
            "no {} is queued or running for {}",
            req.kind, backup_id
        )));
    }
    Ok(Json(status_view(&state, backup_id)))
}

async fn delete_archive(
    State(state): State<AppState>,
    Path((profile_id, repo_id, archive)): Path<(ProfileId, RepoId, String)>,
) -> ApiResult<StatusCode> {
    state
        .runner
        .queue_archive_delete(BackupId::new(profile_id, repo_id), archive)
        .await
        .map_err(ApiError::conflict)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let backup_id = match (query.profile_id, query.repository_id) {
        (Some(profile_id), Some(repo_id)) => Some(BackupId::new(profile_id, repo_id)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "profileId and repositoryId must be given together".to_string(),
            ))
        }
    };
    let limit = query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT);
    Ok(Json(state.store.list_notifications(backup_id, limit).await?))
}
