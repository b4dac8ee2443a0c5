use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::engine::{ArchiveInfo, RepositoryInfo};
use crate::runner::OperationOutcome;
use crate::state::{RepoSnapshot, StateTransition, TransitionResult};
use crate::storage::Repository;
use crate::types::RepoId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_repositories))
        .route("/:id", get(get_repository))
        .route("/:id/history", get(repository_history))
        .route("/:id/archives", get(list_archives))
        .route("/:id/refresh", post(refresh))
        .route("/:id/recover", post(recover))
        .route("/:id/force-reset", post(force_reset))
        .route("/:id/break-lock", post(break_lock))
        .route("/:id/mount", post(mount))
        .route("/:id/unmount", post(unmount))
        .route("/:id/delete", post(delete_repository))
}

/// A repository without its credentials, plus its live state.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryView {
    pub id: RepoId,
    pub name: String,
    pub location: String,
    pub state: RepoSnapshot,
}

impl RepositoryView {
    fn new(repository: Repository, state: RepoSnapshot) -> Self {
        Self {
            id: repository.id,
            name: repository.name,
            location: repository.location,
            state,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    pub path: PathBuf,
    pub archive: Option<String>,
}

async fn load(state: &AppState, id: RepoId) -> ApiResult<Repository> {
    state
        .store
        .get_repository(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("repository {} not found", id)))
}

async fn list_repositories(State(state): State<AppState>) -> ApiResult<Json<Vec<RepositoryView>>> {
    let manager = state.runner.state();
    let views = state
        .store
        .list_repositories()
        .await?
        .into_iter()
        .map(|repo| {
            let snapshot = manager.snapshot(repo.id);
            RepositoryView::new(repo, snapshot)
        })
        .collect();
    Ok(Json(views))
}

async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
) -> ApiResult<Json<RepositoryView>> {
    let repo = load(&state, id).await?;
    let snapshot = state.runner.state().snapshot(id);
    Ok(Json(RepositoryView::new(repo, snapshot)))
}

async fn repository_history(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<StateTransition>> {
    Json(state.runner.state().history().for_repo(id, query.limit))
}

async fn list_archives(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
) -> ApiResult<Json<Vec<ArchiveInfo>>> {
    load(&state, id).await?;
    let archives = state
        .runner
        .list_archives(id)
        .await
        .map_err(ApiError::conflict)?;
    Ok(Json(archives))
}

async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
) -> ApiResult<Json<RepositoryInfo>> {
    load(&state, id).await?;
    let info = state
        .runner
        .refresh_repository(id)
        .await
        .map_err(ApiError::conflict)?;
    Ok(Json(info))
}

async fn recover(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<Json<TransitionResult>> {
    load(&state, id).await?;
    let result = state
        .runner
        .recover(id, &req.reason)
        .await
        .map_err(ApiError::conflict)?;
    Ok(Json(result))
}

async fn force_reset(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<Json<TransitionResult>> {
    load(&state, id).await?;
    if req.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("a reason is required".to_string()));
    }
    let result = state
        .runner
        .force_reset(id, req.reason.trim())
        .await
        .map_err(ApiError::conflict)?;
    Ok(Json(result))
}

async fn break_lock(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
) -> ApiResult<Json<RepoSnapshot>> {
    load(&state, id).await?;
    state.runner.break_lock(id).await.map_err(ApiError::conflict)?;
    Ok(Json(state.runner.state().snapshot(id)))
}

async fn mount(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
    Json(req): Json<MountRequest>,
) -> ApiResult<Json<OperationOutcome>> {
    load(&state, id).await?;
    let outcome = match req.archive {
        Some(archive) => state.runner.mount_archive(id, &archive, req.path).await?,
        None => state.runner.mount_repository(id, req.path).await?,
    };
    Ok(Json(outcome))
}

async fn unmount(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
) -> ApiResult<Json<OperationOutcome>> {
    load(&state, id).await?;
    let outcome = state.runner.unmount(id).await.map_err(ApiError::conflict)?;
    Ok(Json(outcome))
}

async fn delete_repository(
    State(state): State<AppState>,
    Path(id): Path<RepoId>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<Json<OperationOutcome>> {
    load(&state, id).await?;
    Ok(Json(state.runner.delete_repository(id, &req.reason).await?))
}
