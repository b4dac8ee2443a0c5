use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::schedule::{ArmedTimer, BackupSchedule, PruningPolicy, PruningRule, RecurrencePolicy};
use crate::types::ProfileId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/schedules", get(list_schedules))
        .route(
            "/profiles/:id/schedule",
            get(get_schedule).put(save_schedule).delete(delete_schedule),
        )
        .route(
            "/profiles/:id/pruning-rule",
            get(get_pruning_rule)
                .put(save_pruning_rule)
                .delete(delete_pruning_rule),
        )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulesView {
    pub schedules: Vec<BackupSchedule>,
    pub timers: Vec<ArmedTimer>,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub deleted: bool,
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult<Json<SchedulesView>> {
    Ok(Json(SchedulesView {
        schedules: state.schedules.list_backup_schedules().await?,
        timers: state.scheduler.armed_timers(),
    }))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
) -> ApiResult<Json<BackupSchedule>> {
    state
        .schedules
        .backup_schedule(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("profile {} has no schedule", id)))
}

async fn save_schedule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
    Json(policy): Json<RecurrencePolicy>,
) -> ApiResult<Json<BackupSchedule>> {
    Ok(Json(state.schedules.save_backup_schedule(id, policy).await?))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
) -> ApiResult<Json<Deleted>> {
    let deleted = state.schedules.delete_backup_schedule(id).await?;
    Ok(Json(Deleted { deleted }))
}

async fn get_pruning_rule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
) -> ApiResult<Json<PruningRule>> {
    state
        .schedules
        .pruning_rule(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("profile {} has no pruning rule", id)))
}

async fn save_pruning_rule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
    Json(policy): Json<PruningPolicy>,
) -> ApiResult<Json<PruningRule>> {
    Ok(Json(state.schedules.save_pruning_rule(id, policy).await?))
}

async fn delete_pruning_rule(
    State(state): State<AppState>,
    Path(id): Path<ProfileId>,
) -> ApiResult<Json<Deleted>> {
    let deleted = state.schedules.delete_pruning_rule(id).await?;
    Ok(Json(Deleted { deleted }))
}
