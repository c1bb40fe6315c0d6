use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use drumlift_core::{
    Stage, TaskError, TaskId, TaskStatus,
    task::{drum_download_url, midi_download_url},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub stage: Stage,
    pub percent: f32,
    pub message: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drum_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Point-in-time snapshot of a task, for clients polling instead of
/// holding a WebSocket.
pub async fn status_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskStatusResponse>> {
    let id = parse_task_id(&task_id)?;
    let task = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("Task not found"))?;

    let complete = task.status == TaskStatus::Complete;
    Ok(Json(TaskStatusResponse {
        task_id: task.id,
        status: task.status,
        stage: task.stage,
        percent: task.percent,
        message: task.message,
        filename: task.filename,
        created_at: task.created_at,
        midi_url: complete.then(|| midi_download_url(id)),
        drum_url: complete.then(|| drum_download_url(id)),
        error: task.error,
    }))
}

pub fn parse_task_id(raw: &str) -> Result<TaskId, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request("Invalid task ID"))
}
