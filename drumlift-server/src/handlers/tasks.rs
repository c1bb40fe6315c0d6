use crate::errors::AppResult;
use crate::handlers::status::parse_task_id;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use tracing::info;

/// Cancel a task if it is still running, then remove it and its
/// artifacts entirely.
pub async fn delete_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = parse_task_id(&task_id)?;
    state.orchestrator.delete(id).await?;
    info!("deleted task {id}");
    Ok(Json(json!({
        "status": "deleted",
        "task_id": id,
    })))
}
