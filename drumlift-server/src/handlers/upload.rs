use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{Json, extract::Multipart, extract::State};
use drumlift_core::{Task, TaskId, TaskStatus};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub task_id: TaskId,
    pub status: String,
    pub message: String,
}

/// Accept a multipart audio upload and register a task for it.
///
/// The task only becomes visible to clients once the input bytes are
/// safely on disk; a failed write rolls the registration back so no
/// half-created task lingers.
pub async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| AppError::bad_request("File field is missing a filename"))?;
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::bad_request(format!("Failed to read upload: {e}")))?;
            file = Some((filename, bytes));
            break;
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| AppError::bad_request("Missing 'file' field in upload"))?;

    let ext = Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();
    if !state.config.allows_extension(&ext) {
        return Err(AppError::bad_request(format!(
            "Unsupported file type '{ext}'. Allowed: {}",
            state.config.allowed_extensions.join(", ")
        )));
    }
    if bytes.is_empty() {
        return Err(AppError::bad_request("Uploaded file is empty"));
    }
    if bytes.len() > state.config.max_upload_bytes {
        return Err(AppError::bad_request(format!(
            "File too large ({} bytes, limit {})",
            bytes.len(),
            state.config.max_upload_bytes
        )));
    }

    let id = TaskId::new();
    state.registry.create(Task::new(id, filename.clone())).await?;

    match state.store.put_input(id, &bytes, &ext).await {
        Ok(input_ref) => {
            state
                .registry
                .update(&id, |task| {
                    task.status = TaskStatus::UploadingComplete;
                    task.input_ref = Some(input_ref);
                    task.message = "Upload complete".to_string();
                })
                .await?;
        }
        Err(e) => {
            warn!("discarding task {id}: failed to persist upload: {e}");
            state.registry.remove(&id).await;
            state.store.delete_all(id).await;
            return Err(AppError::internal("Failed to store uploaded file"));
        }
    }

    info!(
        "accepted upload '{}' ({} bytes) as task {}",
        filename,
        bytes.len(),
        id
    );

    Ok(Json(UploadResponse {
        task_id: id,
        status: "success".to_string(),
        message: format!("File uploaded successfully. Connect to /ws/process/{id} to begin."),
    }))
}
