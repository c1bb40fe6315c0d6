use crate::errors::{AppError, AppResult};
use crate::handlers::status::parse_task_id;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use drumlift_core::{ArtifactKind, TaskStatus};
use std::path::Path as FsPath;

/// Serve the transcribed MIDI for a completed task.
pub async fn download_midi_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Response> {
    serve_artifact(state, &task_id, ArtifactKind::Midi).await
}

/// Serve the isolated drum stem for a completed task.
pub async fn download_drum_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Response> {
    serve_artifact(state, &task_id, ArtifactKind::Drum).await
}

async fn serve_artifact(
    state: AppState,
    raw_id: &str,
    kind: ArtifactKind,
) -> AppResult<Response> {
    let id = parse_task_id(raw_id)?;
    let task = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found("Task not found"))?;

    match task.status {
        TaskStatus::Complete => {}
        // A failed or cancelled run produces nothing to download.
        TaskStatus::Failed | TaskStatus::Cancelled => {
            return Err(AppError::not_found("No output available for this task"));
        }
        _ => return Err(AppError::bad_request("Processing not complete")),
    }

    let artifact = match kind {
        ArtifactKind::Midi => task.midi_ref.as_ref(),
        ArtifactKind::Drum => task.drum_ref.as_ref(),
        ArtifactKind::Input => None,
    }
    .ok_or_else(|| AppError::not_found("Artifact not found"))?;

    let bytes = state.store.read(artifact).await?;

    let stem = FsPath::new(&task.filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let (content_type, download_name) = match kind {
        ArtifactKind::Midi => ("audio/midi", format!("{stem}_drums.mid")),
        ArtifactKind::Drum => ("audio/wav", format!("{stem}_drums.wav")),
        ArtifactKind::Input => unreachable!("inputs are never served"),
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
