//! Task model shared by the registry, orchestrator and HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque task identifier, generated at upload time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a task.
///
/// Transitions are monotone along
/// `pending → uploading-complete → running → {complete|failed|cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    UploadingComplete,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Position along the forward transition order, used to reject
    /// backward transitions.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::UploadingComplete => 1,
            Self::Running => 2,
            Self::Complete | Self::Failed | Self::Cancelled => 3,
        }
    }
}

/// Sequential phase of the processing pipeline.
///
/// Meaningful only while the task is `running`; `percent` is scoped to the
/// current stage and resets at each stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    None,
    Separation,
    MidiConversion,
    Validation,
    Complete,
}

/// Short machine-readable failure code recorded on a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorCode {
    SeparationFailed,
    TranscriptionFailed,
    ValidationFailed,
    Timeout,
    Internal,
}

impl fmt::Display for TaskErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SeparationFailed => "separation_failed",
            Self::TranscriptionFailed => "transcription_failed",
            Self::ValidationFailed => "validation_failed",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error attached to a task in `failed` status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: TaskErrorCode,
    pub details: String,
}

/// Kind tag addressing one of the blobs a task may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Input,
    Midi,
    Drum,
}

/// Opaque reference into the artifact store.
///
/// Internally a path relative to the store root; callers treat it as a
/// token and hand it back to the store to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub(crate) String);

impl ArtifactRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The central entity: one client request's full processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub stage: Stage,
    pub percent: f32,
    pub message: String,
    /// Original upload file name, used for download Content-Disposition.
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub input_ref: Option<ArtifactRef>,
    pub midi_ref: Option<ArtifactRef>,
    pub drum_ref: Option<ArtifactRef>,
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(id: TaskId, filename: impl Into<String>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            stage: Stage::None,
            percent: 0.0,
            message: String::new(),
            filename: filename.into(),
            created_at: Utc::now(),
            input_ref: None,
            midi_ref: None,
            drum_ref: None,
            error: None,
        }
    }
}

/// Download URL for the generated MIDI file.
pub fn midi_download_url(id: TaskId) -> String {
    format!("/download/midi/{id}")
}

/// Download URL for the isolated drum audio.
pub fn drum_download_url(id: TaskId) -> String {
    format!("/download/drum/{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskStatus::UploadingComplete).unwrap();
        assert_eq!(json, "\"uploading-complete\"");
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::MidiConversion).unwrap();
        assert_eq!(json, "\"midi_conversion\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn error_code_wire_names() {
        let json = serde_json::to_string(&TaskErrorCode::TranscriptionFailed).unwrap();
        assert_eq!(json, "\"transcription_failed\"");
        assert_eq!(TaskErrorCode::Timeout.to_string(), "timeout");
    }
}
