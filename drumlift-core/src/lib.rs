//! # Drumlift core
//!
//! Task orchestration core for the Drumlift drum-extraction service: the
//! task registry, artifact store, stage runners, pipeline orchestrator,
//! progress channel and retention sweep. The HTTP/WebSocket surface lives
//! in `drumlift-server`; the separation and transcription models are
//! external CLIs invoked through the [`stage::StageRunner`] seam.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod runners;
pub mod stage;
pub mod sweep;
pub mod task;

pub use artifacts::ArtifactStore;
pub use config::{OverflowPolicy, PipelineConfig};
pub use error::{OrchestratorError, RegistryError, StoreError};
pub use orchestrator::PipelineOrchestrator;
pub use progress::{ProgressChannels, ProgressEvent, Subscription};
pub use registry::TaskRegistry;
pub use task::{ArtifactKind, ArtifactRef, Stage, Task, TaskError, TaskErrorCode, TaskId, TaskStatus};
