//! Shared application state.

use crate::config::ServerConfig;
use drumlift_core::{
    ArtifactStore, PipelineOrchestrator, ProgressChannels, TaskRegistry,
};
use std::sync::Arc;

/// Everything the handlers need; cheap to clone.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: TaskRegistry,
    pub store: ArtifactStore,
    pub channels: ProgressChannels,
    pub orchestrator: PipelineOrchestrator,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        registry: TaskRegistry,
        store: ArtifactStore,
        channels: ProgressChannels,
        orchestrator: PipelineOrchestrator,
        config: ServerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            channels,
            orchestrator,
            config: Arc::new(config),
        }
    }
}
