//! Pipeline configuration.

use std::time::Duration;

/// What `start` does once the concurrent-task ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a free worker slot, FIFO.
    Queue,
    /// Fail the task immediately with an `internal` error.
    Reject,
}

/// Knobs for the task orchestrator and background sweep.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ceiling on simultaneously running pipelines.
    pub max_concurrent: usize,
    pub overflow: OverflowPolicy,
    /// Wall-clock budget per stage; exceeding it fails the task with `timeout`.
    pub separation_timeout: Duration,
    pub transcription_timeout: Duration,
    pub validation_timeout: Duration,
    /// Upper bound on how long `cancel` waits for the pipeline to acknowledge.
    pub cancel_grace: Duration,
    /// Tasks and their artifacts are purged once older than this.
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// Separator invocation: program followed by arguments. The input path
    /// and scratch directory are appended as the final two arguments.
    pub separator_cmd: Vec<String>,
    /// Transcriber invocation, same argument convention.
    pub transcriber_cmd: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            overflow: OverflowPolicy::Queue,
            separation_timeout: Duration::from_secs(600),
            transcription_timeout: Duration::from_secs(300),
            validation_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(3),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            separator_cmd: vec![
                "demucs".to_string(),
                "--two-stems=drums".to_string(),
            ],
            transcriber_cmd: vec!["basic-pitch".to_string()],
        }
    }
}
