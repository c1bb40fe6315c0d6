//! Stage runner seam.
//!
//! A stage runner wraps one external processing call as an awaitable
//! operation that reports incremental progress and aborts cooperatively.
//! The orchestrator owns sequencing, budgets and error mapping; runners
//! only do the work.

use crate::task::{Stage, TaskId};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Best-effort progress reporting handle given to a runner.
///
/// Reports are forwarded to the registry and the progress channel; a closed
/// receiver is ignored since the registry stays authoritative either way.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<(f32, String)>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(f32, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, percent: f32, message: impl Into<String>) {
        let _ = self.tx.send((percent.clamp(0.0, 100.0), message.into()));
    }
}

/// Everything a runner needs for one invocation.
#[derive(Debug)]
pub struct StageContext {
    pub task_id: TaskId,
    /// Input file for this stage: the upload for separation, then each
    /// stage's output feeds the next.
    pub input: PathBuf,
    /// Outputs of earlier stages, in pipeline order.
    pub prior_outputs: Vec<PathBuf>,
    /// Per-task scratch directory; external tools write here.
    pub scratch_dir: PathBuf,
    pub progress: ProgressSink,
    /// Cooperative abort flag, checked between units of work.
    pub cancel: CancellationToken,
}

/// Result of a successful stage invocation.
#[derive(Debug)]
pub struct StageOutput {
    /// File the next stage consumes (or the final artifact).
    pub produced: PathBuf,
}

/// Why a stage invocation did not produce an output.
#[derive(Error, Debug)]
pub enum StageFailure {
    #[error("stage cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// One sequential phase of the pipeline, adapting an external model call.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Which pipeline stage this runner implements.
    fn stage(&self) -> Stage;

    /// Run the stage to completion, reporting progress through
    /// `ctx.progress` and observing `ctx.cancel` between units of work.
    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageFailure>;
}
