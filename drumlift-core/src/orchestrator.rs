//! Pipeline orchestrator.
//!
//! Drives one task from `uploading-complete` to a terminal status:
//! sequences the stage runners, applies per-stage wall-clock budgets,
//! funnels progress into the registry and the progress channel, and
//! handles cooperative cancellation with a bounded grace timeout.

use crate::artifacts::ArtifactStore;
use crate::config::{OverflowPolicy, PipelineConfig};
use crate::error::OrchestratorError;
use crate::progress::{
    CompleteEvent, FailureEvent, ProgressChannels, ProgressEvent, ProgressUpdate, Subscription,
};
use crate::registry::TaskRegistry;
use crate::runners::{OutputValidationRunner, SeparationRunner, TranscriptionRunner};
use crate::stage::{ProgressSink, StageContext, StageFailure, StageRunner};
use crate::task::{
    ArtifactKind, Stage, TaskError, TaskErrorCode, TaskId, TaskStatus, drum_download_url,
    midi_download_url,
};
use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bookkeeping for a live pipeline, so `cancel` can reach it.
#[derive(Debug)]
struct ActiveTask {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Owns the stage sequence for every task. Cheap to clone; all state is
/// shared behind `Arc`s.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    registry: TaskRegistry,
    store: ArtifactStore,
    channels: ProgressChannels,
    config: Arc<PipelineConfig>,
    runners: Arc<Vec<Arc<dyn StageRunner>>>,
    semaphore: Arc<Semaphore>,
    active: Arc<DashMap<TaskId, ActiveTask>>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("active", &self.active.len())
            .finish()
    }
}

/// Why a pipeline stopped short of `complete`.
enum PipelineEnd {
    Cancelled,
    Failed(TaskErrorCode, String),
}

impl PipelineOrchestrator {
    /// Orchestrator with the production runner set built from the config.
    pub fn new(
        registry: TaskRegistry,
        store: ArtifactStore,
        channels: ProgressChannels,
        config: PipelineConfig,
    ) -> Self {
        let runners: Vec<Arc<dyn StageRunner>> = vec![
            Arc::new(SeparationRunner::new(config.separator_cmd.clone())),
            Arc::new(TranscriptionRunner::new(config.transcriber_cmd.clone())),
            Arc::new(OutputValidationRunner),
        ];
        Self::with_runners(registry, store, channels, config, runners)
    }

    /// Orchestrator with an explicit runner set (tests, alternative models).
    pub fn with_runners(
        registry: TaskRegistry,
        store: ArtifactStore,
        channels: ProgressChannels,
        config: PipelineConfig,
        runners: Vec<Arc<dyn StageRunner>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            registry,
            store,
            channels,
            config: Arc::new(config),
            runners: Arc::new(runners),
            semaphore,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Begin async execution of a task's pipeline.
    ///
    /// Idempotent: exactly one caller wins the atomic
    /// `uploading-complete → running` transition and spawns the pipeline;
    /// everyone else gets the current status back and no second execution.
    pub async fn start(&self, id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        let mut won = false;
        let task = self
            .registry
            .update(&id, |t| {
                if t.status == TaskStatus::UploadingComplete {
                    t.status = TaskStatus::Running;
                    t.message = "Queued for processing".to_string();
                    won = true;
                }
            })
            .await?;

        if !won {
            debug!("start({}) is a no-op in status {:?}", id, task.status);
            return Ok(task.status);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.active.insert(
            id,
            ActiveTask {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let orch = self.clone();
        tokio::spawn(async move {
            if let Err(end) = orch.execute(id, &cancel).await {
                match end {
                    PipelineEnd::Cancelled => orch.finish_cancelled(id).await,
                    PipelineEnd::Failed(code, details) => {
                        orch.finish_failed(id, code, details).await;
                    }
                }
            }
            orch.active.remove(&id);
            let _ = done_tx.send(true);
        });

        info!("task {} started", id);
        Ok(TaskStatus::Running)
    }

    /// Attach a progress consumer for a task, superseding any previous one.
    ///
    /// The subscription starts with a snapshot of the task's current state.
    /// If the pipeline publishes its terminal event between the snapshot
    /// read and the attach, that event went to nobody; the re-read below
    /// catches this and re-delivers the terminal frame on the fresh
    /// subscription, so a consumer is never stranded behind a stale
    /// non-terminal snapshot. At most one terminal frame is delivered either
    /// way, because the first terminal publish closes the channel entry.
    pub async fn subscribe(&self, id: TaskId) -> Result<Subscription, OrchestratorError> {
        let task = self
            .registry
            .get(&id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        let sub = self.channels.attach(id, ProgressEvent::snapshot(&task));
        if !task.status.is_terminal() {
            if let Some(now) = self.registry.get(&id).await {
                if now.status.is_terminal() {
                    self.channels.publish(id, ProgressEvent::snapshot(&now));
                }
            }
        }
        Ok(sub)
    }

    /// Request cooperative abort of a task.
    ///
    /// Returns within the configured grace timeout: if the pipeline has not
    /// acknowledged by then, the task is force-marked `cancelled` anyway.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskStatus, OrchestratorError> {
        let task = self
            .registry
            .get(&id)
            .await
            .ok_or(OrchestratorError::NotFound(id))?;
        if task.status.is_terminal() {
            return Ok(task.status);
        }

        let live = self.active.get(&id).map(|a| (a.cancel.clone(), a.done.clone()));
        match live {
            Some((cancel, mut done)) => {
                cancel.cancel();
                let acked = tokio::time::timeout(self.config.cancel_grace, done.wait_for(|v| *v))
                    .await
                    .is_ok();
                let task = self
                    .registry
                    .update(&id, |t| {
                        if !t.status.is_terminal() {
                            t.status = TaskStatus::Cancelled;
                            t.message = "Processing cancelled".to_string();
                        }
                    })
                    .await?;
                if !acked && task.status == TaskStatus::Cancelled {
                    warn!("task {} missed the cancel grace window, force-marked", id);
                    self.publish_cancelled(id);
                }
                Ok(task.status)
            }
            None => {
                // Not yet spawned (pending / uploading-complete).
                let task = self
                    .registry
                    .update(&id, |t| {
                        if !t.status.is_terminal() {
                            t.status = TaskStatus::Cancelled;
                            t.message = "Processing cancelled".to_string();
                        }
                    })
                    .await?;
                if task.status == TaskStatus::Cancelled {
                    self.publish_cancelled(id);
                }
                Ok(task.status)
            }
        }
    }

    /// Cancel (if active), then remove the task and every artifact it owns.
    pub async fn delete(&self, id: TaskId) -> Result<(), OrchestratorError> {
        if self.registry.get(&id).await.is_none() {
            return Err(OrchestratorError::NotFound(id));
        }
        let _ = self.cancel(id).await;
        self.registry.remove(&id).await;
        self.channels.drop_task(id);
        self.store.delete_all(id).await;
        info!("task {} deleted", id);
        Ok(())
    }

    async fn execute(&self, id: TaskId, cancel: &CancellationToken) -> Result<(), PipelineEnd> {
        let _permit = self.acquire_slot(id, cancel).await?;
        if cancel.is_cancelled() {
            return Err(PipelineEnd::Cancelled);
        }

        let task = self
            .registry
            .get(&id)
            .await
            .ok_or_else(|| internal("task removed before pipeline start"))?;
        if task.status != TaskStatus::Running {
            // A cancel landed before this pipeline registered its token and
            // force-marked the task; don't waste model time on it.
            return Err(PipelineEnd::Cancelled);
        }
        let input_ref = task
            .input_ref
            .ok_or_else(|| internal("task has no input artifact"))?;
        let input = self
            .store
            .resolve(&input_ref)
            .map_err(|e| internal(e.to_string()))?;
        let scratch = self
            .store
            .scratch_dir(id)
            .await
            .map_err(|e| internal(e.to_string()))?;

        let mut current_input = input;
        let mut produced: Vec<PathBuf> = Vec::new();

        for runner in self.runners.iter() {
            let stage = runner.stage();
            self.report_progress(id, stage, 0.0, stage_banner(stage)).await;

            let (sink, mut reports) = ProgressSink::channel();
            let forwarder = {
                let orch = self.clone();
                tokio::spawn(async move {
                    while let Some((percent, message)) = reports.recv().await {
                        orch.report_progress(id, stage, percent, message).await;
                    }
                })
            };

            let ctx = StageContext {
                task_id: id,
                input: current_input.clone(),
                prior_outputs: produced.clone(),
                scratch_dir: scratch.clone(),
                progress: sink,
                cancel: cancel.clone(),
            };
            let outcome = tokio::time::timeout(self.stage_budget(stage), runner.run(ctx)).await;
            // Drain remaining reports before terminal events so per-task
            // delivery stays in publish order.
            let _ = forwarder.await;

            match outcome {
                Err(_elapsed) => {
                    cancel.cancel();
                    return Err(PipelineEnd::Failed(
                        TaskErrorCode::Timeout,
                        format!("stage exceeded its {:?} budget", self.stage_budget(stage)),
                    ));
                }
                Ok(Err(StageFailure::Cancelled)) => return Err(PipelineEnd::Cancelled),
                Ok(Err(StageFailure::Failed(e))) => {
                    return Err(PipelineEnd::Failed(failure_code(stage), format!("{e:#}")));
                }
                Ok(Ok(output)) => {
                    current_input = output.produced.clone();
                    produced.push(output.produced);
                }
            }
            if cancel.is_cancelled() {
                return Err(PipelineEnd::Cancelled);
            }
        }

        let drum = produced
            .first()
            .cloned()
            .ok_or_else(|| internal("pipeline produced no drum stem"))?;
        let midi = produced
            .get(1)
            .cloned()
            .ok_or_else(|| internal("pipeline produced no MIDI file"))?;
        let drum_ref = self
            .store
            .adopt(id, ArtifactKind::Drum, &drum)
            .await
            .map_err(|e| internal(e.to_string()))?;
        let midi_ref = self
            .store
            .adopt(id, ArtifactKind::Midi, &midi)
            .await
            .map_err(|e| internal(e.to_string()))?;

        let task = self
            .registry
            .update(&id, |t| {
                t.status = TaskStatus::Complete;
                t.stage = Stage::Complete;
                t.percent = 100.0;
                t.message = "Processing complete - ready for download".to_string();
                t.drum_ref = Some(drum_ref);
                t.midi_ref = Some(midi_ref);
            })
            .await
            .map_err(|e| internal(e.to_string()))?;

        if task.status != TaskStatus::Complete {
            // A forced cancel won the race; its terminal status is frozen.
            self.store.delete_outputs(id).await;
            return Err(PipelineEnd::Cancelled);
        }

        self.channels.publish(
            id,
            ProgressEvent::Complete(CompleteEvent {
                complete: true,
                task_id: id,
                midi_url: midi_download_url(id),
                drum_url: drum_download_url(id),
                timestamp: Utc::now(),
            }),
        );
        info!("task {} complete", id);
        Ok(())
    }

    async fn acquire_slot(
        &self,
        id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, PipelineEnd> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }
        match self.config.overflow {
            OverflowPolicy::Reject => Err(PipelineEnd::Failed(
                TaskErrorCode::Internal,
                "server at capacity, try again later".to_string(),
            )),
            OverflowPolicy::Queue => {
                self.report_progress(id, Stage::None, 0.0, "Waiting for a free worker")
                    .await;
                tokio::select! {
                    _ = cancel.cancelled() => Err(PipelineEnd::Cancelled),
                    permit = self.semaphore.clone().acquire_owned() => {
                        permit.map_err(|_| internal("worker pool closed"))
                    }
                }
            }
        }
    }

    /// Atomic registry update plus live notification. Single producer per
    /// task, so consumers observe events in publish order. Regressing
    /// percentages are clamped by the registry; the clamped snapshot is what
    /// gets published.
    async fn report_progress(
        &self,
        id: TaskId,
        stage: Stage,
        percent: f32,
        message: impl Into<String>,
    ) {
        let message = message.into();
        let Ok(task) = self
            .registry
            .update(&id, |t| {
                t.stage = stage;
                t.percent = percent;
                t.message = message;
            })
            .await
        else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        self.channels.publish(
            id,
            ProgressEvent::Update(ProgressUpdate {
                task_id: id,
                stage: task.stage,
                percent: task.percent,
                message: task.message,
                status: None,
                timestamp: Utc::now(),
            }),
        );
    }

    async fn finish_failed(&self, id: TaskId, code: TaskErrorCode, details: String) {
        warn!("task {} failed ({}): {}", id, code, details);
        self.store.delete_outputs(id).await;
        let Ok(task) = self
            .registry
            .update(&id, |t| {
                t.status = TaskStatus::Failed;
                t.message = "Processing failed".to_string();
                t.error = Some(TaskError {
                    code,
                    details: details.clone(),
                });
            })
            .await
        else {
            return;
        };
        // A cancel may have frozen the task first; its event already went out.
        if task.status == TaskStatus::Failed {
            self.channels.publish(
                id,
                ProgressEvent::Failure(FailureEvent {
                    error: code.to_string(),
                    details: Some(details),
                    task_id: id,
                    timestamp: Utc::now(),
                }),
            );
        }
    }

    async fn finish_cancelled(&self, id: TaskId) {
        info!("task {} cancelled", id);
        self.store.delete_outputs(id).await;
        let Ok(task) = self
            .registry
            .update(&id, |t| {
                if !t.status.is_terminal() {
                    t.status = TaskStatus::Cancelled;
                    t.message = "Processing cancelled".to_string();
                }
            })
            .await
        else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            self.publish_cancelled(id);
        }
    }

    fn publish_cancelled(&self, id: TaskId) {
        self.channels.publish(
            id,
            ProgressEvent::Failure(FailureEvent {
                error: "cancelled".to_string(),
                details: None,
                task_id: id,
                timestamp: Utc::now(),
            }),
        );
    }

    fn stage_budget(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Separation => self.config.separation_timeout,
            Stage::MidiConversion => self.config.transcription_timeout,
            _ => self.config.validation_timeout,
        }
    }
}

fn internal(details: impl Into<String>) -> PipelineEnd {
    PipelineEnd::Failed(TaskErrorCode::Internal, details.into())
}

fn failure_code(stage: Stage) -> TaskErrorCode {
    match stage {
        Stage::Separation => TaskErrorCode::SeparationFailed,
        Stage::MidiConversion => TaskErrorCode::TranscriptionFailed,
        Stage::Validation => TaskErrorCode::ValidationFailed,
        Stage::None | Stage::Complete => TaskErrorCode::Internal,
    }
}

fn stage_banner(stage: Stage) -> &'static str {
    match stage {
        Stage::Separation => "Separating stems",
        Stage::MidiConversion => "Converting drums to MIDI",
        Stage::Validation => "Validating outputs",
        Stage::None | Stage::Complete => "",
    }
}
