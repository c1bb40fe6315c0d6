//! Progress events and the per-task notification channel.
//!
//! The channel delivers every progress/status event for a task to at most
//! one attached consumer. A fresh attach always starts with the current
//! registry snapshot, so a reconnecting client is never left without state;
//! events published with nobody attached are dropped (the registry remains
//! the durable record).

use crate::task::{Stage, Task, TaskError, TaskId, TaskStatus, drum_download_url, midi_download_url};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// In-flight progress frame: `{stage, percent, message}` plus timestamp.
///
/// `status` is populated only on the synthetic snapshot sent at attach time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub stage: Stage,
    pub percent: f32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal success frame carrying the download locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub complete: bool,
    pub task_id: TaskId,
    pub midi_url: String,
    pub drum_url: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal failure frame, also used for cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

/// One frame on the wire. Untagged so the JSON matches the shapes clients
/// already switch on (`complete`, `error`, or `stage`/`percent` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Complete(CompleteEvent),
    Failure(FailureEvent),
    Update(ProgressUpdate),
}

impl ProgressEvent {
    /// Terminal events close the channel; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failure(_))
    }

    /// Synthetic event describing a task's current state, sent once on
    /// attach. A task that already finished yields its terminal event, never
    /// a stale intermediate one.
    pub fn snapshot(task: &Task) -> Self {
        match task.status {
            TaskStatus::Complete => Self::Complete(CompleteEvent {
                complete: true,
                task_id: task.id,
                midi_url: midi_download_url(task.id),
                drum_url: drum_download_url(task.id),
                timestamp: Utc::now(),
            }),
            TaskStatus::Failed => Self::Failure(failure_frame(task.id, task.error.as_ref())),
            TaskStatus::Cancelled => Self::Failure(FailureEvent {
                error: "cancelled".to_string(),
                details: None,
                task_id: task.id,
                timestamp: Utc::now(),
            }),
            _ => Self::Update(ProgressUpdate {
                task_id: task.id,
                stage: task.stage,
                percent: task.percent,
                message: task.message.clone(),
                status: Some(task.status),
                timestamp: Utc::now(),
            }),
        }
    }
}

fn failure_frame(id: TaskId, error: Option<&TaskError>) -> FailureEvent {
    match error {
        Some(e) => FailureEvent {
            error: e.code.to_string(),
            details: Some(e.details.clone()),
            task_id: id,
            timestamp: Utc::now(),
        },
        None => FailureEvent {
            error: "internal".to_string(),
            details: None,
            task_id: id,
            timestamp: Utc::now(),
        },
    }
}

struct Attached {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    generation: u64,
}

/// Receiver half handed to the consumer, tagged with its attach generation
/// so a superseded consumer cannot detach its successor.
#[derive(Debug)]
pub struct Subscription {
    pub task_id: TaskId,
    pub generation: u64,
    pub receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

/// Per-task, at-most-one-consumer event fan-out.
#[derive(Clone, Default)]
pub struct ProgressChannels {
    inner: Arc<DashMap<TaskId, Attached>>,
    next_generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for ProgressChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannels")
            .field("attached", &self.inner.len())
            .finish()
    }
}

impl ProgressChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer, superseding any previous one. The previous
    /// consumer's receiver simply stops yielding; it is not force-closed.
    /// `snapshot` is delivered as the first event.
    pub fn attach(&self, task_id: TaskId, snapshot: ProgressEvent) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let terminal = snapshot.is_terminal();
        let _ = tx.send(snapshot);
        if terminal {
            // Nothing will follow; hand back a closed stream after the
            // terminal frame instead of registering a live channel.
            self.inner.remove(&task_id);
        } else {
            self.inner.insert(task_id, Attached { sender: tx, generation });
        }
        Subscription {
            task_id,
            generation,
            receiver: rx,
        }
    }

    /// Publish an event to the attached consumer, if any. Called only by
    /// the orchestrator; single producer per task keeps delivery FIFO.
    /// A terminal event closes the channel.
    pub fn publish(&self, task_id: TaskId, event: ProgressEvent) {
        let terminal = event.is_terminal();
        if let Some(attached) = self.inner.get(&task_id) {
            let _ = attached.sender.send(event);
        }
        if terminal {
            self.inner.remove(&task_id);
        }
    }

    /// Consumer-side cleanup on disconnect. Removes the entry only if the
    /// given subscription is still the attached one.
    pub fn detach(&self, sub: &Subscription) {
        self.inner
            .remove_if(&sub.task_id, |_, attached| attached.generation == sub.generation);
    }

    /// Drop any channel for a task, used by expiry deletion.
    pub fn drop_task(&self, task_id: TaskId) {
        self.inner.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskErrorCode, TaskError};

    fn running_task() -> Task {
        let mut t = Task::new(TaskId::new(), "song.wav");
        t.status = TaskStatus::Running;
        t.stage = Stage::Separation;
        t.percent = 42.0;
        t.message = "Separating stems".to_string();
        t
    }

    #[tokio::test]
    async fn attach_delivers_snapshot_first_then_events() {
        let channels = ProgressChannels::new();
        let task = running_task();
        let id = task.id;
        let mut sub = channels.attach(id, ProgressEvent::snapshot(&task));

        channels.publish(
            id,
            ProgressEvent::Update(ProgressUpdate {
                task_id: id,
                stage: Stage::Separation,
                percent: 50.0,
                message: "halfway".to_string(),
                status: None,
                timestamp: Utc::now(),
            }),
        );

        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Update(u) => {
                assert_eq!(u.percent, 42.0);
                assert_eq!(u.status, Some(TaskStatus::Running));
            }
            other => panic!("expected snapshot update, got {other:?}"),
        }
        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Update(u) => assert_eq!(u.percent, 50.0),
            other => panic!("expected live update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_attach_supersedes_previous_consumer() {
        let channels = ProgressChannels::new();
        let task = running_task();
        let id = task.id;
        let mut first = channels.attach(id, ProgressEvent::snapshot(&task));
        let mut second = channels.attach(id, ProgressEvent::snapshot(&task));

        // Drain snapshots.
        first.receiver.recv().await.unwrap();
        second.receiver.recv().await.unwrap();

        channels.publish(
            id,
            ProgressEvent::Update(ProgressUpdate {
                task_id: id,
                stage: Stage::Separation,
                percent: 75.0,
                message: String::new(),
                status: None,
                timestamp: Utc::now(),
            }),
        );

        match second.receiver.recv().await.unwrap() {
            ProgressEvent::Update(u) => assert_eq!(u.percent, 75.0),
            other => panic!("unexpected {other:?}"),
        }
        // Superseded consumer stops receiving without being force-closed.
        assert!(first.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_event_closes_channel() {
        let channels = ProgressChannels::new();
        let task = running_task();
        let id = task.id;
        let mut sub = channels.attach(id, ProgressEvent::snapshot(&task));
        sub.receiver.recv().await.unwrap();

        channels.publish(
            id,
            ProgressEvent::Complete(CompleteEvent {
                complete: true,
                task_id: id,
                midi_url: midi_download_url(id),
                drum_url: drum_download_url(id),
                timestamp: Utc::now(),
            }),
        );

        assert!(sub.receiver.recv().await.unwrap().is_terminal());
        // Channel closed after the terminal frame.
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn attach_to_finished_task_yields_terminal_snapshot() {
        let channels = ProgressChannels::new();
        let mut task = running_task();
        task.status = TaskStatus::Failed;
        task.error = Some(TaskError {
            code: TaskErrorCode::TranscriptionFailed,
            details: "model crashed".to_string(),
        });
        let mut sub = channels.attach(task.id, ProgressEvent::snapshot(&task));

        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Failure(f) => {
                assert_eq!(f.error, "transcription_failed");
                assert_eq!(f.details.as_deref(), Some("model crashed"));
            }
            other => panic!("expected failure frame, got {other:?}"),
        }
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_consumer_is_dropped_silently() {
        let channels = ProgressChannels::new();
        let id = TaskId::new();
        channels.publish(
            id,
            ProgressEvent::Failure(FailureEvent {
                error: "internal".to_string(),
                details: None,
                task_id: id,
                timestamp: Utc::now(),
            }),
        );
    }

    #[tokio::test]
    async fn detach_ignores_superseded_subscription() {
        let channels = ProgressChannels::new();
        let task = running_task();
        let id = task.id;
        let first = channels.attach(id, ProgressEvent::snapshot(&task));
        let mut second = channels.attach(id, ProgressEvent::snapshot(&task));

        // First consumer disconnecting must not tear down the second.
        channels.detach(&first);
        second.receiver.recv().await.unwrap();
        channels.publish(
            id,
            ProgressEvent::Update(ProgressUpdate {
                task_id: id,
                stage: Stage::Separation,
                percent: 90.0,
                message: String::new(),
                status: None,
                timestamp: Utc::now(),
            }),
        );
        assert!(sub_recv_percent(&mut second).await == 90.0);
    }

    async fn sub_recv_percent(sub: &mut Subscription) -> f32 {
        match sub.receiver.recv().await.unwrap() {
            ProgressEvent::Update(u) => u.percent,
            other => panic!("unexpected {other:?}"),
        }
    }
}
