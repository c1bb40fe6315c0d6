//! In-memory task registry.
//!
//! Single authoritative mapping from task id to [`Task`], safe for
//! concurrent readers and writers. All mutation goes through [`update`],
//! which applies the caller's changes atomically and enforces the task
//! state-machine invariants, so a future swap to a networked store only
//! has to honor this narrow API.
//!
//! [`update`]: TaskRegistry::update

use crate::error::RegistryError;
use crate::task::{Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide task map. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created task. Fails if the id is already present.
    pub async fn create(&self, task: Task) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(RegistryError::Duplicate(task.id));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    /// Cloned snapshot of a task. Readers never observe a partial update
    /// because all writes happen under the write lock.
    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// Apply `f` to the task atomically and return the resulting snapshot.
    ///
    /// Invariants enforced here rather than at every call site:
    /// - a terminal task is frozen: an update that tries to change its
    ///   status is discarded wholesale;
    /// - status never moves backward along the lifecycle order;
    /// - `percent` never regresses within a stage (regressions are clamped
    ///   to the previous value; a stage change resets freely).
    pub async fn update<F>(&self, id: &TaskId, f: F) -> Result<Task, RegistryError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;

        let prev = task.clone();
        f(task);

        if prev.status.is_terminal() && task.status != prev.status {
            *task = prev;
            return Ok(task.clone());
        }
        if task.status.rank() < prev.status.rank() {
            task.status = prev.status;
        }
        if task.stage == prev.stage && task.percent < prev.percent {
            task.percent = prev.percent;
        }

        Ok(task.clone())
    }

    /// Remove a task. Only the expiry sweep and explicit deletion call this.
    pub async fn remove(&self, id: &TaskId) -> Option<Task> {
        self.tasks.write().await.remove(id)
    }

    /// Number of tasks currently in `running` status.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Ids of tasks created before `cutoff`, i.e. past the retention window.
    ///
    /// Tasks still in `running` status are skipped: the stage budgets bound
    /// how long a pipeline can run, so they become collectable on a later
    /// pass instead of being deleted out from under their own pipeline.
    pub async fn expired(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.created_at < cutoff && t.status != TaskStatus::Running)
            .map(|t| t.id)
            .collect()
    }

    /// Ids of every registered task.
    pub async fn ids(&self) -> Vec<TaskId> {
        self.tasks.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Stage;
    use chrono::Duration as ChronoDuration;

    fn task() -> Task {
        Task::new(TaskId::new(), "song.wav")
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let registry = TaskRegistry::new();
        let t = task();
        let id = t.id;
        registry.create(t).await.unwrap();
        let got = registry.get(&id).await.unwrap();
        assert_eq!(got.status, TaskStatus::Pending);
        assert_eq!(got.filename, "song.wav");
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let registry = TaskRegistry::new();
        let t = task();
        registry.create(t.clone()).await.unwrap();
        assert!(matches!(
            registry.create(t).await,
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let registry = TaskRegistry::new();
        let err = registry.update(&TaskId::new(), |_| {}).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_task_is_frozen() {
        let registry = TaskRegistry::new();
        let t = task();
        let id = t.id;
        registry.create(t).await.unwrap();
        registry
            .update(&id, |t| t.status = TaskStatus::Cancelled)
            .await
            .unwrap();

        let after = registry
            .update(&id, |t| {
                t.status = TaskStatus::Complete;
                t.stage = Stage::Validation;
                t.percent = 100.0;
            })
            .await
            .unwrap();
        assert_eq!(after.status, TaskStatus::Cancelled);
        assert_eq!(after.stage, Stage::None);
        assert_eq!(after.percent, 0.0);
    }

    #[tokio::test]
    async fn status_never_moves_backward() {
        let registry = TaskRegistry::new();
        let t = task();
        let id = t.id;
        registry.create(t).await.unwrap();
        registry
            .update(&id, |t| t.status = TaskStatus::Running)
            .await
            .unwrap();

        let after = registry
            .update(&id, |t| t.status = TaskStatus::Pending)
            .await
            .unwrap();
        assert_eq!(after.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn percent_monotone_within_stage_resets_across_stages() {
        let registry = TaskRegistry::new();
        let t = task();
        let id = t.id;
        registry.create(t).await.unwrap();
        registry
            .update(&id, |t| {
                t.stage = Stage::Separation;
                t.percent = 60.0;
            })
            .await
            .unwrap();

        // Regression within the stage is clamped.
        let after = registry
            .update(&id, |t| t.percent = 30.0)
            .await
            .unwrap();
        assert_eq!(after.percent, 60.0);

        // Stage boundary resets.
        let after = registry
            .update(&id, |t| {
                t.stage = Stage::MidiConversion;
                t.percent = 0.0;
            })
            .await
            .unwrap();
        assert_eq!(after.stage, Stage::MidiConversion);
        assert_eq!(after.percent, 0.0);
    }

    #[tokio::test]
    async fn expired_respects_cutoff() {
        let registry = TaskRegistry::new();
        let mut old = task();
        old.created_at = Utc::now() - ChronoDuration::hours(2);
        let old_id = old.id;
        let fresh = task();
        let fresh_id = fresh.id;
        registry.create(old).await.unwrap();
        registry.create(fresh).await.unwrap();

        let cutoff = Utc::now() - ChronoDuration::hours(1);
        let expired = registry.expired(cutoff).await;
        assert_eq!(expired, vec![old_id]);
        assert!(registry.get(&fresh_id).await.is_some());
    }

    #[tokio::test]
    async fn expired_skips_running_tasks() {
        let registry = TaskRegistry::new();
        let mut old = task();
        old.created_at = Utc::now() - ChronoDuration::hours(2);
        let id = old.id;
        registry.create(old).await.unwrap();
        registry
            .update(&id, |t| t.status = TaskStatus::Running)
            .await
            .unwrap();

        let cutoff = Utc::now() - ChronoDuration::hours(1);
        assert!(registry.expired(cutoff).await.is_empty());

        // Collectable again once the pipeline lands in a terminal status.
        registry
            .update(&id, |t| t.status = TaskStatus::Complete)
            .await
            .unwrap();
        assert_eq!(registry.expired(cutoff).await, vec![id]);
    }

    #[tokio::test]
    async fn active_count_counts_running_only() {
        let registry = TaskRegistry::new();
        let a = task();
        let b = task();
        let a_id = a.id;
        registry.create(a).await.unwrap();
        registry.create(b).await.unwrap();
        registry
            .update(&a_id, |t| t.status = TaskStatus::Running)
            .await
            .unwrap();
        assert_eq!(registry.active_count().await, 1);
    }
}
