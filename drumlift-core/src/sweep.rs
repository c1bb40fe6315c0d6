//! Retention sweep.
//!
//! Tasks and their artifacts live for a fixed window after creation. A
//! background loop purges expired registry entries, their blobs, and any
//! orphaned files left behind by a crash, independent of request traffic.

use crate::artifacts::ArtifactStore;
use crate::progress::ProgressChannels;
use crate::registry::TaskRegistry;
use chrono::Utc;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One sweep pass. Returns how many tasks were purged.
pub async fn sweep_once(
    registry: &TaskRegistry,
    store: &ArtifactStore,
    channels: &ProgressChannels,
    retention: Duration,
) -> usize {
    let window = chrono::Duration::from_std(retention)
        .unwrap_or_else(|_| chrono::Duration::hours(1));
    let expired = registry.expired(Utc::now() - window).await;

    for id in &expired {
        registry.remove(id).await;
        channels.drop_task(*id);
        store.delete_all(*id).await;
        debug!("expired task {} purged", id);
    }

    store
        .prune_orphans(SystemTime::now() - retention, &registry.ids().await)
        .await;

    if !expired.is_empty() {
        info!("sweep purged {} expired task(s)", expired.len());
    }
    expired.len()
}

/// Sweep loop on a fixed interval, until `shutdown` fires.
pub async fn run_sweeper(
    registry: TaskRegistry,
    store: ArtifactStore,
    channels: ProgressChannels,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "retention sweep running every {:?} (window {:?})",
        interval, retention
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sweep_once(&registry, &store, &channels, retention).await;
            }
        }
    }
    info!("retention sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskId};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn sweep_purges_expired_tasks_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let registry = TaskRegistry::new();
        let channels = ProgressChannels::new();

        let mut old = Task::new(TaskId::new(), "old.wav");
        old.created_at = Utc::now() - ChronoDuration::hours(2);
        let old_id = old.id;
        let old_input = store.put_input(old_id, b"old", ".wav").await.unwrap();
        registry.create(old).await.unwrap();

        let fresh = Task::new(TaskId::new(), "fresh.wav");
        let fresh_id = fresh.id;
        let fresh_input = store.put_input(fresh_id, b"new", ".wav").await.unwrap();
        registry.create(fresh).await.unwrap();

        let purged = sweep_once(
            &registry,
            &store,
            &channels,
            Duration::from_secs(3600),
        )
        .await;

        assert_eq!(purged, 1);
        assert!(registry.get(&old_id).await.is_none());
        assert!(store.read(&old_input).await.is_err());
        assert!(registry.get(&fresh_id).await.is_some());
        assert!(store.read(&fresh_input).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_leaves_running_tasks_alone() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let registry = TaskRegistry::new();
        let channels = ProgressChannels::new();

        // Past the retention window but still mid-pipeline: neither the
        // registry entry nor the input file may be touched.
        let mut task = Task::new(TaskId::new(), "long.wav");
        task.created_at = Utc::now() - ChronoDuration::hours(2);
        let id = task.id;
        let input = store.put_input(id, b"mix", ".wav").await.unwrap();
        registry.create(task).await.unwrap();
        registry
            .update(&id, |t| t.status = crate::task::TaskStatus::Running)
            .await
            .unwrap();

        let purged = sweep_once(
            &registry,
            &store,
            &channels,
            Duration::from_secs(3600),
        )
        .await;

        assert_eq!(purged, 0);
        assert!(registry.get(&id).await.is_some());
        assert!(store.read(&input).await.is_ok());

        // Once the pipeline finishes, the next pass collects it.
        registry
            .update(&id, |t| t.status = crate::task::TaskStatus::Complete)
            .await
            .unwrap();
        let purged = sweep_once(
            &registry,
            &store,
            &channels,
            Duration::from_secs(3600),
        )
        .await;
        assert_eq!(purged, 1);
        assert!(store.read(&input).await.is_err());
    }

    #[tokio::test]
    async fn sweep_is_a_noop_when_nothing_expired() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let registry = TaskRegistry::new();
        let channels = ProgressChannels::new();

        registry
            .create(Task::new(TaskId::new(), "song.wav"))
            .await
            .unwrap();
        let purged = sweep_once(
            &registry,
            &store,
            &channels,
            Duration::from_secs(3600),
        )
        .await;
        assert_eq!(purged, 0);
    }
}
