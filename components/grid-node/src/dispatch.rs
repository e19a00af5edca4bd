use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::SubJob;

#[derive(Debug, Clone)]
pub struct Assignment {
    pub sub_job: SubJob,
    pub worker_id: String,
    pub assigned_at: Instant,
}

#[derive(Default)]
struct DispatchInner {
    queue: VecDeque<SubJob>,
    pending: HashMap<String, Assignment>,
}

/// FIFO sub-job queue plus the pending-assignment map, both behind one
/// lock so pull and submit stay O(1) critical sections. The worker table
/// lives apart and is only touched by heartbeats and the sweep.
pub struct Dispatcher {
    inner: Mutex<DispatchInner>,
    workers: DashMap<String, Instant>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DispatchInner::default()),
            workers: DashMap::new(),
        }
    }

    pub async fn enqueue_all(&self, sub_jobs: Vec<SubJob>) {
        let mut inner = self.inner.lock().await;
        inner.queue.extend(sub_jobs);
    }

    pub async fn pull(&self, worker_id: &str) -> Option<SubJob> {
        self.workers.insert(worker_id.to_string(), Instant::now());
        let mut inner = self.inner.lock().await;
        let sub_job = inner.queue.pop_front()?;
        inner.pending.insert(
            sub_job.id.clone(),
            Assignment {
                sub_job: sub_job.clone(),
                worker_id: worker_id.to_string(),
                assigned_at: Instant::now(),
            },
        );
        Some(sub_job)
    }

    /// Clears the pending entry for a submitted result. A second
    /// submission (or one raced by the dead-worker sweep) finds nothing
    /// and that is fine; the aggregator tolerates the duplicate.
    pub async fn complete(&self, sub_job_id: &str) -> Option<Assignment> {
        self.inner.lock().await.pending.remove(sub_job_id)
    }

    pub fn heartbeat(&self, worker_id: &str) {
        self.workers.insert(worker_id.to_string(), Instant::now());
    }

    /// Re-enqueues every assignment held by a worker that has missed its
    /// heartbeats, and forgets the worker. Returns `(worker, requeued)`
    /// pairs for the log.
    pub async fn sweep_dead(&self, dead_after: Duration) -> Vec<(String, usize)> {
        let dead: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| entry.value().elapsed() > dead_after)
            .map(|entry| entry.key().clone())
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }
        let mut swept = Vec::new();
        let mut inner = self.inner.lock().await;
        for worker_id in dead {
            self.workers.remove(&worker_id);
            let ids: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, a)| a.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(assignment) = inner.pending.remove(id) {
                    inner.queue.push_back(assignment.sub_job);
                }
            }
            swept.push((worker_id, ids.len()));
        }
        swept
    }

    /// Purges queued and pending sub-jobs of a terminal job.
    pub async fn drop_job(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.queue.retain(|s| s.job_id != job_id);
        inner.pending.retain(|_, a| a.sub_job.job_id != job_id);
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice::{Board, Strategy};

    fn sub_job(job_id: Uuid, seq: u32, index: u32) -> SubJob {
        let context = Board::blank(4).unwrap();
        SubJob {
            id: format!("{job_id}.{seq}"),
            job_id,
            partition_index: index,
            values: vec![0; 4],
            iteration: 1,
            is_requeue: false,
            context,
        }
    }

    #[tokio::test]
    async fn pulls_in_fifo_order() {
        let dispatcher = Dispatcher::new();
        let job_id = Uuid::new_v4();
        dispatcher
            .enqueue_all((1..=3).map(|i| sub_job(job_id, i, i - 1)).collect())
            .await;
        for seq in 1..=3 {
            let pulled = dispatcher.pull("w1").await.unwrap();
            assert_eq!(pulled.id, format!("{job_id}.{seq}"));
        }
        assert!(dispatcher.pull("w1").await.is_none());
    }

    #[tokio::test]
    async fn complete_clears_the_assignment_once() {
        let dispatcher = Dispatcher::new();
        let job_id = Uuid::new_v4();
        dispatcher.enqueue_all(vec![sub_job(job_id, 1, 0)]).await;
        let pulled = dispatcher.pull("w1").await.unwrap();
        let assignment = dispatcher.complete(&pulled.id).await.unwrap();
        assert_eq!(assignment.worker_id, "w1");
        assert!(dispatcher.complete(&pulled.id).await.is_none());
    }

    #[tokio::test]
    async fn dead_workers_give_their_work_back() {
        let dispatcher = Dispatcher::new();
        let job_id = Uuid::new_v4();
        dispatcher
            .enqueue_all(vec![sub_job(job_id, 1, 0), sub_job(job_id, 2, 1)])
            .await;
        dispatcher.pull("doomed").await.unwrap();
        dispatcher.pull("alive").await.unwrap();

        // Only "doomed" has gone silent.
        dispatcher
            .workers
            .insert("doomed".into(), Instant::now() - Duration::from_secs(120));
        let swept = dispatcher.sweep_dead(Duration::from_secs(90)).await;
        assert_eq!(swept, vec![("doomed".to_string(), 1)]);
        assert_eq!(dispatcher.queue_len().await, 1);

        // The requeued sub-job is delivered again (weak fairness).
        let retried = dispatcher.pull("alive").await.unwrap();
        assert_eq!(retried.id, format!("{job_id}.1"));
        assert!(!dispatcher.workers.contains_key("doomed"));
    }

    #[tokio::test]
    async fn heartbeats_keep_a_worker_alive() {
        let dispatcher = Dispatcher::new();
        let job_id = Uuid::new_v4();
        dispatcher.enqueue_all(vec![sub_job(job_id, 1, 0)]).await;
        dispatcher.pull("w1").await.unwrap();
        dispatcher.heartbeat("w1");
        let swept = dispatcher.sweep_dead(Duration::from_secs(90)).await;
        assert!(swept.is_empty());
        assert_eq!(dispatcher.queue_len().await, 0);
    }

    #[tokio::test]
    async fn drop_job_purges_queue_and_pending() {
        let dispatcher = Dispatcher::new();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        dispatcher
            .enqueue_all(vec![sub_job(gone, 1, 0), sub_job(keep, 1, 0)])
            .await;
        dispatcher.pull("w1").await.unwrap(); // assigns gone.1
        dispatcher.enqueue_all(vec![sub_job(gone, 2, 1)]).await;
        dispatcher.drop_job(gone).await;
        assert_eq!(dispatcher.queue_len().await, 1);
        let left = dispatcher.pull("w1").await.unwrap();
        assert_eq!(left.job_id, keep);
        assert!(dispatcher.complete(&format!("{gone}.1")).await.is_none());
    }
}
