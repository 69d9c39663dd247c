//! Scenarios spanning queue, scheduler, worker pool and event bus.

mod limits;
mod ordering;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{QueueConfig, WorkerConfig, WorkerConfigBuilder};
use crate::error::Result;
use crate::events::{Event, EventBus, EventStream};
use crate::job::{Job, JobId, JobOptions, JobState};
use crate::memory::MemoryStore;
use crate::pool::WorkerPool;
use crate::queue::Queue;
use crate::store::{InsertOutcome, JobCounts, LeaseRequest, Released, SharedStore, Store, Transition};
use crate::worker::{JobContext, JobResult};

pub(crate) const QUEUE: &str = "scenario";

pub(crate) fn queue_with(defaults: JobOptions) -> Queue {
    Queue::new(
        QueueConfig::new(QUEUE).default_job_options(defaults),
        SharedStore::new(MemoryStore::new()),
        EventBus::new(),
    )
}

/// Worker settings with short intervals so scenarios finish quickly.
pub(crate) fn fast_config() -> WorkerConfigBuilder {
    WorkerConfig::builder()
        .queue(QUEUE)
        .poll_interval(Duration::from_millis(20))
        .error_backoff(Duration::from_millis(20))
        .scheduler_interval(Duration::from_millis(20))
        .stalled_interval(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(2))
}

/// A pool running in the background until `stop` is called.
pub(crate) struct RunningPool {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningPool {
    pub(crate) fn start<F, Fut>(queue: &Queue, config: WorkerConfig, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let pool = WorkerPool::builder()
            .config(config)
            .shared_store(queue.store().clone())
            .events(queue.events().clone())
            .handler(handler)
            .build()
            .unwrap();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            pool.run_until(async {
                stopped.await.ok();
            })
            .await
        });
        Self {
            stop: Some(stop),
            task,
        }
    }

    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("pool did not stop in time")
            .expect("pool task panicked")
    }
}

/// Poll `check` until it returns true or a few seconds pass.
pub(crate) async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Everything buffered on the stream so far.
pub(crate) fn drain(stream: &mut EventStream) -> Vec<Event> {
    std::iter::from_fn(|| stream.try_recv()).collect()
}

/// Store whose writes return only after a delay, as with a remote database
/// under load. The change is visible to other callers before the call returns.
pub(crate) struct SlowStore {
    inner: MemoryStore,
    latency: Duration,
}

impl SlowStore {
    pub(crate) fn new(latency: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            latency,
        }
    }

    async fn settle<T>(&self, result: Result<T>) -> Result<T> {
        tokio::time::sleep(self.latency).await;
        result
    }
}

#[async_trait]
impl Store for SlowStore {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn next_job_id(&self, queue: &str) -> Result<u64> {
        self.inner.next_job_id(queue).await
    }

    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        let result = self.inner.insert_job(job).await;
        self.settle(result).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        self.inner.get_job(queue, id).await
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        let result = self.inner.remove_job(queue, id).await;
        self.settle(result).await
    }

    async fn claim(&self, queue: &str, lease: &LeaseRequest, now: i64) -> Result<Option<Job>> {
        let result = self.inner.claim(queue, lease, now).await;
        self.settle(result).await
    }

    async fn extend_lease(&self, queue: &str, id: &JobId, token: &str, until: i64) -> Result<bool> {
        self.inner.extend_lease(queue, id, token, until).await
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        progress: serde_json::Value,
    ) -> Result<()> {
        let result = self.inner.update_progress(queue, id, token, progress).await;
        self.settle(result).await
    }

    async fn release(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Released> {
        let result = self.inner.release(queue, id, token, transition, now).await;
        self.settle(result).await
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        self.inner.promote_delayed(queue, now, limit).await
    }

    async fn next_delayed_at(&self, queue: &str) -> Result<Option<i64>> {
        self.inner.next_delayed_at(queue).await
    }

    async fn stalled_jobs(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<Job>> {
        self.inner.stalled_jobs(queue, now, limit).await
    }

    async fn reclaim_stalled(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Option<Released>> {
        let result = self.inner.reclaim_stalled(queue, id, token, transition, now).await;
        self.settle(result).await
    }

    async fn purge_expired(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        self.inner.purge_expired(queue, now, limit).await
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        self.inner.clean(queue, state, older_than, limit).await
    }

    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<Vec<JobId>> {
        self.inner.drain(queue, include_delayed).await
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        self.inner.set_paused(queue, paused).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.inner.is_paused(queue).await
    }

    async fn halt(&self, queue: &str, reason: &str) -> Result<()> {
        self.inner.halt(queue, reason).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.inner.counts(queue).await
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        self.inner.list_jobs(queue, state, offset, limit).await
    }

    async fn queues(&self) -> Result<Vec<String>> {
        self.inner.queues().await
    }
}
