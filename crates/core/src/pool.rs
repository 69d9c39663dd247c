//! Worker pool for processing jobs.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::error::{FerryError, Result};
use crate::events::{EventBus, QueueEvent};
use crate::heartbeat::generate_worker_id;
use crate::rate_limit::{RateLimit, RateLimiter};
use crate::scheduler::Scheduler;
use crate::store::{LeaseRequest, SharedStore, Store};
use crate::worker::{JobContext, JobResult, Worker};

/// Builder for WorkerPool.
pub struct WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    config: WorkerConfig,
    handler: Option<F>,
    store: Option<SharedStore>,
    events: Option<EventBus>,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Default for WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, Fut> WorkerPoolBuilder<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            handler: None,
            store: None,
            events: None,
            _phantom: PhantomData,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the store.
    pub fn store(mut self, store: impl Store + 'static) -> Self {
        self.store = Some(SharedStore::new(store));
        self
    }

    /// Set a store shared with queues and other pools.
    pub fn shared_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event bus. Without one the pool publishes to a private bus.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the queue to process.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    /// Set the number of concurrent handlers.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Limit claims to `max` per rolling `duration`.
    pub fn limiter(mut self, limit: RateLimit) -> Self {
        self.config.limiter = Some(limit);
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Whether this pool runs the scheduler loop for its queue.
    pub fn run_scheduler(mut self, run: bool) -> Self {
        self.config.run_scheduler = run;
        self
    }

    /// Set the job handler.
    pub fn handler(mut self, handler: F) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the WorkerPool.
    pub fn build(self) -> Result<WorkerPool<F, Fut>> {
        let handler = self
            .handler
            .ok_or_else(|| FerryError::Config("Handler is required".to_string()))?;

        let store = self
            .store
            .ok_or_else(|| FerryError::Config("Store is required".to_string()))?;

        self.config.validate()?;

        Ok(WorkerPool::new(
            self.config,
            handler,
            store,
            self.events.unwrap_or_default(),
        ))
    }
}

/// Worker pool for processing jobs of one queue.
pub struct WorkerPool<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    config: WorkerConfig,
    handler: Arc<F>,
    store: SharedStore,
    events: EventBus,
    worker_id: String,
    running: Arc<AtomicBool>,
    in_progress: Arc<AtomicUsize>,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> WorkerPool<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder<F, Fut> {
        WorkerPoolBuilder::new()
    }

    /// Create a new worker pool with the given configuration, handler, store and bus.
    pub fn new(config: WorkerConfig, handler: F, store: SharedStore, events: EventBus) -> Self {
        let worker_id = config.worker_id.clone().unwrap_or_else(generate_worker_id);

        Self {
            config,
            handler: Arc::new(handler),
            store,
            events,
            worker_id,
            running: Arc::new(AtomicBool::new(false)),
            in_progress: Arc::new(AtomicUsize::new(0)),
            _phantom: PhantomData,
        }
    }

    /// Get the worker ID recorded on claimed jobs.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The bus this pool publishes to.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the worker pool until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the worker pool until the provided shutdown future completes.
    ///
    /// On shutdown the pool stops claiming, gives in-flight handlers up to
    /// `shutdown_timeout` to finish and aborts the rest. Aborted jobs stay
    /// active until their lease expires and are then reclaimed as stalled.
    ///
    /// Returns early with `Corrupted` if the store reports the queue as
    /// halted.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        self.store.ping().await?;

        self.running.store(true, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            self.config.queue.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.scheduler.clone(),
        );

        let mut tasks = JoinSet::new();
        if self.config.run_scheduler {
            let scheduler = scheduler.clone();
            let stop_rx = stop_rx.clone();
            tasks.spawn(async move { scheduler.run(stop_rx).await });
        }

        let dispatcher = Dispatcher {
            config: self.config.clone(),
            worker: Worker {
                worker_id: self.worker_id.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
                scheduler,
                handler: self.handler.clone(),
                lease_duration: self.config.lease_duration,
                renew_interval: self.config.renew_interval(),
            },
            in_progress: self.in_progress.clone(),
        };
        let mut dispatch = tokio::spawn(dispatcher.run(stop_rx));

        tracing::info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            worker_id = %self.worker_id,
            "Worker pool started"
        );

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(queue = %self.config.queue, "Shutdown requested, draining...");
                let _ = stop_tx.send(true);
                (&mut dispatch).await
            }
            joined = &mut dispatch => joined,
        };
        let _ = stop_tx.send(true);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Dispatcher panicked");
                Ok(())
            }
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Scheduler stopped with error"),
                Err(e) => tracing::error!(error = %e, "Task panicked"),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(worker_id = %self.worker_id, "Worker pool stopped");
        result
    }

    /// Get the number of in-progress jobs.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Decrements the in-progress counter when a job task ends, aborted or not.
struct InProgress(Arc<AtomicUsize>);

impl InProgress {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Claim loop of a pool.
struct Dispatcher<F> {
    config: WorkerConfig,
    worker: Worker<F>,
    in_progress: Arc<AtomicUsize>,
}

impl<F, Fut> Dispatcher<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let queue = self.config.queue.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut limiter = self.config.limiter.map(RateLimiter::new);
        let waker = self.worker.events.waker(&queue);
        let mut jobs: JoinSet<Result<()>> = JoinSet::new();
        let mut worked_since_drained = false;
        let mut halted = None;

        tracing::debug!(queue = %queue, worker_id = %self.worker.worker_id, "Dispatcher started");

        loop {
            while let Some(joined) = jobs.try_join_next() {
                if let Some(e) = fatal(joined) {
                    halted = Some(e);
                }
            }
            if halted.is_some() || *stop.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = stop.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Some(limiter) = limiter.as_mut() {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = limiter.ready() => {}
                }
            }

            // Registered before the claim so a wake-up between an empty claim
            // and the wait below is not lost.
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lease = LeaseRequest {
                token: uuid::Uuid::new_v4().to_string(),
                worker_id: self.worker.worker_id.clone(),
                duration: self.config.lease_duration,
            };

            match self.worker.claim(&queue, &lease).await {
                Ok(Some(job)) => {
                    if let Some(limiter) = limiter.as_mut() {
                        limiter.record(tokio::time::Instant::now());
                    }
                    worked_since_drained = true;

                    let worker = self.worker.clone();
                    let guard = InProgress::enter(&self.in_progress);
                    jobs.spawn(async move {
                        let _permit = permit;
                        let _guard = guard;
                        worker.process(job, lease.token).await
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if worked_since_drained {
                        worked_since_drained = false;
                        tracing::debug!(queue = %queue, "Queue drained");
                        self.worker.events.publish(&queue, QueueEvent::Drained);
                    }
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(queue = %queue, error = %e, "Failed to claim job");
                    self.worker.scheduler.publish_error(&e);
                    if e.is_fatal() {
                        halted = Some(e);
                        break;
                    }
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        self.drain_jobs(&mut jobs).await;
        tracing::debug!(queue = %queue, worker_id = %self.worker.worker_id, "Dispatcher stopped");

        match halted {
            Some(e) => {
                tracing::error!(queue = %queue, error = %e, "Worker halted");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Wait for in-flight jobs up to the shutdown timeout, then abort the rest.
    async fn drain_jobs(&self, jobs: &mut JoinSet<Result<()>>) {
        if jobs.is_empty() {
            return;
        }

        tracing::info!(
            queue = %self.config.queue,
            in_progress = jobs.len(),
            "Waiting for in-flight jobs"
        );
        let waited = tokio::time::timeout(self.config.shutdown_timeout, async {
            while jobs.join_next().await.is_some() {}
        })
        .await;

        if waited.is_err() {
            tracing::warn!(
                queue = %self.config.queue,
                in_progress = jobs.len(),
                "Shutdown timeout reached, aborting remaining jobs"
            );
            jobs.abort_all();
            while jobs.join_next().await.is_some() {}
        }
    }
}

/// The fatal store error a finished job task reported, if any.
fn fatal(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Option<FerryError> {
    match joined {
        Ok(Err(e)) if e.is_fatal() => Some(e),
        Ok(_) => None,
        Err(e) => {
            if e.is_panic() {
                tracing::error!(error = %e, "Job task panicked");
            }
            None
        }
    }
}
