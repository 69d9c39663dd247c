//! Job handler types and per-job processing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{FerryError, Result};
use crate::events::{EventBus, QueueEvent};
use crate::heartbeat::LeaseKeeper;
use crate::job::{now_ms, Job, JobId};
use crate::scheduler::Scheduler;
use crate::store::{LeaseRequest, SharedStore};

/// Result type for job handlers. The value is recorded as the job's return value.
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

/// Error returned from job handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job fails immediately).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// What a handler sees of the job it runs.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    token: String,
    store: SharedStore,
    events: EventBus,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Job>, token: String, store: SharedStore, events: EventBus) -> Self {
        Self {
            job,
            token,
            store,
            events,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// Failed attempts so far; zero on the first run.
    pub fn attempts_made(&self) -> u32 {
        self.job.attempts_made
    }

    /// Number of this run, counting runs cut short by a stall.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_started
    }

    /// Deserialize the payload.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        self.job.payload()
    }

    /// Raw payload.
    pub fn raw_data(&self) -> &serde_json::Value {
        &self.job.data
    }

    /// Full job record as of the claim.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Record progress and publish a `progress` event.
    ///
    /// Fails with `LeaseLost` if the job was reclaimed in the meantime.
    pub async fn update_progress<P: Serialize>(&self, progress: P) -> Result<()> {
        let data = serde_json::to_value(progress)?;
        let _order = self.events.ordered(&self.job.queue).await;
        self.store
            .update_progress(&self.job.queue, &self.job.id, &self.token, data.clone())
            .await?;
        self.events.publish(
            &self.job.queue,
            QueueEvent::Progress {
                job_id: self.job.id.clone(),
                data,
            },
        );
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("queue", &self.job.queue)
            .field("id", &self.job.id)
            .field("name", &self.job.name)
            .finish_non_exhaustive()
    }
}

/// Aborts the task when dropped, so an aborted job also stops its handler
/// and lease renewal.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs claimed jobs through the handler and reports their outcome.
pub(crate) struct Worker<F> {
    pub(crate) worker_id: String,
    pub(crate) store: SharedStore,
    pub(crate) events: EventBus,
    pub(crate) scheduler: Scheduler,
    pub(crate) handler: Arc<F>,
    pub(crate) lease_duration: Duration,
    pub(crate) renew_interval: Duration,
}

impl<F> Clone for Worker<F> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            scheduler: self.scheduler.clone(),
            handler: self.handler.clone(),
            lease_duration: self.lease_duration,
            renew_interval: self.renew_interval,
        }
    }
}

impl<F, Fut> Worker<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    /// Claim the next waiting job of `queue` and publish `active` for it.
    pub async fn claim(&self, queue: &str, lease: &LeaseRequest) -> Result<Option<Job>> {
        let _order = self.events.ordered(queue).await;
        let Some(job) = self.store.claim(queue, lease, now_ms()).await? else {
            return Ok(None);
        };
        self.events.publish(
            queue,
            QueueEvent::Active {
                job_id: job.id.clone(),
                attempt: job.attempts_started,
            },
        );
        Ok(Some(job))
    }

    /// Process one claimed job.
    ///
    /// Handler failures are recorded on the job, not returned. Errors are
    /// store failures while reporting the outcome.
    pub async fn process(&self, job: Job, token: String) -> Result<()> {
        let queue = job.queue.clone();
        let job = Arc::new(job);

        tracing::debug!(
            worker_id = %self.worker_id,
            queue = %queue,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts_started,
            "Processing job"
        );

        let keeper = LeaseKeeper::new(
            self.store.clone(),
            queue.clone(),
            job.id.clone(),
            token.clone(),
            self.lease_duration,
            self.renew_interval,
        );
        let renewal = AbortOnDrop(tokio::spawn(async move { keeper.run().await }));

        let ctx = JobContext::new(
            job.clone(),
            token.clone(),
            self.store.clone(),
            self.events.clone(),
        );
        let outcome = self.run_handler(ctx, job.opts.timeout).await;
        drop(renewal);

        let reported = match outcome {
            Ok(value) => self.scheduler.complete(&job, &token, value).await.map(|_| ()),
            Err(err) => {
                tracing::debug!(
                    worker_id = %self.worker_id,
                    queue = %queue,
                    job_id = %job.id,
                    error = %err,
                    "Job handler failed"
                );
                self.scheduler.fail(&job, &token, &err).await.map(|_| ())
            }
        };

        match reported {
            Ok(()) => Ok(()),
            Err(FerryError::LeaseLost(_)) => {
                // Reclaimed as stalled while running; the new owner decides.
                tracing::warn!(
                    worker_id = %self.worker_id,
                    queue = %queue,
                    job_id = %job.id,
                    "Lease lost before the outcome was recorded, discarding it"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    queue = %queue,
                    job_id = %job.id,
                    error = %e,
                    "Failed to record job outcome"
                );
                self.scheduler.publish_error(&e);
                Err(e)
            }
        }
    }

    /// Run the handler in its own task, turning panics and timeouts into failures.
    async fn run_handler(&self, ctx: JobContext, timeout: Option<Duration>) -> JobResult {
        let mut handle = AbortOnDrop(tokio::spawn((self.handler)(ctx)));

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle.0).await {
                Ok(joined) => joined,
                Err(_) => return Err(JobError::retryable("job timed out")),
            },
            None => (&mut handle.0).await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let reason = e
                    .into_panic()
                    .downcast::<String>()
                    .map(|s| *s)
                    .or_else(|p| p.downcast::<&'static str>().map(|s| s.to_string()))
                    .unwrap_or_else(|_| "unknown panic".to_string());
                Err(JobError::retryable(format!("handler panicked: {}", reason)))
            }
            Err(_) => Err(JobError::retryable("handler cancelled")),
        }
    }
}
