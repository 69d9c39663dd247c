//! Store abstraction for job queue storage.
//!
//! A store holds job records and the five state lists of every queue
//! (waiting, delayed, active, completed, failed). Every operation is atomic:
//! a job is never visible in two lists, and two concurrent claims never hand
//! out the same job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobId, JobState};

/// Lease requested by a worker when claiming a job.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    /// Secret that proves ownership of the claimed job.
    pub token: String,
    /// Identifier of the claiming worker, recorded for inspection.
    pub worker_id: String,
    /// How long the lease lasts unless renewed.
    pub duration: Duration,
}

/// Outcome-driven transition of an active job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to completed, recording the handler result.
    Complete { return_value: serde_json::Value },
    /// Requeue for another attempt: into delayed until `run_at`, or to the
    /// head of waiting when `run_at` is `None`.
    Retry {
        error: String,
        attempts_made: u32,
        run_at: Option<i64>,
    },
    /// Move to failed. No further attempts.
    Fail { error: String, attempts_made: u32 },
}

impl Transition {
    /// Update the job record for this transition: drop the lease and set the
    /// new state and bookkeeping. Placement in the state lists and retention
    /// are left to the store.
    pub fn apply_to(self, job: &mut Job, now: i64) {
        job.lock_token = None;
        job.locked_by = None;
        job.lock_until = None;

        match self {
            Transition::Complete { return_value } => {
                job.state = JobState::Completed;
                job.return_value = Some(return_value);
                job.finished_at = Some(now);
            }
            Transition::Retry {
                error,
                attempts_made,
                run_at,
            } => {
                job.attempts_made = attempts_made;
                job.last_error = Some(error);
                job.run_at = run_at;
                job.state = if run_at.is_some() {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                };
            }
            Transition::Fail {
                error,
                attempts_made,
            } => {
                job.state = JobState::Failed;
                job.attempts_made = attempts_made;
                job.last_error = Some(error);
                job.finished_at = Some(now);
            }
        }
    }
}

/// Result of applying a [`Transition`].
#[derive(Debug, Clone)]
pub struct Released {
    /// The job after the transition. If retention removed it, this is the
    /// last state it had.
    pub job: Job,
    /// Jobs deleted by retention as part of the transition.
    pub removed: Vec<JobId>,
}

/// Result of inserting a job.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A job with the same id already exists; it is returned untouched.
    Duplicate(Job),
}

/// Number of jobs per state list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// Store trait for job queue storage operations.
///
/// Implementations must be thread-safe (Send + Sync). Timestamps are Unix
/// milliseconds supplied by the caller.
#[async_trait]
pub trait Store: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    // ========== Producer Operations ==========

    /// Next value of the queue's monotonic id sequence.
    async fn next_job_id(&self, queue: &str) -> Result<u64>;

    /// Insert a job into waiting or delayed according to its state.
    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome>;

    /// Fetch a job by id.
    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>>;

    /// Delete a job that is not active.
    ///
    /// Returns the deleted job, `None` if it did not exist, or
    /// `JobLocked` if it is held by a lease.
    async fn remove_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>>;

    // ========== Worker Operations ==========

    /// Atomically move the head of waiting into active under a lease.
    ///
    /// Returns `None` when waiting is empty or the queue is paused.
    async fn claim(&self, queue: &str, lease: &LeaseRequest, now: i64) -> Result<Option<Job>>;

    /// Extend the lease on an active job. Returns `false` if `token` no longer owns it.
    async fn extend_lease(&self, queue: &str, id: &JobId, token: &str, until: i64)
        -> Result<bool>;

    /// Record handler progress on an active job owned by `token`.
    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        progress: serde_json::Value,
    ) -> Result<()>;

    /// Apply an outcome transition to an active job owned by `token`.
    ///
    /// Fails with `LeaseLost` if the token no longer owns the job. Finishing
    /// transitions apply the job's retention in the same atomic step.
    async fn release(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Released>;

    // ========== Scheduling Operations ==========

    /// Move delayed jobs whose deadline is at or before `now` to waiting.
    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>>;

    /// Earliest deadline among delayed jobs.
    async fn next_delayed_at(&self, queue: &str) -> Result<Option<i64>>;

    /// Active jobs whose lease expired before `now`.
    async fn stalled_jobs(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<Job>>;

    /// Apply `transition` to a stalled job and count the stall.
    ///
    /// Only succeeds while the job is still active under `token` with an
    /// expired lease; otherwise returns `None`.
    async fn reclaim_stalled(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Option<Released>>;

    /// Delete finished jobs whose retention age elapsed.
    async fn purge_expired(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>>;

    // ========== Administration ==========

    /// Delete up to `limit` jobs in `state` whose reference timestamp
    /// (finish time for finished jobs, creation time otherwise) is older than
    /// `older_than`. Active jobs are never cleaned.
    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<JobId>>;

    /// Delete all waiting jobs, and delayed ones too if requested.
    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<Vec<JobId>>;

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()>;

    async fn is_paused(&self, queue: &str) -> Result<bool>;

    /// Stop all processing of a queue whose state is no longer trustworthy.
    ///
    /// Every later operation on the queue fails with `Corrupted`.
    async fn halt(&self, queue: &str, reason: &str) -> Result<()>;

    // ========== Inspection ==========

    async fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Page through a state list.
    ///
    /// Order: waiting oldest first, delayed by deadline, active by claim,
    /// completed and failed newest first.
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Names of all queues known to the store.
    async fn queues(&self) -> Result<Vec<String>>;
}

/// A type-erased store that can be shared across threads.
pub type DynStore = Arc<dyn Store>;

/// Cheaply cloneable handle around any [`Store`].
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any Store implementation.
    pub fn new<S: Store + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl From<DynStore> for SharedStore {
    fn from(inner: DynStore) -> Self {
        Self { inner }
    }
}

impl Deref for SharedStore {
    type Target = dyn Store;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}
