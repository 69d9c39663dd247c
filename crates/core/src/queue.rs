//! Producer and administration API of a queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::{FerryError, Result};
use crate::events::{EventBus, QueueEvent};
use crate::job::{millis_i64, now_ms, AddOptions, Job, JobId, JobState};
use crate::store::{InsertOutcome, JobCounts, SharedStore, Store};

/// Result of [`Queue::add`].
#[derive(Debug, Clone)]
pub struct JobHandle {
    job: Job,
    duplicated: bool,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    /// The stored job: the new one, or the existing one for a duplicate.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Whether a job with the requested id already existed.
    pub fn is_duplicate(&self) -> bool {
        self.duplicated
    }

    /// The created job, or `Duplicate` if the id was already taken.
    pub fn into_created(self) -> Result<Job> {
        if self.duplicated {
            Err(FerryError::Duplicate(self.job.id.to_string()))
        } else {
            Ok(self.job)
        }
    }
}

/// Counts and flags of a queue at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub paused: bool,
    pub counts: JobCounts,
}

/// Window into a state list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Handle for enqueueing and administering the jobs of one queue.
#[derive(Clone)]
pub struct Queue {
    config: QueueConfig,
    store: SharedStore,
    events: EventBus,
}

impl Queue {
    /// Create a new queue handle.
    pub fn new(config: QueueConfig, store: SharedStore, events: EventBus) -> Self {
        Self {
            config,
            store,
            events,
        }
    }

    /// Create a queue handle with its own store.
    pub fn with_store(config: QueueConfig, store: impl Store + 'static, events: EventBus) -> Self {
        Self::new(config, SharedStore::new(store), events)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Enqueue a job.
    ///
    /// With a caller-supplied id the call is idempotent: if the id exists the
    /// stored job is returned untouched and marked as a duplicate.
    pub async fn add<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        options: AddOptions,
    ) -> Result<JobHandle> {
        if name.is_empty() {
            return Err(FerryError::Validation("job name must not be empty".to_string()));
        }
        let opts = options.resolve(&self.config.default_job_options);
        opts.validate()?;
        let data = serde_json::to_value(payload)?;

        let (id, generated) = match options.job_id {
            Some(id) => {
                let id = JobId::from(id);
                if id.as_str().is_empty() {
                    return Err(FerryError::Validation("job id must not be empty".to_string()));
                }
                if id.is_sequence_shaped() {
                    return Err(FerryError::Validation(format!(
                        "job id {} is reserved for generated ids",
                        id
                    )));
                }
                (id, false)
            }
            None => (
                JobId::from_sequence(self.store.next_job_id(self.name()).await?),
                true,
            ),
        };

        let job = Job::new(self.name(), id, name, data, opts, now_ms());
        let _order = self.events.ordered(self.name()).await;
        match self.store.insert_job(&job).await? {
            InsertOutcome::Inserted(job) => {
                let delayed = job.state == JobState::Delayed;
                tracing::debug!(
                    queue = %self.name(),
                    job_id = %job.id,
                    job_name = %job.name,
                    run_at = ?job.run_at,
                    "Job added"
                );
                self.events.publish(
                    self.name(),
                    QueueEvent::Added {
                        job_id: job.id.clone(),
                        name: job.name.clone(),
                        delayed,
                    },
                );
                if delayed {
                    self.events.deadline_changed(self.name());
                } else {
                    self.events.wake(self.name());
                }
                Ok(JobHandle {
                    job,
                    duplicated: false,
                })
            }
            InsertOutcome::Duplicate(existing) if generated => {
                let reason = format!(
                    "generated job id {} already exists; the id sequence went backwards",
                    existing.id
                );
                tracing::error!(queue = %self.name(), job_id = %existing.id, "Queue halted: {}", reason);
                self.store.halt(self.name(), &reason).await?;
                let err = FerryError::Corrupted(format!("{}: {}", self.name(), reason));
                self.events.publish(
                    self.name(),
                    QueueEvent::Error {
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
            InsertOutcome::Duplicate(existing) => {
                tracing::debug!(queue = %self.name(), job_id = %existing.id, "Duplicate job id");
                self.events.publish(
                    self.name(),
                    QueueEvent::Duplicated {
                        job_id: existing.id.clone(),
                    },
                );
                Ok(JobHandle {
                    job: existing,
                    duplicated: true,
                })
            }
        }
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(self.name(), id).await
    }

    /// Delete a job that is not active. Returns `false` if it did not exist.
    pub async fn remove(&self, id: &JobId) -> Result<bool> {
        let _order = self.events.ordered(self.name()).await;
        match self.store.remove_job(self.name(), id).await? {
            Some(job) => {
                tracing::debug!(queue = %self.name(), job_id = %job.id, state = %job.state, "Job removed");
                self.publish_removed(std::slice::from_ref(&job.id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop workers from claiming jobs of this queue.
    pub async fn pause(&self) -> Result<()> {
        let _order = self.events.ordered(self.name()).await;
        self.store.set_paused(self.name(), true).await?;
        tracing::info!(queue = %self.name(), "Queue paused");
        self.events.publish(self.name(), QueueEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let _order = self.events.ordered(self.name()).await;
        self.store.set_paused(self.name(), false).await?;
        tracing::info!(queue = %self.name(), "Queue resumed");
        self.events.publish(self.name(), QueueEvent::Resumed);
        self.events.wake(self.name());
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.store.is_paused(self.name()).await
    }

    /// Delete all waiting jobs, and delayed ones too if requested.
    pub async fn drain(&self, include_delayed: bool) -> Result<usize> {
        let _order = self.events.ordered(self.name()).await;
        let drained = self.store.drain(self.name(), include_delayed).await?;
        tracing::info!(queue = %self.name(), count = drained.len(), "Queue drained");
        self.publish_removed(&drained);
        self.events.publish(self.name(), QueueEvent::Drained);
        Ok(drained.len())
    }

    /// Delete up to `limit` jobs in `state` older than `grace`.
    ///
    /// Finished jobs are aged by finish time, others by creation time. Active
    /// jobs are never cleaned.
    pub async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> Result<Vec<JobId>> {
        if state == JobState::Active {
            return Err(FerryError::Validation("active jobs cannot be cleaned".to_string()));
        }
        let older_than = now_ms().saturating_sub(millis_i64(grace));
        let _order = self.events.ordered(self.name()).await;
        let cleaned = self.store.clean(self.name(), state, older_than, limit).await?;

        tracing::info!(queue = %self.name(), state = %state, count = cleaned.len(), "Queue cleaned");
        self.publish_removed(&cleaned);
        self.events.publish(
            self.name(),
            QueueEvent::Cleaned {
                count: cleaned.len(),
            },
        );
        Ok(cleaned)
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.store.counts(self.name()).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            name: self.name().to_string(),
            paused: self.store.is_paused(self.name()).await?,
            counts: self.store.counts(self.name()).await?,
        })
    }

    /// Page through a state list.
    pub async fn list_jobs(&self, state: JobState, page: Page) -> Result<Vec<Job>> {
        self.store
            .list_jobs(self.name(), state, page.offset, page.limit)
            .await
    }

    fn publish_removed(&self, removed: &[JobId]) {
        for job_id in removed {
            self.events.publish(
                self.name(),
                QueueEvent::Removed {
                    job_id: job_id.clone(),
                },
            );
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}
