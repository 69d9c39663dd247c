//! In-process store.
//!
//! All queues live behind a single mutex, which makes every operation
//! trivially atomic and linearizable. Data does not survive the process; use
//! a persistent store (such as `ferry-sqlite`) when durability matters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{FerryError, Result};
use crate::job::{millis_i64, Job, JobId, JobState, Retention};
use crate::store::{InsertOutcome, JobCounts, LeaseRequest, Released, Store, Transition};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    /// (run_at, insertion order) -> id
    delayed: BTreeMap<(i64, u64), JobId>,
    delayed_keys: HashMap<JobId, (i64, u64)>,
    active: VecDeque<JobId>,
    /// Newest first.
    completed: VecDeque<JobId>,
    /// Newest first.
    failed: VecDeque<JobId>,
    sequence: u64,
    order: u64,
    paused: bool,
    halted: Option<String>,
}

impl QueueState {
    fn link(&mut self, job: &Job) {
        match job.state {
            JobState::Waiting => self.waiting.push_back(job.id.clone()),
            JobState::Delayed => {
                self.order += 1;
                let key = (job.run_at.unwrap_or(0), self.order);
                self.delayed.insert(key, job.id.clone());
                self.delayed_keys.insert(job.id.clone(), key);
            }
            JobState::Active => self.active.push_back(job.id.clone()),
            JobState::Completed => self.completed.push_front(job.id.clone()),
            JobState::Failed => self.failed.push_front(job.id.clone()),
        }
    }

    fn unlink(&mut self, id: &JobId, state: JobState) {
        let list = match state {
            JobState::Delayed => {
                if let Some(key) = self.delayed_keys.remove(id) {
                    self.delayed.remove(&key);
                }
                return;
            }
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        if let Some(pos) = list.iter().position(|candidate| candidate == id) {
            list.remove(pos);
        }
    }

    fn delete(&mut self, id: &JobId) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.unlink(id, job.state);
        Some(job)
    }

    /// Move an active job according to `transition`.
    fn apply(&mut self, id: &JobId, transition: Transition, now: i64) -> Result<Released> {
        let mut job = self
            .jobs
            .remove(id)
            .ok_or_else(|| FerryError::JobNotFound(id.to_string()))?;
        self.unlink(id, job.state);
        transition.apply_to(&mut job, now);

        match job.state {
            JobState::Completed | JobState::Failed => Ok(self.finish(job, now)),
            state => {
                if state == JobState::Waiting {
                    // Retries and stalled jobs go back to the head of the line.
                    self.waiting.push_front(job.id.clone());
                } else {
                    self.link(&job);
                }
                self.jobs.insert(job.id.clone(), job.clone());
                Ok(Released {
                    job,
                    removed: Vec::new(),
                })
            }
        }
    }

    /// Link a finished job and apply its retention policy.
    fn finish(&mut self, mut job: Job, now: i64) -> Released {
        let retention = job.opts.retention_for(job.state);
        let mut removed = Vec::new();

        if retention == Retention::Remove {
            removed.push(job.id.clone());
            return Released { job, removed };
        }

        job.expires_at = retention.expires_at(now);
        self.link(&job);
        self.jobs.insert(job.id.clone(), job.clone());

        if let Some(keep) = retention.keep_last() {
            let list = if job.state == JobState::Completed {
                &mut self.completed
            } else {
                &mut self.failed
            };
            let mut trimmed = Vec::new();
            while list.len() > keep {
                if let Some(oldest) = list.pop_back() {
                    trimmed.push(oldest);
                }
            }
            for id in trimmed {
                self.jobs.remove(&id);
                removed.push(id);
            }
        }

        Released { job, removed }
    }

    fn ids_in(&self, state: JobState) -> Vec<JobId> {
        match state {
            JobState::Waiting => self.waiting.iter().cloned().collect(),
            JobState::Delayed => self.delayed.values().cloned().collect(),
            JobState::Active => self.active.iter().cloned().collect(),
            JobState::Completed => self.completed.iter().cloned().collect(),
            JobState::Failed => self.failed.iter().cloned().collect(),
        }
    }

    fn check(&self, queue: &str) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(FerryError::Corrupted(format!("{}: {}", queue, reason))),
            None => Ok(()),
        }
    }
}

/// Store keeping all queues in process memory.
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the queue's state, creating it on first use.
    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> Result<R>) -> Result<R> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.check(queue)?;
        f(state)
    }

    /// Read-only access; missing queues behave as empty.
    fn read_queue<R>(
        &self,
        queue: &str,
        default: R,
        f: impl FnOnce(&QueueState) -> R,
    ) -> Result<R> {
        let queues = self.queues.lock();
        match queues.get(queue) {
            Some(state) => {
                state.check(queue)?;
                Ok(f(state))
            }
            None => Ok(default),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn next_job_id(&self, queue: &str) -> Result<u64> {
        self.with_queue(queue, |q| {
            q.sequence += 1;
            Ok(q.sequence)
        })
    }

    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Err(FerryError::Store(format!(
                "cannot insert job {} in state {}",
                job.id, job.state
            )));
        }
        self.with_queue(&job.queue, |q| {
            if let Some(existing) = q.jobs.get(&job.id) {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
            q.link(job);
            q.jobs.insert(job.id.clone(), job.clone());
            Ok(InsertOutcome::Inserted(job.clone()))
        })
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        self.read_queue(queue, None, |q| q.jobs.get(id).cloned())
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        self.with_queue(queue, |q| match q.jobs.get(id) {
            Some(job) if job.state == JobState::Active => {
                Err(FerryError::JobLocked(id.to_string()))
            }
            Some(_) => Ok(q.delete(id)),
            None => Ok(None),
        })
    }

    async fn claim(&self, queue: &str, lease: &LeaseRequest, now: i64) -> Result<Option<Job>> {
        self.with_queue(queue, |q| {
            if q.paused {
                return Ok(None);
            }
            let Some(id) = q.waiting.front().cloned() else {
                return Ok(None);
            };
            let job = q.jobs.get_mut(&id).ok_or_else(|| {
                FerryError::Corrupted(format!("{}: waiting job {} has no record", queue, id))
            })?;
            job.state = JobState::Active;
            job.lock_token = Some(lease.token.clone());
            job.locked_by = Some(lease.worker_id.clone());
            job.lock_until = Some(now.saturating_add(millis_i64(lease.duration)));
            job.processed_at = Some(now);
            job.attempts_started = job.attempts_started.saturating_add(1);
            let claimed = job.clone();
            q.waiting.pop_front();
            q.active.push_back(id);
            Ok(Some(claimed))
        })
    }

    async fn extend_lease(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        until: i64,
    ) -> Result<bool> {
        self.with_queue(queue, |q| match q.jobs.get_mut(id) {
            Some(job) if job.is_locked_by(token) => {
                job.lock_until = Some(until);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        progress: serde_json::Value,
    ) -> Result<()> {
        self.with_queue(queue, |q| match q.jobs.get_mut(id) {
            Some(job) if job.is_locked_by(token) => {
                job.progress = progress;
                Ok(())
            }
            _ => Err(FerryError::LeaseLost(id.to_string())),
        })
    }

    async fn release(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Released> {
        self.with_queue(queue, |q| {
            match q.jobs.get(id) {
                Some(job) if job.is_locked_by(token) => {}
                _ => return Err(FerryError::LeaseLost(id.to_string())),
            }
            q.apply(id, transition, now)
        })
    }

    async fn promote_delayed(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        self.with_queue(queue, |q| {
            let due: Vec<((i64, u64), JobId)> = q
                .delayed
                .range(..=(now, u64::MAX))
                .take(limit)
                .map(|(key, id)| (*key, id.clone()))
                .collect();

            let mut promoted = Vec::with_capacity(due.len());
            for (key, id) in due {
                q.delayed.remove(&key);
                q.delayed_keys.remove(&id);
                if let Some(job) = q.jobs.get_mut(&id) {
                    job.state = JobState::Waiting;
                    job.run_at = None;
                    q.waiting.push_back(id.clone());
                    promoted.push(id);
                }
            }
            Ok(promoted)
        })
    }

    async fn next_delayed_at(&self, queue: &str) -> Result<Option<i64>> {
        self.read_queue(queue, None, |q| {
            q.delayed.keys().next().map(|(run_at, _)| *run_at)
        })
    }

    async fn stalled_jobs(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<Job>> {
        self.read_queue(queue, Vec::new(), |q| {
            q.active
                .iter()
                .filter_map(|id| q.jobs.get(id))
                .filter(|job| job.lease_expired(now))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn reclaim_stalled(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        transition: Transition,
        now: i64,
    ) -> Result<Option<Released>> {
        self.with_queue(queue, |q| {
            match q.jobs.get_mut(id) {
                Some(job) if job.is_locked_by(token) && job.lease_expired(now) => {
                    job.stalled_count = job.stalled_count.saturating_add(1);
                }
                _ => return Ok(None),
            }
            q.apply(id, transition, now).map(Some)
        })
    }

    async fn purge_expired(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<JobId>> {
        self.with_queue(queue, |q| {
            let expired: Vec<JobId> = q
                .completed
                .iter()
                .chain(q.failed.iter())
                .filter(|id| {
                    q.jobs
                        .get(*id)
                        .and_then(|job| job.expires_at)
                        .is_some_and(|at| at <= now)
                })
                .take(limit)
                .cloned()
                .collect();
            for id in &expired {
                q.delete(id);
            }
            Ok(expired)
        })
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<JobId>> {
        if state == JobState::Active {
            return Ok(Vec::new());
        }
        self.with_queue(queue, |q| {
            let victims: Vec<JobId> = q
                .ids_in(state)
                .into_iter()
                .filter(|id| {
                    q.jobs.get(id).is_some_and(|job| {
                        let reference = if state.is_terminal() {
                            job.finished_at.unwrap_or(job.created_at)
                        } else {
                            job.created_at
                        };
                        reference < older_than
                    })
                })
                .take(limit)
                .collect();
            for id in &victims {
                q.delete(id);
            }
            Ok(victims)
        })
    }

    async fn drain(&self, queue: &str, include_delayed: bool) -> Result<Vec<JobId>> {
        self.with_queue(queue, |q| {
            let mut drained: Vec<JobId> = q.waiting.drain(..).collect();
            if include_delayed {
                drained.extend(q.delayed.values().cloned());
                q.delayed.clear();
                q.delayed_keys.clear();
            }
            for id in &drained {
                q.jobs.remove(id);
            }
            Ok(drained)
        })
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        self.with_queue(queue, |q| {
            q.paused = paused;
            Ok(())
        })
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.read_queue(queue, false, |q| q.paused)
    }

    async fn halt(&self, queue: &str, reason: &str) -> Result<()> {
        let mut queues = self.queues.lock();
        queues.entry(queue.to_string()).or_default().halted = Some(reason.to_string());
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.read_queue(queue, JobCounts::default(), |q| JobCounts {
            waiting: q.waiting.len(),
            delayed: q.delayed.len(),
            active: q.active.len(),
            completed: q.completed.len(),
            failed: q.failed.len(),
        })
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        self.read_queue(queue, Vec::new(), |q| {
            q.ids_in(state)
                .iter()
                .skip(offset)
                .take(limit)
                .filter_map(|id| q.jobs.get(id).cloned())
                .collect()
        })
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
