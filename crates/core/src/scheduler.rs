//! Scheduler for job state transitions.
//!
//! Applies handler outcomes (completion, retry with backoff, terminal
//! failure), promotes delayed jobs whose deadline passed, reclaims stalled
//! jobs and purges finished jobs whose retention expired.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::config::SchedulerConfig;
use crate::error::{FerryError, Result};
use crate::events::{EventBus, QueueEvent};
use crate::job::{millis_i64, now_ms, Job, JobId};
use crate::store::{Released, SharedStore, Transition};
use crate::worker::JobError;

/// Drives the time- and outcome-based transitions of one queue.
///
/// Cheap to clone; workers keep a clone to report handler outcomes.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub(crate) queue: String,
    pub(crate) store: SharedStore,
    pub(crate) events: EventBus,
    pub(crate) config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new Scheduler.
    pub fn new(
        queue: impl Into<String>,
        store: SharedStore,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            events,
            config,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Mark an active job completed.
    pub async fn complete(
        &self,
        job: &Job,
        token: &str,
        return_value: serde_json::Value,
    ) -> Result<Released> {
        let _order = self.events.ordered(&self.queue).await;
        let released = self
            .store
            .release(
                &self.queue,
                &job.id,
                token,
                Transition::Complete {
                    return_value: return_value.clone(),
                },
                now_ms(),
            )
            .await?;

        tracing::debug!(queue = %self.queue, job_id = %job.id, "Job completed");
        self.events.publish(
            &self.queue,
            QueueEvent::Completed {
                job_id: job.id.clone(),
                return_value,
            },
        );
        self.publish_removed(&released.removed);
        Ok(released)
    }

    /// Record a failed attempt of an active job.
    ///
    /// Retryable failures with attempts left go back to delayed (or to the
    /// head of waiting when the backoff is zero). Anything else fails the job.
    pub async fn fail(&self, job: &Job, token: &str, error: &JobError) -> Result<Released> {
        let now = now_ms();
        let attempts_made = job.attempts_made.saturating_add(1);
        let exhausted = !job.opts.attempts.allows_another(attempts_made);
        let _order = self.events.ordered(&self.queue).await;

        if error.retryable && !exhausted {
            let run_at = self.retry_at(job, attempts_made, now);
            let released = self
                .store
                .release(
                    &self.queue,
                    &job.id,
                    token,
                    Transition::Retry {
                        error: error.message.clone(),
                        attempts_made,
                        run_at,
                    },
                    now,
                )
                .await?;

            tracing::debug!(
                queue = %self.queue,
                job_id = %job.id,
                attempts_made,
                run_at = ?run_at,
                error = %error.message,
                "Job scheduled for retry"
            );
            self.events.publish(
                &self.queue,
                QueueEvent::Failed {
                    job_id: job.id.clone(),
                    error: error.message.clone(),
                    attempts_made,
                    will_retry: true,
                },
            );
            self.signal_requeued(run_at);
            return Ok(released);
        }

        let released = self
            .store
            .release(
                &self.queue,
                &job.id,
                token,
                Transition::Fail {
                    error: error.message.clone(),
                    attempts_made,
                },
                now,
            )
            .await?;

        tracing::warn!(
            queue = %self.queue,
            job_id = %job.id,
            attempts_made,
            error = %error.message,
            "Job failed"
        );
        self.publish_terminal_failure(&job.id, &error.message, attempts_made, exhausted);
        self.publish_removed(&released.removed);
        Ok(released)
    }

    /// Move every due delayed job to waiting. Returns how many were moved.
    pub async fn promote_delayed(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let promoted = self
                .store
                .promote_delayed(&self.queue, now_ms(), self.config.batch_size)
                .await?;
            total += promoted.len();
            if promoted.len() < self.config.batch_size {
                break;
            }
        }

        if total > 0 {
            tracing::debug!(queue = %self.queue, count = total, "Promoted delayed jobs");
            self.events.wake(&self.queue);
        }
        Ok(total)
    }

    /// Delete finished jobs whose retention age elapsed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let _order = self.events.ordered(&self.queue).await;
            let purged = self
                .store
                .purge_expired(&self.queue, now_ms(), self.config.batch_size)
                .await?;
            total += purged.len();
            self.publish_removed(&purged);
            if purged.len() < self.config.batch_size {
                break;
            }
        }

        if total > 0 {
            tracing::debug!(queue = %self.queue, count = total, "Purged expired jobs");
        }
        Ok(total)
    }

    /// One pass of the periodic work.
    pub async fn tick(&self, check_stalled: bool) -> Result<()> {
        self.promote_delayed().await?;
        if check_stalled {
            self.check_stalled().await?;
        }
        self.purge_expired().await?;
        Ok(())
    }

    /// Run the scheduler loop until `shutdown` flips to true.
    ///
    /// Each iteration sleeps until the nearest delayed deadline, the
    /// configured interval, or a deadline change signalled by a producer,
    /// whichever comes first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(queue = %self.queue, "Scheduler started");

        let deadline_waker = self.events.deadline_waker(&self.queue);
        let mut next_stall_check = Instant::now();

        while !*shutdown.borrow() {
            let notified = deadline_waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let check_stalled = self.config.stall_check && Instant::now() >= next_stall_check;
            if check_stalled {
                next_stall_check = Instant::now() + self.config.stalled_interval;
            }

            match self.tick(check_stalled).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(queue = %self.queue, error = %e, "Scheduler halted");
                    self.publish_error(&e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue, error = %e, "Scheduler tick failed");
                    self.publish_error(&e);
                }
            }

            let sleep_for = self.next_sleep().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut notified => {}
                _ = time::sleep(sleep_for) => {}
            }
        }

        tracing::info!(queue = %self.queue, "Scheduler stopped");
        Ok(())
    }

    /// Time until the next thing the loop has to do.
    async fn next_sleep(&self) -> Duration {
        let mut sleep_for = self.config.interval;
        match self.store.next_delayed_at(&self.queue).await {
            Ok(Some(run_at)) => {
                let until = u64::try_from(run_at.saturating_sub(now_ms())).unwrap_or(0);
                sleep_for = sleep_for.min(Duration::from_millis(until));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(queue = %self.queue, error = %e, "Failed to read next deadline");
            }
        }
        sleep_for
    }

    /// Deadline of the retry after `attempts_made` attempts, `None` for an immediate retry.
    pub(crate) fn retry_at(&self, job: &Job, attempts_made: u32, now: i64) -> Option<i64> {
        let delay = job.opts.retry_delay(attempts_made);
        if delay.is_zero() {
            None
        } else {
            Some(now.saturating_add(millis_i64(delay)))
        }
    }

    /// Wake whoever has to act on a job that went back to waiting or delayed.
    pub(crate) fn signal_requeued(&self, run_at: Option<i64>) {
        match run_at {
            Some(_) => self.events.deadline_changed(&self.queue),
            None => self.events.wake(&self.queue),
        }
    }

    pub(crate) fn publish_terminal_failure(
        &self,
        job_id: &JobId,
        error: &str,
        attempts_made: u32,
        exhausted: bool,
    ) {
        if exhausted {
            self.events.publish(
                &self.queue,
                QueueEvent::RetriesExhausted {
                    job_id: job_id.clone(),
                    attempts_made,
                },
            );
        }
        self.events.publish(
            &self.queue,
            QueueEvent::Failed {
                job_id: job_id.clone(),
                error: error.to_string(),
                attempts_made,
                will_retry: false,
            },
        );
    }

    pub(crate) fn publish_removed(&self, removed: &[JobId]) {
        for job_id in removed {
            self.events.publish(
                &self.queue,
                QueueEvent::Removed {
                    job_id: job_id.clone(),
                },
            );
        }
    }

    pub(crate) fn publish_error(&self, error: &FerryError) {
        self.events.publish(
            &self.queue,
            QueueEvent::Error {
                message: error.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::job::{Backoff, JobOptions, JobState, Retention};
    use crate::memory::MemoryStore;
    use crate::store::LeaseRequest;
    use serde_json::json;

    struct Fixture {
        store: SharedStore,
        scheduler: Scheduler,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let store = SharedStore::new(MemoryStore::new());
        let events = EventBus::new();
        let scheduler = Scheduler::new(
            "q",
            store.clone(),
            events.clone(),
            SchedulerConfig::default(),
        );
        Fixture {
            store,
            scheduler,
            events,
        }
    }

    async fn claimed(store: &SharedStore, opts: JobOptions, token: &str) -> Job {
        let seq = store.next_job_id("q").await.unwrap();
        let job = Job::new("q", JobId::from_sequence(seq), "work", json!({}), opts, now_ms());
        store.insert_job(&job).await.unwrap();
        let lease = LeaseRequest {
            token: token.to_string(),
            worker_id: "w".to_string(),
            duration: Duration::from_secs(30),
        };
        store.claim("q", &lease, now_ms()).await.unwrap().unwrap()
    }

    fn kinds(stream: &mut crate::events::EventStream) -> Vec<EventKind> {
        std::iter::from_fn(|| stream.try_recv()).map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn test_complete_emits_completed() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let job = claimed(&f.store, JobOptions::default(), "t").await;

        let released = f.scheduler.complete(&job, "t", json!(42)).await.unwrap();
        assert_eq!(released.job.state, JobState::Completed);
        assert_eq!(released.job.return_value, Some(json!(42)));
        assert_eq!(kinds(&mut stream), vec![EventKind::Completed]);
    }

    #[tokio::test]
    async fn test_complete_with_remove_emits_removed() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let job = claimed(
            &f.store,
            JobOptions::default().remove_on_complete(Retention::Remove),
            "t",
        )
        .await;

        f.scheduler.complete(&job, "t", json!(null)).await.unwrap();
        assert_eq!(
            kinds(&mut stream),
            vec![EventKind::Completed, EventKind::Removed]
        );
        assert!(f.store.get_job("q", &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_with_backoff_goes_to_delayed() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let opts = JobOptions::default()
            .attempts(3)
            .backoff(Backoff::exponential(Duration::from_millis(300_000)));
        let job = claimed(&f.store, opts, "t").await;

        let before = now_ms();
        let released = f
            .scheduler
            .fail(&job, "t", &JobError::retryable("boom"))
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Delayed);
        assert_eq!(released.job.attempts_made, 1);
        let run_at = released.job.run_at.unwrap();
        assert!(run_at >= before + 300_000);
        assert!(run_at <= now_ms() + 300_000);

        let events: Vec<_> = std::iter::from_fn(|| stream.try_recv()).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].event,
            QueueEvent::Failed {
                will_retry: true,
                attempts_made: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fail_without_backoff_requeues_at_head() {
        let f = fixture();
        let job = claimed(&f.store, JobOptions::default().attempts(2), "t").await;
        let other = Job::new("q", JobId::from("other"), "work", json!({}), JobOptions::default(), now_ms());
        f.store.insert_job(&other).await.unwrap();

        let released = f
            .scheduler
            .fail(&job, "t", &JobError::retryable("boom"))
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Waiting);

        let waiting = f.store.list_jobs("q", JobState::Waiting, 0, 10).await.unwrap();
        assert_eq!(waiting[0].id, job.id);
        assert_eq!(waiting[1].id, other.id);
    }

    #[tokio::test]
    async fn test_exhausted_emits_retries_exhausted_before_failed() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let job = claimed(&f.store, JobOptions::default().attempts(1), "t").await;

        let released = f
            .scheduler
            .fail(&job, "t", &JobError::retryable("boom"))
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Failed);
        assert_eq!(released.job.last_error.as_deref(), Some("boom"));
        assert_eq!(
            kinds(&mut stream),
            vec![EventKind::RetriesExhausted, EventKind::Failed]
        );
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let job = claimed(&f.store, JobOptions::default().attempts(5), "t").await;

        let released = f
            .scheduler
            .fail(&job, "t", &JobError::fatal("bad input"))
            .await
            .unwrap();
        assert_eq!(released.job.state, JobState::Failed);
        assert_eq!(released.job.attempts_made, 1);
        assert_eq!(kinds(&mut stream), vec![EventKind::Failed]);
    }

    #[tokio::test]
    async fn test_stale_token_cannot_report() {
        let f = fixture();
        let job = claimed(&f.store, JobOptions::default(), "t").await;
        let err = f.scheduler.complete(&job, "other", json!(1)).await.unwrap_err();
        assert!(matches!(err, FerryError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_promote_delayed_moves_due_jobs() {
        let f = fixture();
        let mut due = Job::new("q", JobId::from("due"), "work", json!({}), JobOptions::default(), 0);
        due.state = JobState::Delayed;
        due.run_at = Some(now_ms() - 10);
        f.store.insert_job(&due).await.unwrap();
        let later = Job::new(
            "q",
            JobId::from("later"),
            "work",
            json!({}),
            JobOptions::default().delay(Duration::from_secs(60)),
            now_ms(),
        );
        f.store.insert_job(&later).await.unwrap();

        assert_eq!(f.scheduler.promote_delayed().await.unwrap(), 1);
        let counts = f.store.counts("q").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_emits_removed() {
        let f = fixture();
        let mut stream = f.events.subscribe("q");
        let job = claimed(
            &f.store,
            JobOptions::default().remove_on_complete(Retention::age(Duration::from_millis(1))),
            "t",
        )
        .await;
        f.scheduler.complete(&job, "t", json!(null)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(f.scheduler.purge_expired().await.unwrap(), 1);
        assert_eq!(
            kinds(&mut stream),
            vec![EventKind::Completed, EventKind::Removed]
        );
    }

    #[tokio::test]
    async fn test_run_loop_promotes_at_deadline_and_stops() {
        let f = fixture();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(f.scheduler.clone().run(stop_rx));

        let job = Job::new(
            "q",
            JobId::from("soon"),
            "work",
            json!({}),
            JobOptions::default().delay(Duration::from_millis(50)),
            now_ms(),
        );
        f.store.insert_job(&job).await.unwrap();
        f.events.deadline_changed("q");

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job = f.store.get_job("q", &job.id).await.unwrap().unwrap();
                if job.state == JobState::Waiting {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_stops_when_sender_dropped() {
        let f = fixture();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(f.scheduler.clone().run(stop_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(stop_tx);
        let stopped = tokio::time::timeout(Duration::from_millis(500), task).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }
}
