//! Stalled job recovery.
//!
//! A job stalls when its worker stops renewing the lease: the process died,
//! the event loop was blocked, or the worker shut down before the handler
//! finished. The reaper finds active jobs with an expired lease and hands
//! them back according to the configured [`StallPolicy`].

use crate::config::StallPolicy;
use crate::error::Result;
use crate::events::QueueEvent;
use crate::job::{now_ms, Job, JobState};
use crate::scheduler::Scheduler;
use crate::store::Transition;

const STALLED_ERROR: &str = "job stalled";
const STALLED_LIMIT_ERROR: &str = "job stalled more than allowable limit";

impl Scheduler {
    /// Reclaim active jobs whose lease expired. Returns how many were reclaimed.
    pub async fn check_stalled(&self) -> Result<usize> {
        let now = now_ms();
        let stalled = self
            .store
            .stalled_jobs(&self.queue, now, self.config.batch_size)
            .await?;

        let mut reclaimed = 0;
        for job in stalled {
            let Some(token) = job.lock_token.clone() else {
                tracing::warn!(queue = %self.queue, job_id = %job.id, "Active job without lease token");
                continue;
            };

            let transition = self.stall_transition(&job, now);
            let _order = self.events.ordered(&self.queue).await;
            let Some(released) = self
                .store
                .reclaim_stalled(&self.queue, &job.id, &token, transition.clone(), now)
                .await?
            else {
                // Renewed or finished since it was listed.
                continue;
            };
            reclaimed += 1;

            tracing::warn!(
                queue = %self.queue,
                job_id = %job.id,
                stalled_count = released.job.stalled_count,
                worker_id = ?job.locked_by,
                "Job stalled"
            );
            self.events.publish(
                &self.queue,
                QueueEvent::Stalled {
                    job_id: job.id.clone(),
                    stalled_count: released.job.stalled_count,
                },
            );

            match transition {
                Transition::Retry {
                    error,
                    attempts_made,
                    run_at,
                } => {
                    if attempts_made > job.attempts_made {
                        self.events.publish(
                            &self.queue,
                            QueueEvent::Failed {
                                job_id: job.id.clone(),
                                error,
                                attempts_made,
                                will_retry: true,
                            },
                        );
                    }
                    self.signal_requeued(run_at);
                }
                Transition::Fail {
                    error,
                    attempts_made,
                } => {
                    let exhausted = !job.opts.attempts.allows_another(attempts_made);
                    self.publish_terminal_failure(&job.id, &error, attempts_made, exhausted);
                    self.publish_removed(&released.removed);
                }
                Transition::Complete { .. } => {}
            }
        }

        Ok(reclaimed)
    }

    /// What to do with a job whose lease expired.
    fn stall_transition(&self, job: &Job, now: i64) -> Transition {
        debug_assert_eq!(job.state, JobState::Active);
        let stalled_count = job.stalled_count.saturating_add(1);
        let attempts_made = match self.config.stall_policy {
            StallPolicy::Requeue => job.attempts_made,
            StallPolicy::ConsumeAttempt => job.attempts_made.saturating_add(1),
        };

        if self
            .config
            .max_stalled_count
            .is_some_and(|max| stalled_count > max)
        {
            return Transition::Fail {
                error: STALLED_LIMIT_ERROR.to_string(),
                attempts_made,
            };
        }

        match self.config.stall_policy {
            StallPolicy::Requeue => Transition::Retry {
                error: STALLED_ERROR.to_string(),
                attempts_made,
                run_at: None,
            },
            StallPolicy::ConsumeAttempt if job.opts.attempts.allows_another(attempts_made) => {
                Transition::Retry {
                    error: STALLED_ERROR.to_string(),
                    attempts_made,
                    run_at: self.retry_at(job, attempts_made, now),
                }
            }
            StallPolicy::ConsumeAttempt => Transition::Fail {
                error: STALLED_ERROR.to_string(),
                attempts_made,
            },
        }
    }
}
