//! Lease renewal for in-flight jobs.
//!
//! While a handler runs, its lease is extended periodically so the stall
//! check does not reclaim the job. If renewal stops (process death, blocked
//! runtime) the lease runs out and the job is reclaimed as stalled.

use std::time::Duration;

use crate::error::Result;
use crate::job::{millis_i64, now_ms, JobId};
use crate::store::SharedStore;

/// Keeps the lease of one active job alive.
pub struct LeaseKeeper {
    store: SharedStore,
    queue: String,
    job_id: JobId,
    token: String,
    lease_duration: Duration,
    interval: Duration,
}

impl LeaseKeeper {
    /// Create a new lease keeper.
    pub fn new(
        store: SharedStore,
        queue: impl Into<String>,
        job_id: JobId,
        token: impl Into<String>,
        lease_duration: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue: queue.into(),
            job_id,
            token: token.into(),
            lease_duration,
            interval,
        }
    }

    /// Renew the lease every interval until the job is released or the lease is lost.
    ///
    /// Meant to be aborted by the owner once the handler finishes.
    pub async fn run(&self) {
        tracing::trace!(queue = %self.queue, job_id = %self.job_id, "Lease keeper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The claim itself set the first lease.
        interval.tick().await;

        loop {
            interval.tick().await;

            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        queue = %self.queue,
                        job_id = %self.job_id,
                        "Lease lost, stopping renewal"
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        queue = %self.queue,
                        job_id = %self.job_id,
                        error = %e,
                        "Failed to renew lease"
                    );
                    if e.is_fatal() {
                        break;
                    }
                }
            }
        }
    }

    /// Extend the lease once. Returns `false` if the token no longer owns the job.
    async fn renew(&self) -> Result<bool> {
        let until = now_ms().saturating_add(millis_i64(self.lease_duration));
        let renewed = self
            .store
            .extend_lease(&self.queue, &self.job_id, &self.token, until)
            .await?;

        if renewed {
            tracing::trace!(
                queue = %self.queue,
                job_id = %self.job_id,
                lock_until = until,
                "Lease renewed"
            );
        }
        Ok(renewed)
    }
}

/// Generate a unique worker ID from host, pid and a random suffix.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &suffix[..8])
}
