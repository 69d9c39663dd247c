//! Configuration types for the job queue library.

use std::time::Duration;

use crate::error::{FerryError, Result};
use crate::job::JobOptions;
use crate::rate_limit::RateLimit;

/// What happens to a job whose lease expired without a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// Put the job back at the head of waiting without consuming an attempt.
    /// A stall is blamed on the infrastructure, not on the handler.
    #[default]
    Requeue,
    /// Count the stall as a failed attempt. The job fails for good once its
    /// attempts are exhausted.
    ConsumeAttempt,
}

/// Configuration for a Queue (producer).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name.
    pub name: String,
    /// Options applied to every job unless overridden at `add`.
    pub default_job_options: JobOptions,
}

impl QueueConfig {
    /// Create a new QueueConfig.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_job_options: JobOptions::default(),
        }
    }

    /// Set the default job options.
    pub fn default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = options;
        self
    }
}

/// Configuration for the Scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on the sleep between ticks; delayed jobs are promoted at
    /// most this long after their deadline.
    pub interval: Duration,
    /// How often active jobs are checked for expired leases.
    pub stalled_interval: Duration,
    /// Whether the stall check runs at all.
    pub stall_check: bool,
    /// Treatment of stalled jobs.
    pub stall_policy: StallPolicy,
    /// Fail a job that stalled more than this many times.
    pub max_stalled_count: Option<u32>,
    /// Maximum jobs moved per tick and per step.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stalled_interval: Duration::from_secs(30),
            stall_check: true,
            stall_policy: StallPolicy::Requeue,
            max_stalled_count: None,
            batch_size: 100,
        }
    }
}

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue the pool processes.
    pub queue: String,
    /// Maximum number of handlers running at once.
    pub concurrency: usize,
    /// Optional claim rate limit, independent of concurrency.
    pub limiter: Option<RateLimit>,
    /// Lease taken on each claimed job.
    pub lease_duration: Duration,
    /// Lease renewal period; defaults to half the lease.
    pub renew_interval: Option<Duration>,
    /// How long an idle pool waits before polling again when not woken.
    pub poll_interval: Duration,
    /// Pause after a store error before claiming again.
    pub error_backoff: Duration,
    /// Grace period for in-flight handlers on shutdown.
    pub shutdown_timeout: Duration,
    /// Whether this pool also runs the queue's scheduler loop.
    pub run_scheduler: bool,
    /// Scheduler settings used when `run_scheduler` is set.
    pub scheduler: SchedulerConfig,
    /// Explicit worker id; generated from host and pid otherwise.
    pub worker_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            concurrency: 1,
            limiter: None,
            lease_duration: Duration::from_secs(30),
            renew_interval: None,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            run_scheduler: true,
            scheduler: SchedulerConfig::default(),
            worker_id: None,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Effective lease renewal period.
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval.unwrap_or(self.lease_duration / 2)
    }

    /// Reject settings the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(FerryError::Config("queue name is required".to_string()));
        }
        if self.concurrency == 0 {
            return Err(FerryError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(FerryError::Config(
                "lease duration must be greater than zero".to_string(),
            ));
        }
        let renew = self.renew_interval();
        if renew.is_zero() || renew >= self.lease_duration {
            return Err(FerryError::Config(
                "renew interval must be positive and shorter than the lease".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.error_backoff.is_zero() {
            return Err(FerryError::Config(
                "poll interval and error backoff must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.interval.is_zero() {
            return Err(FerryError::Config(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.stall_check && self.scheduler.stalled_interval.is_zero() {
            return Err(FerryError::Config(
                "stalled interval must be greater than zero".to_string(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(FerryError::Config(
                "batch size must be at least 1".to_string(),
            ));
        }
        if let Some(limiter) = &self.limiter {
            limiter.validate()?;
        }
        Ok(())
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue name.
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

    /// Set the lease duration.
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.config.lease_duration = duration;
        self
    }

    /// Set the lease renewal period.
    pub fn renew_interval(mut self, interval: Duration) -> Self {
        self.config.renew_interval = Some(interval);
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the pause after store errors.
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Whether this pool runs the scheduler loop.
    pub fn run_scheduler(mut self, run: bool) -> Self {
        self.config.run_scheduler = run;
        self
    }

    /// Set the scheduler interval.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.interval = interval;
        self
    }

    /// Set the stall check interval.
    pub fn stalled_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.stalled_interval = interval;
        self
    }

    /// Disable the stall check.
    pub fn skip_stalled_check(mut self, skip: bool) -> Self {
        self.config.scheduler.stall_check = !skip;
        self
    }

    /// Set the stall policy.
    pub fn stall_policy(mut self, policy: StallPolicy) -> Self {
        self.config.scheduler.stall_policy = policy;
        self
    }

    /// Fail jobs that stall more than `max` times.
    pub fn max_stalled_count(mut self, max: u32) -> Self {
        self.config.scheduler.max_stalled_count = Some(max);
        self
    }

    /// Set the batch size for scheduler steps.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.scheduler.batch_size = size;
        self
    }

    /// Use an explicit worker id.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = Some(id.into());
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}
