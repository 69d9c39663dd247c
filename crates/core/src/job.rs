//! Job definition and related types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FerryError, Result};

/// Identifier of a job, unique within its queue.
///
/// Either supplied by the producer or generated from the queue's sequence,
/// in which case it is the decimal sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Build the id for the given sequence number.
    pub fn from_sequence(seq: u64) -> Self {
        Self(seq.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id has the shape of a generated id.
    pub fn is_sequence_shaped(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The state list a job currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its `run_at` deadline (initial delay or retry backoff).
    Delayed,
    /// Claimed by a worker under a lease.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with a failure and no retries left.
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| FerryError::Store(format!("unknown job state: {}", s)))
    }
}

/// How many times a job may be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attempts {
    /// At most this many attempts (must be at least 1).
    Limited(u32),
    /// Retry forever.
    Unlimited,
}

impl Attempts {
    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        match self {
            Attempts::Limited(max) => attempts_made < *max,
            Attempts::Unlimited => true,
        }
    }
}

impl Default for Attempts {
    fn default() -> Self {
        Attempts::Limited(1)
    }
}

/// Shape of the delay curve between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay policy applied before retrying a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: base,
        }
    }

    /// Delay before the retry that follows attempt number `attempts_made` (1-based).
    ///
    /// Exponential backoff is `base * 2^(attempts_made - 1)` and saturates
    /// instead of overflowing.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(0);
                let base_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
                let delay_ms = if factor == 0 && base_ms > 0 {
                    u64::MAX
                } else {
                    base_ms.saturating_mul(factor)
                };
                Duration::from_millis(delay_ms)
            }
        }
    }
}

/// Rule governing when finished jobs are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Keep finished jobs until they are cleaned explicitly.
    #[default]
    KeepAll,
    /// Delete the job as soon as it finishes.
    Remove,
    /// Keep jobs younger than `age` and at most the newest `count` jobs.
    Keep {
        #[serde(default, with = "duration_ms::option")]
        age: Option<Duration>,
        #[serde(default)]
        count: Option<usize>,
    },
}

impl Retention {
    /// Keep finished jobs for `age` after they finish.
    pub fn age(age: Duration) -> Self {
        Retention::Keep {
            age: Some(age),
            count: None,
        }
    }

    /// Keep only the newest `count` finished jobs.
    pub fn count(count: usize) -> Self {
        Retention::Keep {
            age: None,
            count: Some(count),
        }
    }

    /// Timestamp after which a job finished at `finished_at` may be purged.
    pub fn expires_at(&self, finished_at: i64) -> Option<i64> {
        match self {
            Retention::Keep { age: Some(age), .. } => {
                Some(finished_at.saturating_add(millis_i64(*age)))
            }
            _ => None,
        }
    }

    /// Maximum number of finished jobs kept in the state list, if bounded.
    pub fn keep_last(&self) -> Option<usize> {
        match self {
            Retention::Keep { count, .. } => *count,
            _ => None,
        }
    }
}

/// Fully resolved options of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: Attempts,
    pub backoff: Option<Backoff>,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    /// Hard per-attempt timeout after which the attempt is failed.
    #[serde(default, with = "duration_ms::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub remove_on_complete: Retention,
    #[serde(default)]
    pub remove_on_fail: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: Attempts::default(),
            backoff: None,
            delay: Duration::ZERO,
            timeout: None,
            remove_on_complete: Retention::KeepAll,
            remove_on_fail: Retention::KeepAll,
        }
    }
}

impl JobOptions {
    /// Allow at most `attempts` attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Attempts::Limited(attempts);
        self
    }

    /// Retry forever.
    pub fn unlimited_attempts(mut self) -> Self {
        self.attempts = Attempts::Unlimited;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = retention;
        self
    }

    pub fn remove_on_fail(mut self, retention: Retention) -> Self {
        self.remove_on_fail = retention;
        self
    }

    /// Retention that applies once the job reaches the given terminal state.
    pub fn retention_for(&self, state: JobState) -> Retention {
        match state {
            JobState::Completed => self.remove_on_complete,
            JobState::Failed => self.remove_on_fail,
            _ => Retention::KeepAll,
        }
    }

    /// Delay before the next retry after `attempts_made` attempts.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|backoff| backoff.delay_for(attempts_made))
            .unwrap_or(Duration::ZERO)
    }

    /// Reject option combinations that can never be executed.
    pub fn validate(&self) -> Result<()> {
        if self.attempts == Attempts::Limited(0) {
            return Err(FerryError::Validation(
                "attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(FerryError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.delay.as_millis() > i64::MAX as u128 {
            return Err(FerryError::Validation("delay is too large".to_string()));
        }
        if let Retention::Keep {
            age: None,
            count: None,
        } = self.remove_on_complete
        {
            return Err(FerryError::Validation(
                "remove_on_complete keep policy needs an age or a count".to_string(),
            ));
        }
        if let Retention::Keep {
            age: None,
            count: None,
        } = self.remove_on_fail
        {
            return Err(FerryError::Validation(
                "remove_on_fail keep policy needs an age or a count".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call options for [`Queue::add`](crate::Queue::add).
///
/// Unset fields fall back to the queue's default job options.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub job_id: Option<String>,
    pub attempts: Option<Attempts>,
    pub backoff: Option<Backoff>,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-supplied id; enqueueing is idempotent on it.
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(Attempts::Limited(attempts));
        self
    }

    pub fn unlimited_attempts(mut self) -> Self {
        self.attempts = Some(Attempts::Unlimited);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn remove_on_complete(mut self, retention: Retention) -> Self {
        self.remove_on_complete = Some(retention);
        self
    }

    pub fn remove_on_fail(mut self, retention: Retention) -> Self {
        self.remove_on_fail = Some(retention);
        self
    }

    /// Merge over the queue defaults.
    pub fn resolve(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: self.attempts.unwrap_or(defaults.attempts),
            backoff: self.backoff.or(defaults.backoff),
            delay: self.delay.unwrap_or(defaults.delay),
            timeout: self.timeout.or(defaults.timeout),
            remove_on_complete: self
                .remove_on_complete
                .unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
        }
    }
}

/// A job record with its payload, state and retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Handler selector.
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub state: JobState,
    /// Attempts that ended with a reported failure (or a stall, when stalls consume attempts).
    pub attempts_made: u32,
    /// Times the job was claimed.
    pub attempts_started: u32,
    pub stalled_count: u32,
    pub progress: serde_json::Value,
    pub return_value: Option<serde_json::Value>,
    pub last_error: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Deadline of a delayed job.
    pub run_at: Option<i64>,
    /// When retention allows purging a finished job.
    pub expires_at: Option<i64>,
    pub lock_token: Option<String>,
    pub locked_by: Option<String>,
    pub lock_until: Option<i64>,
}

impl Job {
    /// Create a job in `waiting`, or in `delayed` when the options carry a delay.
    pub fn new(
        queue: impl Into<String>,
        id: JobId,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
        now: i64,
    ) -> Self {
        let (state, run_at) = if opts.delay.is_zero() {
            (JobState::Waiting, None)
        } else {
            (
                JobState::Delayed,
                Some(now.saturating_add(millis_i64(opts.delay))),
            )
        };

        Self {
            id,
            queue: queue.into(),
            name: name.into(),
            data,
            opts,
            state,
            attempts_made: 0,
            attempts_started: 0,
            stalled_count: 0,
            progress: serde_json::Value::Null,
            return_value: None,
            last_error: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            run_at,
            expires_at: None,
            lock_token: None,
            locked_by: None,
            lock_until: None,
        }
    }

    /// Deserialize the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Whether `token` currently owns the job's lease.
    pub fn is_locked_by(&self, token: &str) -> bool {
        self.state == JobState::Active && self.lock_token.as_deref() == Some(token)
    }

    /// Whether the job is active and its lease ran out before `now`.
    pub fn lease_expired(&self, now: i64) -> bool {
        self.state == JobState::Active && self.lock_until.map_or(true, |until| until < now)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Current Unix timestamp in milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(millis_i64)
        .unwrap_or(0)
}

/// Milliseconds of `duration`, saturating at `i64::MAX`.
pub(crate) fn millis_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Serde helpers storing durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis: Option<u64> = Option::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}
