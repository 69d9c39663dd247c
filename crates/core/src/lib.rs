//! # ferry-core - Core types and traits for the ferry job queue
//!
//! This crate provides the core abstractions of a durable job queue with
//! at-least-once delivery:
//! - `Store` trait for storage implementations, and an in-process `MemoryStore`
//! - `Job`, `JobId`, `JobOptions`, `JobState` types
//! - `Queue` for enqueueing and administering jobs
//! - `Scheduler` for retries, delayed promotion, stall recovery and retention
//! - `WorkerPool` for processing jobs with bounded concurrency and rate limits
//! - `EventBus` for lifecycle events
//! - Error types

mod config;
mod error;
mod events;
mod heartbeat;
mod job;
mod memory;
mod pool;
mod queue;
mod rate_limit;
mod reaper;
mod scheduler;
mod store;
mod worker;

#[cfg(test)]
mod tests;

// Re-export main types
pub use config::{QueueConfig, SchedulerConfig, StallPolicy, WorkerConfig, WorkerConfigBuilder};
pub use error::{FerryError, Result};
pub use events::{Event, EventBus, EventKind, EventStream, QueueEvent, SubscriberError, Subscription};
pub use heartbeat::{generate_worker_id, LeaseKeeper};
pub use job::{AddOptions, Attempts, Backoff, BackoffKind, Job, JobId, JobOptions, JobState, Retention};
pub use memory::MemoryStore;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use queue::{JobHandle, Page, Queue, QueueSnapshot};
pub use rate_limit::RateLimit;
pub use scheduler::Scheduler;
pub use store::{
    DynStore, InsertOutcome, JobCounts, LeaseRequest, Released, SharedStore, Store, Transition,
};
pub use worker::{JobContext, JobError, JobResult};
