//! Job batch demo backed by SQLite.
//!
//! This demo:
//! - Opens (or creates) a SQLite database given by `FERRY_DATABASE_URL`
//! - Logs every lifecycle event of the `JobBatchHandling` queue
//! - Enqueues one batch job under a fixed id, so restarts don't duplicate it
//! - Processes it with three handlers, claiming at most one job per 300ms
//!
//! Run with: `cargo run -p demo-jobbatch`

use serde_json::json;
use std::time::Duration;

use ferry_core::{
    AddOptions, Backoff, EventBus, JobContext, JobOptions, JobResult, Queue, QueueConfig,
    RateLimit, Retention, WorkerConfig, WorkerPool,
};
use ferry_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

const QUEUE: &str = "JobBatchHandling";
const DEFAULT_DATABASE_URL: &str = "sqlite:ferry-jobbatch.db";

async fn handle_batch(ctx: JobContext) -> JobResult {
    tracing::info!(job_id = %ctx.id(), name = %ctx.name(), attempt = ctx.attempt(), "Processing batch");

    ctx.update_progress(json!({ "stage": "fetching" })).await?;
    tokio::time::sleep(Duration::from_secs(10)).await;

    Ok(json!({ "updated": true }))
}

#[tokio::main]
async fn main() -> ferry_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("FERRY_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let store = SqliteStore::new(&database_url, "ferry").await?;
    let events = EventBus::new();

    let five_minutes = Duration::from_secs(300);
    let queue = Queue::with_store(
        QueueConfig::new(QUEUE).default_job_options(
            JobOptions::default()
                .attempts(10)
                .backoff(Backoff::exponential(five_minutes))
                .remove_on_complete(Retention::age(five_minutes))
                .remove_on_fail(Retention::age(five_minutes)),
        ),
        store.clone(),
        events.clone(),
    );

    let _log = events.on_any(QUEUE, |event| {
        match event.outcome() {
            Some(Ok(value)) => {
                tracing::info!(event = %event.kind(), job_id = ?event.job_id(), result = %value, "Queue event")
            }
            Some(Err(error)) => {
                tracing::warn!(event = %event.kind(), job_id = ?event.job_id(), error = %error, "Queue event")
            }
            None => tracing::info!(event = %event.kind(), job_id = ?event.job_id(), "Queue event"),
        }
        Ok(())
    });

    let handle = queue
        .add(
            "fetch-upd-jobbatch",
            &json!({ "batch": 12 }),
            AddOptions::new().job_id("_12"),
        )
        .await?;
    if handle.is_duplicate() {
        tracing::info!(job_id = %handle.id(), "Batch already queued");
    }

    let snapshot = queue.snapshot().await?;
    tracing::info!(
        queue = %snapshot.name,
        paused = snapshot.paused,
        waiting = snapshot.counts.waiting,
        delayed = snapshot.counts.delayed,
        active = snapshot.counts.active,
        completed = snapshot.counts.completed,
        failed = snapshot.counts.failed,
        "Queue ready"
    );

    let pool = WorkerPool::builder()
        .config(
            WorkerConfig::builder()
                .queue(QUEUE)
                .concurrency(3)
                .limiter(RateLimit::new(1, Duration::from_millis(300)))
                .skip_stalled_check(true)
                .build(),
        )
        .store(store)
        .events(events)
        .handler(handle_batch)
        .build()?;

    tracing::info!(worker_id = %pool.worker_id(), "Worker ready, press Ctrl+C to stop");
    let result = pool
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!(queue = QUEUE, "Worker closing");
        })
        .await;
    tracing::info!(queue = QUEUE, in_progress = pool.in_progress_count(), "Worker closed");
    result
}
