use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::events::EventKind;
use crate::job::AddOptions;
use crate::worker::JobError;

fn slow_queue(defaults: JobOptions) -> Queue {
    Queue::new(
        QueueConfig::new(QUEUE).default_job_options(defaults),
        SharedStore::new(SlowStore::new(Duration::from_millis(100))),
        EventBus::new(),
    )
}

fn kinds_by_job(events: Vec<Event>) -> HashMap<JobId, Vec<EventKind>> {
    let mut by_job: HashMap<JobId, Vec<EventKind>> = HashMap::new();
    for event in events {
        if let Some(id) = event.job_id() {
            by_job.entry(id.clone()).or_default().push(event.kind());
        }
    }
    by_job
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_follow_transitions_with_slow_store() {
    let queue = slow_queue(JobOptions::default());
    let mut stream = queue.events().subscribe(QUEUE);
    let pool = RunningPool::start(
        &queue,
        fast_config().concurrency(3).build(),
        |_ctx: JobContext| async { JobResult::Ok(json!("done")) },
    );

    let mut ids = Vec::new();
    for i in 0..3 {
        let handle = queue.add("work", &json!({ "i": i }), AddOptions::new()).await.unwrap();
        ids.push(handle.id().clone());
    }
    eventually("all jobs to complete", || async {
        queue.counts().await.unwrap().completed == 3
    })
    .await;
    pool.stop().await.unwrap();

    let by_job = kinds_by_job(drain(&mut stream));
    for id in &ids {
        assert_eq!(
            by_job.get(id),
            Some(&vec![EventKind::Added, EventKind::Active, EventKind::Completed]),
            "events of job {}",
            id
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_retry_reports_failure_before_next_attempt() {
    let queue = slow_queue(JobOptions::default().attempts(2));
    let mut stream = queue.events().subscribe(QUEUE);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let pool = RunningPool::start(&queue, fast_config().build(), move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(JobError::retryable("first attempt fails"))
            } else {
                Ok(json!("second attempt"))
            }
        }
    });
    let id = queue
        .add("work", &json!({}), AddOptions::new())
        .await
        .unwrap()
        .id()
        .clone();

    eventually("job to complete", || async {
        queue.counts().await.unwrap().completed == 1
    })
    .await;
    pool.stop().await.unwrap();

    let by_job = kinds_by_job(drain(&mut stream));
    assert_eq!(
        by_job.get(&id),
        Some(&vec![
            EventKind::Added,
            EventKind::Active,
            EventKind::Failed,
            EventKind::Active,
            EventKind::Completed,
        ])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
