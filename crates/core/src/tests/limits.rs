use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::job::{AddOptions, JobId, JobState};
use crate::rate_limit::RateLimit;
use crate::store::LeaseRequest;

#[tokio::test]
async fn test_concurrency_limit_holds_under_burst() {
    let queue = queue_with(JobOptions::default());
    for i in 0..100 {
        queue
            .add("burst", &json!({ "i": i }), AddOptions::new())
            .await
            .unwrap();
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, max) = (running.clone(), peak.clone());
    let pool = RunningPool::start(
        &queue,
        fast_config().concurrency(3).build(),
        move |_ctx: JobContext| {
            let (now, max) = (now.clone(), max.clone());
            async move {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                now.fetch_sub(1, Ordering::SeqCst);
                JobResult::Ok(json!(null))
            }
        },
    );

    eventually("all jobs to complete", || async {
        queue.counts().await.unwrap().completed == 100
    })
    .await;
    pool.stop().await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "{} handlers ran at once", peak);
    assert!(peak >= 2, "jobs never overlapped");
}

#[tokio::test]
async fn test_rate_limit_spaces_claims() {
    let queue = queue_with(JobOptions::default());
    for _ in 0..4 {
        queue.add("limited", &json!({}), AddOptions::new()).await.unwrap();
    }

    let pool = RunningPool::start(
        &queue,
        fast_config()
            .concurrency(3)
            .limiter(RateLimit::new(1, Duration::from_millis(300)))
            .build(),
        |_ctx: JobContext| async { JobResult::Ok(json!(null)) },
    );
    eventually("all jobs to complete", || async {
        queue.counts().await.unwrap().completed == 4
    })
    .await;
    pool.stop().await.unwrap();

    let mut claimed_at: Vec<i64> = queue
        .list_jobs(JobState::Completed, crate::queue::Page::default())
        .await
        .unwrap()
        .iter()
        .filter_map(|job| job.processed_at)
        .collect();
    claimed_at.sort_unstable();
    assert_eq!(claimed_at.len(), 4);
    for pair in claimed_at.windows(2) {
        assert!(
            pair[1] - pair[0] >= 300,
            "claims {}ms apart",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test]
async fn test_racing_claims_hand_out_one_job() {
    let queue = queue_with(JobOptions::default());
    queue.add("only", &json!({}), AddOptions::new()).await.unwrap();

    let lease = |token: &str| LeaseRequest {
        token: token.to_string(),
        worker_id: token.to_string(),
        duration: Duration::from_secs(30),
    };
    let (a, b) = (lease("a"), lease("b"));
    let store = queue.store().clone();
    let (first, second) = tokio::join!(
        store.claim(QUEUE, &a, crate::job::now_ms()),
        store.claim(QUEUE, &b, crate::job::now_ms()),
    );

    let claimed: Vec<_> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, JobId::from_sequence(1));
}

#[tokio::test]
async fn test_two_pools_process_each_job_once() {
    let queue = queue_with(JobOptions::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let start = |worker_id: &str| {
        let runs = runs.clone();
        RunningPool::start(
            &queue,
            fast_config().worker_id(worker_id).concurrency(2).build(),
            move |_ctx: JobContext| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    JobResult::Ok(json!(null))
                }
            },
        )
    };
    let (left, right) = (start("left"), start("right"));

    for _ in 0..20 {
        queue.add("shared", &json!({}), AddOptions::new()).await.unwrap();
    }
    eventually("all jobs to complete", || async {
        queue.counts().await.unwrap().completed == 20
    })
    .await;
    left.stop().await.unwrap();
    right.stop().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 20);
}
