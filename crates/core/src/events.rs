//! Lifecycle event bus.
//!
//! Events are published per queue and fanned out to every current
//! subscriber of that queue. Nothing is persisted or replayed: a subscriber
//! only sees events published after it subscribed. Publishing never blocks;
//! each subscriber owns an unbounded channel, and callback subscribers run in
//! their own task so a slow or failing callback cannot hold up anyone else.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::job::{now_ms, JobId};

/// Error type returned by event callbacks.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Discriminant of [`QueueEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Added,
    Active,
    Completed,
    Progress,
    Failed,
    Removed,
    Duplicated,
    RetriesExhausted,
    Stalled,
    Paused,
    Resumed,
    Cleaned,
    Drained,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::Added,
        EventKind::Active,
        EventKind::Completed,
        EventKind::Progress,
        EventKind::Failed,
        EventKind::Removed,
        EventKind::Duplicated,
        EventKind::RetriesExhausted,
        EventKind::Stalled,
        EventKind::Paused,
        EventKind::Resumed,
        EventKind::Cleaned,
        EventKind::Drained,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Active => "active",
            EventKind::Completed => "completed",
            EventKind::Progress => "progress",
            EventKind::Failed => "failed",
            EventKind::Removed => "removed",
            EventKind::Duplicated => "duplicated",
            EventKind::RetriesExhausted => "retries-exhausted",
            EventKind::Stalled => "stalled",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Cleaned => "cleaned",
            EventKind::Drained => "drained",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    Added {
        job_id: JobId,
        name: String,
        delayed: bool,
    },
    Active {
        job_id: JobId,
        attempt: u32,
    },
    Completed {
        job_id: JobId,
        return_value: serde_json::Value,
    },
    Progress {
        job_id: JobId,
        data: serde_json::Value,
    },
    Failed {
        job_id: JobId,
        error: String,
        attempts_made: u32,
        will_retry: bool,
    },
    Removed {
        job_id: JobId,
    },
    Duplicated {
        job_id: JobId,
    },
    RetriesExhausted {
        job_id: JobId,
        attempts_made: u32,
    },
    Stalled {
        job_id: JobId,
        stalled_count: u32,
    },
    Paused,
    Resumed,
    Cleaned {
        count: usize,
    },
    Drained,
    Error {
        message: String,
    },
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Added { .. } => EventKind::Added,
            QueueEvent::Active { .. } => EventKind::Active,
            QueueEvent::Completed { .. } => EventKind::Completed,
            QueueEvent::Progress { .. } => EventKind::Progress,
            QueueEvent::Failed { .. } => EventKind::Failed,
            QueueEvent::Removed { .. } => EventKind::Removed,
            QueueEvent::Duplicated { .. } => EventKind::Duplicated,
            QueueEvent::RetriesExhausted { .. } => EventKind::RetriesExhausted,
            QueueEvent::Stalled { .. } => EventKind::Stalled,
            QueueEvent::Paused => EventKind::Paused,
            QueueEvent::Resumed => EventKind::Resumed,
            QueueEvent::Cleaned { .. } => EventKind::Cleaned,
            QueueEvent::Drained => EventKind::Drained,
            QueueEvent::Error { .. } => EventKind::Error,
        }
    }

    /// The job the event is about, for job-level events.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Removed { job_id }
            | QueueEvent::Duplicated { job_id }
            | QueueEvent::RetriesExhausted { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub queue: String,
    /// Unix milliseconds at publication.
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: QueueEvent,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.event.job_id()
    }

    /// Handler result of a `completed` event or error of a `failed` event.
    pub fn outcome(&self) -> Option<std::result::Result<&serde_json::Value, &str>> {
        match &self.event {
            QueueEvent::Completed { return_value, .. } => Some(Ok(return_value)),
            QueueEvent::Failed { error, .. } => Some(Err(error.as_str())),
            _ => None,
        }
    }
}

/// Receiving end of a queue subscription.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Handle of a callback subscription. Dropping it leaves the callback running.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop invoking the callback.
    pub fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    deadlines: Mutex<HashMap<String, Arc<Notify>>>,
    sequencers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Publish/subscribe hub for lifecycle events, shared by queues and workers.
///
/// Also carries the per-queue wake-up signal that lets idle workers pick up
/// new or promoted jobs without waiting for their next poll.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to all current subscribers of `queue`.
    ///
    /// Returns the number of subscribers it was delivered to. Closed
    /// subscriptions are pruned.
    pub fn publish(&self, queue: &str, event: QueueEvent) -> usize {
        let event = Event {
            queue: queue.to_string(),
            timestamp: now_ms(),
            event,
        };

        // Held across the whole fan-out so every subscriber sees the same order.
        let mut subscribers = self.inner.subscribers.lock();
        let Some(senders) = subscribers.get_mut(queue) else {
            return 0;
        };
        senders.retain(|sender| sender.send(event.clone()).is_ok());
        senders.len()
    }

    /// Subscribe to every event of `queue`.
    pub fn subscribe(&self, queue: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        EventStream { rx }
    }

    /// Invoke `callback` for every `kind` event of `queue`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on<F>(&self, queue: &str, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.spawn_callback(queue, Some(kind), callback)
    }

    /// Invoke `callback` for every event of `queue`.
    pub fn on_any<F>(&self, queue: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.spawn_callback(queue, None, callback)
    }

    fn spawn_callback<F>(&self, queue: &str, kind: Option<EventKind>, callback: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let mut stream = self.subscribe(queue);
        let task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if kind.is_some_and(|kind| kind != event.kind()) {
                    continue;
                }
                match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            queue = %event.queue,
                            event = %event.kind(),
                            error = %e,
                            "Event subscriber failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            queue = %event.queue,
                            event = %event.kind(),
                            "Event subscriber panicked"
                        );
                    }
                }
            }
        });
        Subscription { task }
    }

    /// Number of live subscriptions on `queue`.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(queue)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Wake-up signal of `queue`.
    pub(crate) fn waker(&self, queue: &str) -> Arc<Notify> {
        self.inner
            .wakers
            .lock()
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    /// Wake workers idling on `queue`.
    pub(crate) fn wake(&self, queue: &str) {
        self.waker(queue).notify_waiters();
    }

    /// Signal raised when a new delayed deadline may precede the scheduler's next tick.
    pub(crate) fn deadline_waker(&self, queue: &str) -> Arc<Notify> {
        self.inner
            .deadlines
            .lock()
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn deadline_changed(&self, queue: &str) {
        self.deadline_waker(queue).notify_waiters();
    }

    /// Serializes a store transition of `queue` with the publication of its
    /// events.
    ///
    /// Hold the guard from before the store call until the last event of the
    /// transition is published. Subscribers then see events in the order the
    /// store applied the transitions, whatever the store's latency.
    pub(crate) async fn ordered(&self, queue: &str) -> OwnedMutexGuard<()> {
        let sequencer = self
            .inner
            .sequencers
            .lock()
            .entry(queue.to_string())
            .or_default()
            .clone();
        sequencer.lock_owned().await
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
