//! In-process topic-based event bus.
//!
//! Fan-out is best-effort with at-least-once semantics inside the process
//! group: each subscriber gets its own bounded buffer, publication never
//! blocks the publisher, and a full buffer drops the event for that
//! subscriber with a logged counter. Per-topic publication order is
//! preserved to each subscriber; nothing is guaranteed across topics.
//!
//! Durability is not the bus's job: components append the durable subset of
//! the taxonomy to the store's event table inside their own transactions
//! (see [`crate::events::is_durable`]) and publish here after commit.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::BusEvent;

/// Default per-subscriber buffer size.
pub const DEFAULT_BUFFER: usize = 1024;

/// A glob-like topic pattern: exact (`task.completed`), prefix
/// (`task.*`, `guardian.intervention.*`), or match-all (`*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    All,
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self::Prefix(format!("{prefix}."))
        } else {
            Self::Exact(pattern.to_owned())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => topic == exact,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

struct SubscriberEntry {
    id: u64,
    pattern: TopicPattern,
    tx: mpsc::Sender<BusEvent>,
}

struct BusInner {
    buffer: usize,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// The process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                buffer,
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber for all topics matching `pattern`.
    ///
    /// The returned [`Subscription`] is the cancellation handle: dropping it
    /// unregisters the subscriber.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = SubscriberEntry {
            id,
            pattern: TopicPattern::parse(pattern),
            tx,
        };
        self.inner
            .subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .push(entry);
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Non-blocking: a subscriber whose buffer is full loses this event and
    /// the drop counter is bumped. Subscribers that have gone away are
    /// pruned.
    pub fn publish(&self, event: &BusEvent) {
        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .expect("bus subscriber lock poisoned");
            for entry in subscribers.iter() {
                if !entry.pattern.matches(&event.event_type) {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            event_type = %event.event_type,
                            subscriber = entry.id,
                            dropped_total = dropped,
                            "subscriber buffer full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(entry.id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .expect("bus subscriber lock poisoned");
            subscribers.retain(|entry| !closed.contains(&entry.id));
        }
    }

    /// Total events dropped across all subscribers since construction.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("bus subscriber lock poisoned")
            .len()
    }
}

/// A live subscription; also the cancellation handle.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
    inner: Arc<BusInner>,
}

impl Subscription {
    /// Receive the next matching event, or `None` once cancelled.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Consume the subscription as a [`Stream`] of events.
    pub fn into_stream(self) -> SubscriptionStream {
        SubscriptionStream { sub: self }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.inner.subscribers.write() {
            subscribers.retain(|entry| entry.id != self.id);
        }
    }
}

/// Stream adapter over a [`Subscription`].
pub struct SubscriptionStream {
    sub: Subscription,
}

impl Stream for SubscriptionStream {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.sub.rx.poll_recv(cx)
    }
}
