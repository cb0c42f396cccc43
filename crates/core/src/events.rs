//! Event fan-out from the host to connected sessions
//!
//! Every subscriber owns a bounded queue. When a queue is full, low-priority
//! events make room by evicting the oldest low-priority entry (or are dropped
//! themselves if the queue holds nothing but high-priority events).
//! High-priority events are never dropped; the queue grows past its bound to
//! hold them.

use crate::logging::LogLevel;
use crate::protocol::{Event, EventKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// Default per-subscriber queue bound
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    High,
}

impl Event {
    /// Warnings, errors and anything about operation lifecycle are high priority
    pub fn priority(&self) -> EventPriority {
        match &self.kind {
            EventKind::Log(log) if log.level >= LogLevel::Warn => EventPriority::High,
            EventKind::Log(_) => EventPriority::Low,
            EventKind::Operation(_) => EventPriority::High,
        }
    }
}

struct SubscriberQueue {
    id: u64,
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: Event, capacity: usize) {
        let mut events = self.events.lock();
        if events.len() >= capacity && event.priority() == EventPriority::Low {
            // Either the oldest low-priority entry or the incoming event is lost
            if let Some(oldest_low) = events
                .iter()
                .position(|queued| queued.priority() == EventPriority::Low)
            {
                events.remove(oldest_low);
                events.push_back(event);
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            events.push_back(event);
        }
        drop(events);
        self.notify.notify_one();
    }
}

struct BroadcasterInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

/// Cloneable handle to the broadcast channel
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Deliver `event` to every current subscriber. A no-op without subscribers.
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let subscribers = self.inner.subscribers.lock().clone();
        match subscribers.split_last() {
            None => trace!("No subscribers, event discarded"),
            Some((last, rest)) => {
                for subscriber in rest {
                    subscriber.push(event.clone(), self.inner.capacity);
                }
                last.push(event, self.inner.capacity);
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.inner.closed.load(Ordering::Acquire)),
        });
        self.inner.subscribers.lock().push(queue.clone());

        EventSubscription {
            queue,
            broadcaster: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Stop accepting events and end every subscription once drained
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for subscriber in self.inner.subscribers.lock().drain(..) {
            subscriber.closed.store(true, Ordering::Release);
            subscriber.notify.notify_one();
        }
    }
}

/// One subscriber's view of the event stream. Unsubscribes on drop.
pub struct EventSubscription {
    queue: Arc<SubscriberQueue>,
    broadcaster: std::sync::Weak<BroadcasterInner>,
}

impl EventSubscription {
    /// Next event, or `None` once the broadcaster is closed and the queue drained
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.events.lock().pop_front()
    }

    /// Low-priority events lost to backpressure so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broadcaster.upgrade() {
            let id = self.queue.id;
            inner.subscribers.lock().retain(|queue| queue.id != id);
        }
    }
}
