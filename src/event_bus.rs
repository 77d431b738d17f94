//! Publish/subscribe fan-out plus a pull queue.
//!
//! `emit` runs every listener for the event's kind synchronously, in
//! subscription order, then appends the event to a bounded FIFO for
//! pull-style consumers. Listeners run on the session task: a listener that
//! blocks stalls message processing, so listeners must return quickly.
//!
//! A listener that returns `Err` or panics does not affect the others or the
//! caller of `emit`. The failure is logged, counted and published on the
//! failure channel (see [`EventBus::subscribe_failures`]).

use crate::event::{Event, EventKind, EventPayload};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{error, warn};

pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Report of a listener that failed while handling an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub kind: EventKind,
    pub reason: String,
}

const FAILURE_CHANNEL_CAPACITY: usize = 64;

pub struct EventBus {
    listeners: RwLock<AHashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    failures_tx: broadcast::Sender<ListenerFailure>,
    failure_count: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Creates a bus whose pull queue holds at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (failures_tx, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            failures_tx,
            failure_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers `listener` for events of `kind`.
    ///
    /// Subscribing the same closure twice is allowed; it then runs twice.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` (and does nothing) if it was not subscribed.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Receives a copy of every listener failure from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ListenerFailure> {
        self.failures_tx.subscribe()
    }

    pub fn listener_failures(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Builds an [`Event`] from `payload` and emits it.
    pub fn publish(&self, payload: EventPayload) {
        self.emit(Event::new(payload));
    }

    pub fn emit(&self, event: Event) {
        let kind = event.kind();

        // Snapshot so listeners may (un)subscribe from inside a callback.
        let snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .read()
            .get(&kind)
            .map(|list| list.to_vec())
            .unwrap_or_default();

        for (id, listener) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };
            self.report_failure(id, kind, reason);
        }

        self.enqueue(event);
    }

    fn report_failure(&self, listener: ListenerId, kind: EventKind, reason: String) {
        error!("Listener {:?} failed on {:?} event: {}", listener, kind, reason);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine
        let _ = self.failures_tx.send(ListenerFailure {
            listener,
            kind,
            reason,
        });
    }

    fn enqueue(&self, event: Event) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        "Event queue full ({} events), dropped {} oldest so far",
                        self.capacity, dropped
                    );
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Dequeues the next event without waiting.
    pub fn try_poll(&self) -> Option<Event> {
        self.queue.lock().pop_front()
    }

    /// Dequeues the next event, waiting up to `timeout` (forever if `None`).
    pub async fn poll(&self, timeout: Option<Duration>) -> Option<Event> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(event) = self.try_poll() {
                    return event;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drops every queued event, returning how many were discarded.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
