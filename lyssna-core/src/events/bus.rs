//! Channel-keyed publish/subscribe bus.
//!
//! Producers publish [`Event`]s keyed by their event-type string; a single
//! dispatcher thread drains the queue and invokes every listener registered
//! on that channel, then every listener on the `*` wildcard. The wildcard is
//! additive: a listener subscribed to both a channel and `*` receives a
//! matching event twice.
//!
//! The queue lock and the listener-table lock are never held together. The
//! dispatcher snapshots the relevant listeners under the table lock and
//! invokes callbacks with no bus lock held, so callbacks may publish,
//! register, and remove listeners (including themselves) freely.
//!
//! Delivery guarantees: events from one producer arrive in publish order;
//! listeners on one channel are invoked in registration order. A listener
//! panic is caught and logged at the dispatch boundary and does not stop
//! the dispatcher.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{error, warn};

use super::Event;

/// Wildcard channel receiving every user-published event.
pub const WILDCARD_CHANNEL: &str = "*";

const DEFAULT_QUEUE_WATERMARK: usize = 4096;

#[derive(Clone, Debug, Error)]
pub enum BusError {
    #[error("event bus is shutting down")]
    ShuttingDown,
}

/// Listener callback. Invoked serially by the dispatcher thread.
pub type ListenerCallback = Box<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: u64,
    channels: Vec<String>,
    callback: ListenerCallback,
}

struct EventQueue {
    events: VecDeque<Arc<Event>>,
    shutdown: bool,
    watermark: usize,
    over_watermark: bool,
}

#[derive(Default)]
struct ListenerTables {
    by_channel: HashMap<String, Vec<Arc<Listener>>>,
    by_id: HashMap<u64, Arc<Listener>>,
}

struct BusInner {
    queue: Mutex<EventQueue>,
    queue_cv: Condvar,
    listeners: Mutex<ListenerTables>,
    next_listener_id: AtomicU64,
}

pub struct EventBus {
    inner: Arc<BusInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_watermark(DEFAULT_QUEUE_WATERMARK)
    }

    /// `watermark` is the queue depth above which publishing logs a
    /// warning; delivery itself is unbounded.
    pub fn with_queue_watermark(watermark: usize) -> Self {
        let inner = Arc::new(BusInner {
            queue: Mutex::new(EventQueue {
                events: VecDeque::new(),
                shutdown: false,
                watermark,
                over_watermark: false,
            }),
            queue_cv: Condvar::new(),
            listeners: Mutex::new(ListenerTables::default()),
            next_listener_id: AtomicU64::new(1),
        });

        let dispatch_inner = Arc::clone(&inner);
        let dispatcher = std::thread::Builder::new()
            .name("lyssna-eventbus".into())
            .spawn(move || dispatch_loop(dispatch_inner))
            .expect("failed to spawn event-bus dispatcher");

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Creates an empty event for `event_type`; the producer attaches
    /// payloads and hands it back to [`publish`](Self::publish).
    pub fn make_event(&self, event_type: impl Into<String>) -> Event {
        Event::new(event_type)
    }

    /// Appends an event to the dispatch queue. O(1) beyond the queue lock.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        let mut queue = self.inner.queue.lock();
        if queue.shutdown {
            return Err(BusError::ShuttingDown);
        }
        queue.events.push_back(Arc::new(event));

        if queue.events.len() > queue.watermark {
            if !queue.over_watermark {
                queue.over_watermark = true;
                warn!(depth = queue.events.len(), "event queue above watermark");
            }
        } else {
            queue.over_watermark = false;
        }

        self.inner.queue_cv.notify_one();
        Ok(())
    }

    /// Registers `callback` on every channel in `channels`. Ids are
    /// monotonic from 1 and never reused within a process lifetime.
    pub fn register_listener<S: AsRef<str>>(
        &self,
        channels: &[S],
        callback: ListenerCallback,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(Listener {
            id,
            channels: channels.iter().map(|c| c.as_ref().to_string()).collect(),
            callback,
        });

        let mut tables = self.inner.listeners.lock();
        for channel in &listener.channels {
            tables
                .by_channel
                .entry(channel.clone())
                .or_default()
                .push(Arc::clone(&listener));
        }
        tables.by_id.insert(id, listener);
        id
    }

    /// Removes a listener from every channel it subscribed to. Returns
    /// `false` for an unknown (or already removed) id.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut tables = self.inner.listeners.lock();
        let Some(listener) = tables.by_id.remove(&id) else {
            return false;
        };
        for channel in &listener.channels {
            if let Some(list) = tables.by_channel.get_mut(channel) {
                list.retain(|l| l.id != id);
                if list.is_empty() {
                    tables.by_channel.remove(channel);
                }
            }
        }
        true
    }

    /// Stops the dispatcher. Events still queued are discarded.
    pub fn shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
        }
        self.inner.queue_cv.notify_all();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(inner: Arc<BusInner>) {
    loop {
        let event = {
            let mut queue = inner.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(event) = queue.events.pop_front() {
                    break event;
                }
                inner.queue_cv.wait(&mut queue);
            }
        };

        // Snapshot under the table lock, dispatch with no lock held.
        let targets = {
            let tables = inner.listeners.lock();
            let mut targets: Vec<Arc<Listener>> = Vec::new();
            if let Some(list) = tables.by_channel.get(event.event_type()) {
                targets.extend(list.iter().cloned());
            }
            if event.event_type() != WILDCARD_CHANNEL {
                if let Some(list) = tables.by_channel.get(WILDCARD_CHANNEL) {
                    targets.extend(list.iter().cloned());
                }
            }
            targets
        };

        for listener in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event)));
            if outcome.is_err() {
                error!(
                    listener = listener.id,
                    event_type = event.event_type(),
                    "listener panicked during dispatch"
                );
            }
        }
    }
}
