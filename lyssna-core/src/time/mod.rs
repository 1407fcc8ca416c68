//! Timer service.
//!
//! One named thread multiplexes every periodic and one-shot timer in the
//! process: retry ticks, probe deadlines, list deadlines. Callbacks run on
//! the timer thread with no service lock held, so they may schedule and
//! cancel timers freely; long-running work belongs elsewhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

pub type TimerId = u64;

/// Timer callback; periodic timers invoke it every period until cancelled.
pub type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    // Taken while the callback is running on the timer thread.
    callback: Option<TimerCallback>,
}

struct TimerState {
    timers: HashMap<TimerId, TimerEntry>,
    next_id: TimerId,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub struct TimerService {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                timers: HashMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let loop_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("lyssna-timer".into())
            .spawn(move || timer_loop(loop_inner))
            .expect("failed to spawn timer thread");

        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Fires `callback` every `period`, first fire one period from now.
    pub fn schedule_periodic(&self, period: Duration, callback: TimerCallback) -> TimerId {
        self.schedule(Instant::now() + period, Some(period), callback)
    }

    /// Fires `callback` once, `delay` from now.
    pub fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.schedule(Instant::now() + delay, None, callback)
    }

    fn schedule(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert(
            id,
            TimerEntry {
                deadline,
                period,
                callback: Some(callback),
            },
        );
        self.inner.cv.notify_all();
        id
    }

    /// Cancels a timer. Returns `false` if the id is unknown, already
    /// fired (one-shot), or already cancelled. Cancelling is idempotent.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.inner.state.lock();
        let found = state.timers.remove(&id).is_some();
        if found {
            self.inner.cv.notify_all();
        }
        found
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
        }
        self.inner.cv.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(inner: Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let due = state
            .timers
            .iter()
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(id, entry)| (*id, entry.deadline));

        let Some((id, deadline)) = due else {
            inner.cv.wait(&mut state);
            continue;
        };

        let now = Instant::now();
        if deadline > now {
            inner.cv.wait_for(&mut state, deadline - now);
            // Re-evaluate: the wakeup may be a new timer, a cancel, or
            // shutdown rather than the deadline.
            continue;
        }

        trace!(timer = id, "timer fired");
        let entry = state.timers.get_mut(&id).expect("due timer present");
        let mut callback = entry.callback.take().expect("due timer armed");
        let period = entry.period;
        match period {
            Some(period) => entry.deadline = now + period,
            None => {
                state.timers.remove(&id);
            }
        }

        MutexGuard::unlocked(&mut state, || callback());

        if period.is_some() {
            // Re-arm unless the timer was cancelled while running.
            if let Some(entry) = state.timers.get_mut(&id) {
                entry.callback = Some(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn one_shot_fires_once() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        timers.schedule_once(
            Duration::from_millis(20),
            Box::new(move || tx.send(1).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn periodic_fires_until_cancelled() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let id = timers.schedule_periodic(
            Duration::from_millis(10),
            Box::new(move || tx.send(1).unwrap()),
        );

        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        }
        assert!(timers.cancel(id));
        // Drain anything in flight, then expect silence.
        while rx.recv_timeout(Duration::from_millis(50)).is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn cancel_before_fire_suppresses() {
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel::<u64>();
        let id = timers.schedule_once(
            Duration::from_millis(200),
            Box::new(move || tx.send(1).unwrap()),
        );
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn callbacks_may_schedule_timers() {
        let timers = Arc::new(TimerService::new());
        let (tx, rx) = mpsc::channel();

        let chained = Arc::clone(&timers);
        timers.schedule_once(
            Duration::from_millis(10),
            Box::new(move || {
                let tx = tx.clone();
                chained.schedule_once(
                    Duration::from_millis(10),
                    Box::new(move || tx.send(2).unwrap()),
                );
            }),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }
}
