//! List coordinator: a time-bounded sweep across every driver for the
//! interfaces it could open.
//!
//! In-process answers aggregate immediately; drivers that need a worker to
//! enumerate hardware get a short-lived child in the listing role. Results
//! are the union of every driver's answer; a driver that fails or misses
//! the deadline simply contributes nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use lyssna_core::time::{TimerId, TimerService};

use crate::driver::{Interface, ListOutcome, SourceDriver, SourceRole};
use crate::error::CaptureError;
use crate::source::{CaptureSource, SourceContext};

/// One-shot completion with the aggregated interface list.
pub type ListCompletion = Box<dyn FnOnce(Vec<Interface>) + Send>;

struct ListInner {
    outstanding: HashMap<u32, Arc<CaptureSource>>,
    results: Vec<Interface>,
    completed: bool,
    completion: Option<ListCompletion>,
    deadline: Option<TimerId>,
    next_transaction: u32,
}

pub(crate) struct ListCoordinator {
    ctx: SourceContext,
    timer: Arc<TimerService>,
    inner: Mutex<ListInner>,
}

impl ListCoordinator {
    pub(crate) fn new(
        ctx: SourceContext,
        timer: Arc<TimerService>,
        completion: ListCompletion,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            timer,
            inner: Mutex::new(ListInner {
                outstanding: HashMap::new(),
                results: Vec::new(),
                completed: false,
                completion: Some(completion),
                deadline: None,
                next_transaction: 1,
            }),
        })
    }

    pub(crate) fn run(self: &Arc<Self>, drivers: Vec<Arc<dyn SourceDriver>>, deadline: Duration) {
        let mut ipc_candidates = Vec::new();
        {
            let mut inner = self.inner.lock();
            for driver in drivers {
                match driver.list() {
                    ListOutcome::Interfaces(mut interfaces) => {
                        inner.results.append(&mut interfaces);
                    }
                    ListOutcome::RequireIpc => ipc_candidates.push(driver),
                }
            }
        }

        if ipc_candidates.is_empty() {
            self.complete();
            return;
        }

        let mut to_start = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            for driver in ipc_candidates {
                let transaction_id = inner.next_transaction;
                inner.next_transaction += 1;

                // Listing has no device yet; the worker enumerates from a
                // placeholder definition.
                let definition = match crate::definition::SourceDefinition::parse("list") {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                let source = match CaptureSource::new(
                    Arc::clone(&driver),
                    definition,
                    self.ctx.clone(),
                ) {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(
                            driver = driver.type_tag(),
                            error = %e,
                            "skipping list candidate"
                        );
                        continue;
                    }
                };

                let weak = Arc::downgrade(self);
                source.set_list_report(Box::new(move |interfaces, transaction| {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.complete_list(interfaces, transaction);
                    }
                }));

                inner
                    .outstanding
                    .insert(transaction_id, Arc::clone(&source));
                to_start.push((source, transaction_id));
            }

            if !to_start.is_empty() {
                let weak = Arc::downgrade(self);
                inner.deadline = Some(self.timer.schedule_once(
                    deadline,
                    Box::new(move || {
                        if let Some(coordinator) = weak.upgrade() {
                            coordinator.cancel();
                        }
                    }),
                ));
            }
        }

        if to_start.is_empty() {
            self.complete();
            return;
        }
        for (source, transaction_id) in to_start {
            source.start(SourceRole::List, transaction_id);
        }
    }

    fn complete_list(&self, mut interfaces: Vec<Interface>, transaction_id: u32) {
        let finish = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            if inner.outstanding.remove(&transaction_id).is_none() {
                return;
            }
            inner.results.append(&mut interfaces);
            inner.outstanding.is_empty()
        };
        if finish {
            self.complete();
        }
    }

    /// Deadline expiry: report whatever arrived, terminate stragglers.
    pub(crate) fn cancel(&self) {
        let stragglers = { self.inner.lock().outstanding.len() };
        if stragglers > 0 {
            let e = CaptureError::Timeout;
            debug!(
                kind = e.kind(),
                stragglers,
                "list {e} with workers outstanding"
            );
        }
        self.complete();
    }

    fn complete(&self) {
        let (finish, closers) = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
            let closers = inner.outstanding.drain().map(|(_, s)| s).collect::<Vec<_>>();
            let results = std::mem::take(&mut inner.results);
            (inner.completion.take().map(|cb| (cb, results)), closers)
        };

        if let Some(id) = self.inner.lock().deadline.take() {
            self.timer.cancel(id);
        }
        for source in closers {
            source.close();
        }
        if let Some((completion, results)) = finish {
            completion(results);
        }
    }
}
