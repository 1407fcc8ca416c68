//! Probe coordinator: the one-shot race resolving an `auto` definition to
//! a driver.
//!
//! In-process probes run first; any `Claim` short-circuits the race. For
//! every driver that needs a worker to decide, a short-lived probe child is
//! spawned with its own transaction id, and the first affirmative response
//! wins. Everything else — late responses, the remaining children, a second
//! affirmative — is cancelled or ignored. A deadline bounds the whole race.
//!
//! The coordinator completes exactly once: winner, nobody-claimed, or
//! timeout. Cancellation is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lyssna_core::time::{TimerId, TimerService};

use crate::definition::SourceDefinition;
use crate::driver::{ProbeOutcome, SourceDriver, SourceRole};
use crate::source::{CaptureSource, SourceContext};

/// How a probe race ended.
pub enum ProbeVerdict {
    Winner(Arc<dyn SourceDriver>),
    NoneClaimed,
    Timeout,
    Cancelled,
}

/// One-shot completion continuation, owned by the coordinator until it
/// fires.
pub(crate) type ProbeCompletion = Box<dyn FnOnce(ProbeVerdict) + Send>;

struct Attempt {
    driver: Arc<dyn SourceDriver>,
    source: Arc<CaptureSource>,
}

struct ProbeInner {
    outstanding: HashMap<u32, Attempt>,
    completed: bool,
    completion: Option<ProbeCompletion>,
    deadline: Option<TimerId>,
    next_transaction: u32,
}

pub(crate) struct ProbeCoordinator {
    definition: SourceDefinition,
    ctx: SourceContext,
    timer: Arc<TimerService>,
    started: Instant,
    inner: Mutex<ProbeInner>,
}

impl ProbeCoordinator {
    pub(crate) fn new(
        definition: SourceDefinition,
        ctx: SourceContext,
        timer: Arc<TimerService>,
        completion: ProbeCompletion,
    ) -> Arc<Self> {
        Arc::new(Self {
            definition,
            ctx,
            timer,
            started: Instant::now(),
            inner: Mutex::new(ProbeInner {
                outstanding: HashMap::new(),
                completed: false,
                completion: Some(completion),
                deadline: None,
                next_transaction: 1,
            }),
        })
    }

    /// Runs the race over `drivers` (registration order). Fast-path
    /// in-process probes first, then the concurrent worker race under
    /// `deadline`.
    pub(crate) fn run(self: &Arc<Self>, drivers: Vec<Arc<dyn SourceDriver>>, deadline: Duration) {
        let mut ipc_candidates = Vec::new();
        for driver in drivers {
            match driver.probe(&self.definition) {
                ProbeOutcome::Claim => {
                    debug!(
                        definition = self.definition.raw(),
                        driver = driver.type_tag(),
                        "in-process probe claimed definition"
                    );
                    self.complete(ProbeVerdict::Winner(driver));
                    return;
                }
                ProbeOutcome::Decline => {}
                ProbeOutcome::RequireIpc => ipc_candidates.push(driver),
            }
        }

        if ipc_candidates.is_empty() {
            self.complete(ProbeVerdict::NoneClaimed);
            return;
        }

        // Build every attempt under the lock so no response can race the
        // bookkeeping, then spawn the workers outside it.
        let mut to_start = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            for driver in ipc_candidates {
                let transaction_id = inner.next_transaction;
                inner.next_transaction += 1;

                let source = match CaptureSource::new(
                    Arc::clone(&driver),
                    self.definition.clone(),
                    self.ctx.clone(),
                ) {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(
                            driver = driver.type_tag(),
                            error = %e,
                            "skipping probe candidate"
                        );
                        continue;
                    }
                };

                let weak = Arc::downgrade(self);
                source.set_probe_report(Box::new(move |claimed, transaction| {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.complete_probe(claimed, transaction);
                    }
                }));

                inner.outstanding.insert(
                    transaction_id,
                    Attempt {
                        driver,
                        source: Arc::clone(&source),
                    },
                );
                to_start.push((source, transaction_id));
            }

            if !to_start.is_empty() {
                let weak = Arc::downgrade(self);
                inner.deadline = Some(self.timer.schedule_once(
                    deadline,
                    Box::new(move || {
                        if let Some(coordinator) = weak.upgrade() {
                            coordinator.cancel(ProbeVerdict::Timeout);
                        }
                    }),
                ));
            }
        }

        if to_start.is_empty() {
            self.complete(ProbeVerdict::NoneClaimed);
            return;
        }
        for (source, transaction_id) in to_start {
            source.start(SourceRole::Probe, transaction_id);
        }
    }

    /// Resolves the race outside the response path: fast-path winner, or
    /// nothing left to probe.
    fn complete(&self, verdict: ProbeVerdict) {
        self.cancel(verdict);
    }

    /// Called by a probe child's source when its PROBERESP (or failure)
    /// lands. First affirmative wins; ties and stragglers are ignored.
    fn complete_probe(&self, claimed: bool, transaction_id: u32) {
        let (finish, closers) = {
            let mut inner = self.inner.lock();
            if inner.completed {
                // Late response after a winner or the deadline.
                (None, Self::drain_attempt(&mut inner, transaction_id))
            } else if claimed {
                let Some(attempt) = inner.outstanding.remove(&transaction_id) else {
                    return;
                };
                inner.completed = true;
                let completion = inner.completion.take();
                let losers = inner
                    .outstanding
                    .drain()
                    .map(|(_, a)| a.source)
                    .collect::<Vec<_>>();
                (
                    completion.map(|cb| (cb, ProbeVerdict::Winner(attempt.driver))),
                    losers,
                )
            } else {
                inner.outstanding.remove(&transaction_id);
                if inner.outstanding.is_empty() {
                    inner.completed = true;
                    (
                        inner
                            .completion
                            .take()
                            .map(|cb| (cb, ProbeVerdict::NoneClaimed)),
                        Vec::new(),
                    )
                } else {
                    (None, Vec::new())
                }
            }
        };

        for source in closers {
            source.close();
        }
        if let Some((completion, verdict)) = finish {
            self.finish(completion, verdict);
        }
    }

    /// Cancels the race, terminating outstanding children. Idempotent.
    pub(crate) fn cancel(&self, verdict: ProbeVerdict) {
        let (finish, closers) = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
            let closers = inner
                .outstanding
                .drain()
                .map(|(_, a)| a.source)
                .collect::<Vec<_>>();
            (inner.completion.take().map(|cb| (cb, verdict)), closers)
        };

        for source in closers {
            source.close();
        }
        if let Some((completion, verdict)) = finish {
            self.finish(completion, verdict);
        }
    }

    fn finish(&self, completion: ProbeCompletion, verdict: ProbeVerdict) {
        if let Some(id) = self.inner.lock().deadline.take() {
            self.timer.cancel(id);
        }
        let elapsed = self.started.elapsed();
        if let Some(metrics) = &self.ctx.metrics {
            metrics.probe_latency.observe(elapsed.as_secs_f64());
        }
        match &verdict {
            ProbeVerdict::Winner(driver) => info!(
                definition = self.definition.raw(),
                driver = driver.type_tag(),
                elapsed_ms = elapsed.as_millis() as u64,
                "probe resolved"
            ),
            ProbeVerdict::NoneClaimed => debug!(
                definition = self.definition.raw(),
                "no driver claimed definition"
            ),
            ProbeVerdict::Timeout => warn!(
                definition = self.definition.raw(),
                "probe deadline expired"
            ),
            ProbeVerdict::Cancelled => debug!(
                definition = self.definition.raw(),
                "probe cancelled"
            ),
        }
        completion(verdict);
    }

    fn drain_attempt(inner: &mut ProbeInner, transaction_id: u32) -> Vec<Arc<CaptureSource>> {
        inner
            .outstanding
            .remove(&transaction_id)
            .map(|a| vec![a.source])
            .unwrap_or_default()
    }
}
