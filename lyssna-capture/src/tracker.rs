//! Source tracker: the registry and supervisor for capture drivers and the
//! live sources built from them.
//!
//! Drivers are registered once at startup; `open_source` resolves a textual
//! definition to a driver (directly via `type=`, or by racing probes for
//! `auto`), admits the resulting source into the live set, and spawns it.
//! Once a source has been admitted it stays in the live set — errored
//! sources included — until removed, so a definition can outlive the
//! hardware being unplugged. A periodic timer pokes retriable errored
//! sources back through `INIT`.
//!
//! Construction is explicit: the tracker takes the event bus and timer it
//! should use; there are no process-wide singletons.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lyssna_config::LyssnaConfig;
use lyssna_core::events::bus::EventBus;
use lyssna_core::time::{TimerId, TimerService};
use lyssna_telemetry::MetricsRecorder;
use uuid::Uuid;

use crate::definition::SourceDefinition;
use crate::driver::{SourceDriver, SourceRole};
use crate::error::CaptureError;
use crate::list::{ListCompletion, ListCoordinator};
use crate::probe::{ProbeCoordinator, ProbeVerdict};
use crate::source::{CaptureSource, OpenCompletion, SourceContext, SourceSnapshot};

/// Worker for [`SourceTracker::iterate_sources`]. `handle` runs with the
/// tracker lock held: calling back into the tracker from it deadlocks.
pub trait SourceWorker {
    fn handle(&mut self, source: &SourceSnapshot);

    /// Called once after every live source has been handled, with the
    /// tracker lock released.
    fn finalize(&mut self) {}
}

struct TrackerInner {
    drivers: Vec<Arc<dyn SourceDriver>>,
    sources: Vec<Arc<CaptureSource>>,
    probing: Vec<(u64, Arc<ProbeCoordinator>)>,
    listing: Vec<(u64, Arc<ListCoordinator>)>,
    next_runtime_id: u32,
    next_coordinator_key: u64,
    retry_timer: Option<TimerId>,
}

pub struct SourceTracker {
    self_weak: Weak<SourceTracker>,
    ctx: SourceContext,
    timer: Arc<TimerService>,
    next_transaction: AtomicU32,
    inner: Mutex<TrackerInner>,
}

impl SourceTracker {
    /// Builds the tracker and arms the retry timer. `bus` and `timer` are
    /// shared with the rest of the system by the caller.
    pub fn new(
        bus: Arc<EventBus>,
        timer: Arc<TimerService>,
        config: Arc<LyssnaConfig>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Arc<Self> {
        let retry_on_error = config.capture.retry_on_error;
        let retry_interval = config.capture.retry_interval();

        let tracker = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            self_weak: weak.clone(),
            ctx: SourceContext {
                bus,
                config,
                metrics,
            },
            timer: Arc::clone(&timer),
            next_transaction: AtomicU32::new(1),
            inner: Mutex::new(TrackerInner {
                drivers: Vec::new(),
                sources: Vec::new(),
                probing: Vec::new(),
                listing: Vec::new(),
                next_runtime_id: 1,
                next_coordinator_key: 1,
                retry_timer: None,
            }),
        });

        if retry_on_error {
            let weak = Arc::downgrade(&tracker);
            let id = timer.schedule_periodic(
                retry_interval,
                Box::new(move || {
                    if let Some(tracker) = weak.upgrade() {
                        tracker.retry_tick();
                    }
                }),
            );
            tracker.inner.lock().retry_timer = Some(id);
        }

        tracker
    }

    /// Registers a driver. A second registration for the same type tag
    /// replaces the first and returns it.
    pub fn register_driver(
        &self,
        driver: Arc<dyn SourceDriver>,
    ) -> Option<Arc<dyn SourceDriver>> {
        let mut inner = self.inner.lock();
        let tag = driver.type_tag().to_string();
        match inner.drivers.iter().position(|d| d.type_tag() == tag) {
            Some(at) => {
                warn!(driver = %tag, "replacing registered driver");
                Some(std::mem::replace(&mut inner.drivers[at], driver))
            }
            None => {
                info!(driver = %tag, "registered capture driver");
                inner.drivers.push(driver);
                None
            }
        }
    }

    pub fn driver_types(&self) -> Vec<String> {
        self.inner
            .lock()
            .drivers
            .iter()
            .map(|d| d.type_tag().to_string())
            .collect()
    }

    /// Opens a capture source from a textual definition.
    ///
    /// `completion` fires exactly once — when the source first reaches
    /// `RUNNING` or `ERROR`, or immediately on an operational failure. The
    /// operational failures (malformed definition, unknown driver,
    /// duplicate pinned uuid) are additionally returned synchronously.
    /// The source is admitted into the live set before `completion` fires.
    pub fn open_source(
        &self,
        definition: &str,
        completion: OpenCompletion,
    ) -> Result<(), CaptureError> {
        let def = match SourceDefinition::parse(definition) {
            Ok(def) => def,
            Err(e) => {
                completion(false, e.to_string());
                return Err(e);
            }
        };

        match def.uuid() {
            Err(e) => {
                completion(false, e.to_string());
                return Err(e);
            }
            Ok(Some(pinned)) => {
                if self.find_by_uuid(&pinned).is_some() {
                    let e = CaptureError::DuplicateUuid(pinned);
                    completion(false, e.to_string());
                    return Err(e);
                }
            }
            Ok(None) => {}
        }

        if !def.is_auto() {
            let tag = def.type_tag().unwrap_or_default().to_string();
            let driver = {
                let inner = self.inner.lock();
                inner.drivers.iter().find(|d| d.type_tag() == tag).cloned()
            };
            return match driver {
                Some(driver) => {
                    self.admit_and_open(def, driver, completion);
                    Ok(())
                }
                None => {
                    let e = CaptureError::UnknownDriver(tag);
                    completion(false, e.to_string());
                    Err(e)
                }
            };
        }

        // Auto type: race every registered driver's probe.
        debug!(definition = def.raw(), "probing for a driver");
        let drivers = self.inner.lock().drivers.clone();
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.next_coordinator_key;
            inner.next_coordinator_key += 1;
            key
        };

        let weak = self.self_weak.clone();
        let def_for_completion = def.clone();
        let coordinator = ProbeCoordinator::new(
            def.clone(),
            self.ctx.clone(),
            Arc::clone(&self.timer),
            Box::new(move |verdict| match weak.upgrade() {
                Some(tracker) => {
                    tracker.probe_complete(key, def_for_completion, verdict, completion)
                }
                None => completion(false, "tracker shut down".to_string()),
            }),
        );

        self.inner.lock().probing.push((key, Arc::clone(&coordinator)));
        coordinator.run(drivers, self.ctx.config.capture.probe_timeout());
        Ok(())
    }

    fn probe_complete(
        &self,
        key: u64,
        def: SourceDefinition,
        verdict: ProbeVerdict,
        completion: OpenCompletion,
    ) {
        self.inner.lock().probing.retain(|(k, _)| *k != key);
        match verdict {
            ProbeVerdict::Winner(driver) => self.admit_and_open(def, driver, completion),
            ProbeVerdict::NoneClaimed => completion(
                false,
                format!("no driver claimed source '{}'", def.raw()),
            ),
            ProbeVerdict::Timeout => {
                let e = CaptureError::Timeout;
                completion(false, format!("probe {e} resolving source '{}'", def.raw()));
            }
            ProbeVerdict::Cancelled => {
                completion(false, format!("probe cancelled for source '{}'", def.raw()))
            }
        }
    }

    /// Admits a source for `driver` and spawns it in the open role.
    fn admit_and_open(
        &self,
        def: SourceDefinition,
        driver: Arc<dyn SourceDriver>,
        completion: OpenCompletion,
    ) {
        let source = match CaptureSource::new(driver, def, self.ctx.clone()) {
            Ok(source) => source,
            Err(e) => {
                completion(false, e.to_string());
                return;
            }
        };

        // Attach the completion before the source becomes visible, so a
        // racing remove still reports through it exactly once.
        source.set_completion(completion);
        {
            let mut inner = self.inner.lock();
            if inner.sources.iter().any(|s| s.uuid() == source.uuid()) {
                drop(inner);
                if let Some(completion) = source.take_completion() {
                    completion(false, CaptureError::DuplicateUuid(source.uuid()).to_string());
                }
                return;
            }
            let runtime_id = inner.next_runtime_id;
            inner.next_runtime_id += 1;
            source.set_runtime_id(runtime_id);
            inner.sources.push(Arc::clone(&source));
            info!(
                uuid = %source.uuid(),
                runtime_id,
                driver = %source.driver_type(),
                definition = source.definition().raw(),
                "capture source admitted"
            );
        }

        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        source.start(SourceRole::Open, transaction_id);
    }

    /// Removes a source by uuid, tearing its transport down. Returns
    /// `false` when no live source carries that uuid.
    pub fn remove_source(&self, uuid: &Uuid) -> bool {
        let source = {
            let mut inner = self.inner.lock();
            match inner.sources.iter().position(|s| s.uuid() == *uuid) {
                Some(at) => inner.sources.remove(at),
                None => return false,
            }
        };
        info!(uuid = %uuid, "removing capture source");
        source.close();
        true
    }

    /// Removes a source by its runtime id.
    pub fn remove_source_by_id(&self, runtime_id: u32) -> bool {
        let source = {
            let mut inner = self.inner.lock();
            match inner
                .sources
                .iter()
                .position(|s| s.runtime_id() == runtime_id)
            {
                Some(at) => inner.sources.remove(at),
                None => return false,
            }
        };
        source.close();
        true
    }

    /// Runs `worker` over a snapshot of every live source, tracker locked
    /// for the duration.
    pub fn iterate_sources(&self, worker: &mut dyn SourceWorker) {
        {
            let inner = self.inner.lock();
            for source in &inner.sources {
                worker.handle(&source.snapshot());
            }
        }
        worker.finalize();
    }

    /// Snapshots of every source currently parked in `ERROR`.
    pub fn error_sources(&self) -> Vec<SourceSnapshot> {
        let inner = self.inner.lock();
        inner
            .sources
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| s.state == crate::source::SourceState::Error)
            .collect()
    }

    /// Sweeps every driver for openable interfaces; `completion` fires
    /// once with the union, bounded by the list deadline.
    pub fn list_interfaces(&self, completion: ListCompletion) {
        let drivers = self.inner.lock().drivers.clone();
        let key = {
            let mut inner = self.inner.lock();
            let key = inner.next_coordinator_key;
            inner.next_coordinator_key += 1;
            key
        };

        let weak = self.self_weak.clone();
        let coordinator = ListCoordinator::new(
            self.ctx.clone(),
            Arc::clone(&self.timer),
            Box::new(move |interfaces| {
                if let Some(tracker) = weak.upgrade() {
                    tracker.inner.lock().listing.retain(|(k, _)| *k != key);
                }
                completion(interfaces);
            }),
        );

        self.inner.lock().listing.push((key, Arc::clone(&coordinator)));
        coordinator.run(drivers, self.ctx.config.capture.list_timeout());
    }

    /// Retry tick: every errored source whose driver marks it retriable
    /// goes back through `INIT`.
    fn retry_tick(&self) {
        let candidates = {
            let inner = self.inner.lock();
            inner
                .sources
                .iter()
                .filter(|s| s.is_retriable_error())
                .cloned()
                .collect::<Vec<_>>()
        };
        for source in candidates {
            let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
            source.retry(transaction_id);
        }
    }

    /// Stops the retry timer, cancels in-flight coordinators, and closes
    /// every live source.
    pub fn shutdown(&self) {
        let (probing, listing, sources, retry_timer) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.probing),
                std::mem::take(&mut inner.listing),
                std::mem::take(&mut inner.sources),
                inner.retry_timer.take(),
            )
        };
        if let Some(id) = retry_timer {
            self.timer.cancel(id);
        }
        for (_, coordinator) in probing {
            coordinator.cancel(ProbeVerdict::Cancelled);
        }
        for (_, coordinator) in listing {
            coordinator.cancel();
        }
        for source in sources {
            source.close();
        }
    }

    fn find_by_uuid(&self, uuid: &Uuid) -> Option<Arc<CaptureSource>> {
        let inner = self.inner.lock();
        inner.sources.iter().find(|s| s.uuid() == *uuid).cloned()
    }
}

impl Drop for SourceTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Interface, ProbeOutcome};
    use crate::events;
    use crate::source::SourceState;
    use crate::testkit::{
        fast_config, fresh_timer, recv_event, watch_events, ScriptedDriver, Step,
    };
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_tracker() -> (Arc<SourceTracker>, Arc<EventBus>, Arc<TimerService>) {
        let bus = Arc::new(EventBus::new());
        let timer = fresh_timer();
        let tracker = SourceTracker::new(
            Arc::clone(&bus),
            Arc::clone(&timer),
            Arc::new(fast_config()),
            None,
        );
        (tracker, bus, timer)
    }

    fn completion_channel() -> (OpenCompletion, mpsc::Receiver<(bool, String)>) {
        let (tx, rx) = mpsc::channel();
        let completion: OpenCompletion = Box::new(move |ok, detail| {
            let _ = tx.send((ok, detail));
        });
        (completion, rx)
    }

    fn recv_completion(rx: &mpsc::Receiver<(bool, String)>) -> (bool, String) {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("completion should fire")
    }

    struct Collect(Vec<SourceSnapshot>, bool);

    impl SourceWorker for Collect {
        fn handle(&mut self, source: &SourceSnapshot) {
            self.0.push(source.clone());
        }
        fn finalize(&mut self) {
            self.1 = true;
        }
    }

    fn live_snapshots(tracker: &SourceTracker) -> Vec<SourceSnapshot> {
        let mut collect = Collect(Vec::new(), false);
        tracker.iterate_sources(&mut collect);
        assert!(collect.1, "finalize must run");
        collect.0
    }

    #[test]
    fn typed_open_reaches_running() {
        let (tracker, bus, _timer) = test_tracker();
        let events_rx = watch_events(&bus, &[events::SOURCE_OPENED]);
        tracker.register_driver(ScriptedDriver::new("wifi").build());

        let (completion, rx) = completion_channel();
        tracker
            .open_source("wlan0:type=wifi", completion)
            .expect("open should be accepted");

        let (ok, detail) = recv_completion(&rx);
        assert!(ok, "open failed: {detail}");
        let (event_type, _) = recv_event(&events_rx, "SOURCE_OPENED");
        assert_eq!(event_type, events::SOURCE_OPENED);

        let live = live_snapshots(&tracker);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].driver_type, "wifi");
        assert_eq!(live[0].state, SourceState::Running);
        assert_eq!(live[0].runtime_id, 1);
        assert_eq!(live[0].channels, ["1", "6", "11"]);
    }

    #[test]
    fn probe_race_first_affirmative_wins() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(ScriptedDriver::new("A").probe_ipc(80, true).build());
        tracker.register_driver(ScriptedDriver::new("B").probe_ipc(50, true).build());
        tracker.register_driver(ScriptedDriver::new("C").probe_ipc(200, true).build());

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0", completion).unwrap();

        let (ok, detail) = recv_completion(&rx);
        assert!(ok, "open failed: {detail}");
        // Exactly one completion.
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());

        let live = live_snapshots(&tracker);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].driver_type, "B");
    }

    #[test]
    fn probe_timeout_reports_failure() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(ScriptedDriver::new("slow").probe_silent().build());

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0", completion).unwrap();

        let (ok, detail) = recv_completion(&rx);
        assert!(!ok);
        assert!(detail.contains("timeout"), "unexpected reason: {detail}");
        assert!(live_snapshots(&tracker).is_empty());
    }

    #[test]
    fn probe_fast_path_skips_ipc() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(ScriptedDriver::new("never").probe_silent().build());
        tracker.register_driver(
            ScriptedDriver::new("native")
                .probe_inproc(ProbeOutcome::Claim)
                .build(),
        );

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0", completion).unwrap();

        let (ok, _) = recv_completion(&rx);
        assert!(ok);
        assert_eq!(live_snapshots(&tracker)[0].driver_type, "native");
    }

    #[test]
    fn probe_with_no_claimants_fails() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(ScriptedDriver::new("A").probe_ipc(10, false).build());
        tracker.register_driver(ScriptedDriver::new("B").probe_ipc(20, false).build());

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0", completion).unwrap();

        let (ok, detail) = recv_completion(&rx);
        assert!(!ok);
        assert!(detail.contains("no driver"), "unexpected reason: {detail}");
    }

    #[test]
    fn unknown_type_rejected_synchronously() {
        let (tracker, _bus, _timer) = test_tracker();
        let (completion, rx) = completion_channel();
        let result = tracker.open_source("wlan0:type=sdr", completion);
        assert!(matches!(result, Err(CaptureError::UnknownDriver(_))));
        let (ok, _) = recv_completion(&rx);
        assert!(!ok);
    }

    #[test]
    fn malformed_definition_rejected() {
        let (tracker, _bus, _timer) = test_tracker();
        let (completion, rx) = completion_channel();
        let result = tracker.open_source(":type=wifi", completion);
        assert!(matches!(result, Err(CaptureError::BadDefinition(_))));
        assert!(!recv_completion(&rx).0);
    }

    #[test]
    fn duplicate_pinned_uuid_rejected() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(ScriptedDriver::new("wifi").build());
        let def = "wlan0:type=wifi,uuid=6c1ab781-8fc9-4b08-b8bc-cfd7aaa9b059";

        let (completion, rx) = completion_channel();
        tracker.open_source(def, completion).unwrap();
        assert!(recv_completion(&rx).0);

        let (completion, rx) = completion_channel();
        let result = tracker.open_source(def, completion);
        assert!(matches!(result, Err(CaptureError::DuplicateUuid(_))));
        assert!(!recv_completion(&rx).0);
    }

    #[test]
    fn open_failure_retries_with_stable_uuid() {
        let (tracker, bus, _timer) = test_tracker();
        let events_rx = watch_events(&bus, &[events::SOURCE_ERROR, events::SOURCE_OPENED]);
        tracker.register_driver(
            ScriptedDriver::new("wifi")
                .next_open(vec![
                    Step::Hello,
                    Step::AwaitRequest,
                    Step::OpenResp {
                        ok: false,
                        message: "device busy".into(),
                    },
                ])
                .build(),
        );

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0:type=wifi", completion).unwrap();

        // First attempt errors; the completion carries the worker's reason.
        let (ok, detail) = recv_completion(&rx);
        assert!(!ok);
        assert!(detail.contains("device busy"), "got: {detail}");
        let (event_type, error_uuid) = recv_event(&events_rx, "SOURCE_ERROR");
        assert_eq!(event_type, events::SOURCE_ERROR);

        // The source survives the failure and retries on the timer.
        assert_eq!(live_snapshots(&tracker).len(), 1);
        let (event_type, opened_uuid) = recv_event(&events_rx, "SOURCE_OPENED after retry");
        assert_eq!(event_type, events::SOURCE_OPENED);
        assert_eq!(error_uuid, opened_uuid, "uuid must be stable across retry");

        let live = live_snapshots(&tracker);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].state, SourceState::Running);
        assert_eq!(live[0].counters.retries, 1);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(
            ScriptedDriver::new("wifi")
                .open_script(vec![Step::Hello, Step::AwaitRequest, Step::ExitCode(3)])
                .build(),
        );

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0:type=wifi", completion).unwrap();
        let (ok, detail) = recv_completion(&rx);
        assert!(!ok);
        assert!(detail.contains("permission"), "got: {detail}");

        // Wait past one retry interval: still errored, never retried.
        std::thread::sleep(Duration::from_millis(1600));
        let live = live_snapshots(&tracker);
        assert_eq!(live[0].state, SourceState::Error);
        assert_eq!(live[0].counters.retries, 0);
        assert_eq!(live[0].error_kind, Some("permission_denied"));
        assert_eq!(tracker.error_sources().len(), 1);
    }

    #[test]
    fn remove_source_erases_and_closes() {
        let (tracker, bus, _timer) = test_tracker();
        let events_rx = watch_events(&bus, &[events::SOURCE_CLOSED]);
        tracker.register_driver(ScriptedDriver::new("wifi").build());

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0:type=wifi", completion).unwrap();
        assert!(recv_completion(&rx).0);

        let uuid = live_snapshots(&tracker)[0].uuid;
        assert!(tracker.remove_source(&uuid));
        let (event_type, closed_uuid) = recv_event(&events_rx, "SOURCE_CLOSED");
        assert_eq!(event_type, events::SOURCE_CLOSED);
        assert_eq!(closed_uuid, Some(uuid));

        assert!(live_snapshots(&tracker).is_empty());
        assert!(!tracker.remove_source(&uuid));
    }

    #[test]
    fn register_driver_replaces_same_tag() {
        let (tracker, _bus, _timer) = test_tracker();
        assert!(tracker
            .register_driver(ScriptedDriver::new("wifi").build())
            .is_none());
        let previous = tracker.register_driver(ScriptedDriver::new("wifi").build());
        assert!(previous.is_some());
        assert_eq!(tracker.driver_types(), ["wifi"]);
    }

    #[test]
    fn list_interfaces_unions_inproc_and_ipc() {
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(
            ScriptedDriver::new("wifi")
                .list_inproc(vec![Interface {
                    name: "wlan0".into(),
                    driver_type: "wifi".into(),
                    description: String::new(),
                }])
                .build(),
        );
        tracker.register_driver(
            ScriptedDriver::new("bt")
                .list_ipc(vec!["hci0".into(), "hci1".into()])
                .build(),
        );

        let (tx, rx) = mpsc::channel();
        tracker.list_interfaces(Box::new(move |interfaces| {
            let _ = tx.send(interfaces);
        }));

        let mut names = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("list completion")
            .into_iter()
            .map(|i| i.name)
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, ["hci0", "hci1", "wlan0"]);
    }

    #[test]
    fn open_uses_queued_then_default_script() {
        // Mirrors a worker that recovers on the second attempt; the first
        // script comes from the queue, later ones from the default.
        let driver = ScriptedDriver::new("wifi")
            .next_open(vec![
                Step::Hello,
                Step::AwaitRequest,
                Step::ErrorFrame("hardware wedged".into()),
            ])
            .build();
        let (tracker, _bus, _timer) = test_tracker();
        tracker.register_driver(driver);

        let (completion, rx) = completion_channel();
        tracker.open_source("wlan0:type=wifi", completion).unwrap();
        let (ok, detail) = recv_completion(&rx);
        assert!(!ok);
        assert!(detail.contains("hardware wedged"), "got: {detail}");

        // Retry timer brings it back with the default (successful) script.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let live = live_snapshots(&tracker);
            if live[0].state == SourceState::Running {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "source never recovered: {:?}",
                live[0]
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
