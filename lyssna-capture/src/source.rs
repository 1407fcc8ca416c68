//! Capture source instance.
//!
//! One `CaptureSource` represents a live (or errored) capture device: it
//! owns the transport to its worker, drives the per-source protocol state
//! machine, and publishes lifecycle and packet events on the bus.
//!
//! State machine, `INIT` initial, `CLOSED` terminal:
//!
//! ```text
//! INIT  --spawn ok--> HANDSHAKE --HELLO--> PROBING | OPENING | LISTING
//! PROBING --PROBERESP--> CLOSED
//! OPENING --OPENRESP ok--> RUNNING     --OPENRESP fail--> ERROR
//! RUNNING --DATA--> RUNNING            --ERROR/EOF/exit--> ERROR
//! ERROR --retry--> INIT                any --remove--> CLOSED
//! ```
//!
//! The worker's first frame must be `HELLO`; anything else fails the
//! handshake. Past the handshake, frames that don't fit the current state
//! are logged and dropped. Responses correlate by transaction id; stale
//! ids are ignored.
//!
//! Bus publishes and user callbacks never run under the source lock: frame
//! handlers record their side effects and the effects run after unlock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use lyssna_config::LyssnaConfig;
use lyssna_core::events::bus::EventBus;
use lyssna_core::events::{Event, EventPayload};
use lyssna_proto::endpoint::CloseReason;
use lyssna_proto::frame::{key, msg};
use lyssna_proto::Frame;
use lyssna_telemetry::MetricsRecorder;

use crate::definition::SourceDefinition;
use crate::driver::{Interface, SourceDriver, SourceRole, SourceTransport, TransportEvents};
use crate::error::CaptureError;
use crate::events::{self, attr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Init,
    Handshake,
    Probing,
    Opening,
    Listing,
    Running,
    Error,
    Closed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceState::Init => "init",
            SourceState::Handshake => "handshake",
            SourceState::Probing => "probing",
            SourceState::Opening => "opening",
            SourceState::Listing => "listing",
            SourceState::Running => "running",
            SourceState::Error => "error",
            SourceState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Runtime counters, exposed through [`SourceSnapshot`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceCounters {
    pub frames: u64,
    pub packets: u64,
    pub messages: u64,
    pub errors: u64,
    pub retries: u64,
}

/// Read-only view of one source, as yielded by `iterate_sources`.
#[derive(Clone, Debug)]
pub struct SourceSnapshot {
    pub uuid: Uuid,
    pub runtime_id: u32,
    pub definition: String,
    pub interface: String,
    pub name: String,
    pub driver_type: String,
    pub channel_capable: bool,
    pub channels: Vec<String>,
    pub hop_channels: Vec<String>,
    pub state: SourceState,
    pub child_pid: Option<u32>,
    pub error_kind: Option<&'static str>,
    pub error_reason: Option<String>,
    pub counters: SourceCounters,
}

/// Shared collaborators handed to every source.
#[derive(Clone)]
pub struct SourceContext {
    pub bus: Arc<EventBus>,
    pub config: Arc<LyssnaConfig>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

/// Completion for `open_source`: fires exactly once with `(true, detail)`
/// or `(false, human_readable_reason)`.
pub type OpenCompletion = Box<dyn FnOnce(bool, String) + Send>;

/// Probe verdict back to the coordinator: `(claimed, transaction_id)`.
pub(crate) type ProbeReport = Box<dyn FnOnce(bool, u32) + Send>;

/// List results back to the coordinator.
pub(crate) type ListReport = Box<dyn FnOnce(Vec<Interface>, u32) + Send>;

struct Inner {
    state: SourceState,
    role: SourceRole,
    runtime_id: u32,
    name: String,
    interface: String,
    channel_capable: bool,
    channels: Vec<String>,
    hop_channels: Vec<String>,
    transaction_id: u32,
    transport: Option<Arc<dyn SourceTransport>>,
    // Replies produced before the transport handle lands in `transport`.
    pending_writes: Vec<Frame>,
    child_pid: Option<u32>,
    error_kind: Option<&'static str>,
    error_reason: Option<String>,
    retriable_error: bool,
    counters: SourceCounters,
    completion: Option<OpenCompletion>,
    probe_report: Option<ProbeReport>,
    list_report: Option<ListReport>,
}

/// Side effects collected under the source lock, executed after unlock.
#[derive(Default)]
struct Effects {
    writes: Vec<Frame>,
    write_via: Option<Arc<dyn SourceTransport>>,
    close_transport: Option<Arc<dyn SourceTransport>>,
    events: Vec<Event>,
    completion: Option<(OpenCompletion, bool, String)>,
    probe_report: Option<(ProbeReport, bool, u32)>,
    list_report: Option<(ListReport, Vec<Interface>, u32)>,
}

pub struct CaptureSource {
    uuid: Uuid,
    driver: Arc<dyn SourceDriver>,
    definition: SourceDefinition,
    ctx: SourceContext,
    inner: Mutex<Inner>,
}

impl CaptureSource {
    pub(crate) fn new(
        driver: Arc<dyn SourceDriver>,
        definition: SourceDefinition,
        ctx: SourceContext,
    ) -> Result<Arc<Self>, CaptureError> {
        let uuid = definition.uuid()?.unwrap_or_else(Uuid::new_v4);
        let inner = Inner {
            state: SourceState::Init,
            role: SourceRole::Open,
            runtime_id: 0,
            name: definition.name().to_string(),
            interface: definition.interface().to_string(),
            channel_capable: driver.default_channel_capable(),
            channels: Vec::new(),
            hop_channels: Vec::new(),
            transaction_id: 0,
            transport: None,
            pending_writes: Vec::new(),
            child_pid: None,
            error_kind: None,
            error_reason: None,
            retriable_error: false,
            counters: SourceCounters::default(),
            completion: None,
            probe_report: None,
            list_report: None,
        };
        Ok(Arc::new(Self {
            uuid,
            driver,
            definition,
            ctx,
            inner: Mutex::new(inner),
        }))
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn runtime_id(&self) -> u32 {
        self.inner.lock().runtime_id
    }

    pub fn state(&self) -> SourceState {
        self.inner.lock().state
    }

    pub fn driver_type(&self) -> String {
        self.driver.type_tag().to_string()
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        let inner = self.inner.lock();
        SourceSnapshot {
            uuid: self.uuid,
            runtime_id: inner.runtime_id,
            definition: self.definition.raw().to_string(),
            interface: inner.interface.clone(),
            name: inner.name.clone(),
            driver_type: self.driver.type_tag().to_string(),
            channel_capable: inner.channel_capable,
            channels: inner.channels.clone(),
            hop_channels: inner.hop_channels.clone(),
            state: inner.state,
            child_pid: inner.child_pid,
            error_kind: inner.error_kind,
            error_reason: inner.error_reason.clone(),
            counters: inner.counters,
        }
    }

    pub(crate) fn set_runtime_id(&self, runtime_id: u32) {
        self.inner.lock().runtime_id = runtime_id;
    }

    pub(crate) fn set_completion(&self, completion: OpenCompletion) {
        self.inner.lock().completion = Some(completion);
    }

    pub(crate) fn take_completion(&self) -> Option<OpenCompletion> {
        self.inner.lock().completion.take()
    }

    pub(crate) fn set_probe_report(&self, report: ProbeReport) {
        self.inner.lock().probe_report = Some(report);
    }

    pub(crate) fn set_list_report(&self, report: ListReport) {
        self.inner.lock().list_report = Some(report);
    }

    /// Spawns the worker and enters the handshake. Terminal completion is
    /// reported through the callbacks set before this call.
    pub(crate) fn start(self: &Arc<Self>, role: SourceRole, transaction_id: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.state == SourceState::Closed {
                return;
            }
            inner.role = role;
            inner.transaction_id = transaction_id;
            inner.state = SourceState::Handshake;
            inner.error_kind = None;
            inner.error_reason = None;
            inner.pending_writes.clear();
        }

        let events = self.transport_events();
        match self
            .driver
            .connect(&self.definition, role, events, &self.ctx.config.capture)
        {
            Ok(transport) => {
                let fx = {
                    let mut inner = self.inner.lock();
                    let mut fx = Effects::default();
                    if inner.state == SourceState::Closed {
                        // Removed while the worker was spawning.
                        fx.close_transport = Some(transport);
                    } else {
                        inner.child_pid = transport.child_pid();
                        if !inner.pending_writes.is_empty() {
                            fx.writes = std::mem::take(&mut inner.pending_writes);
                            fx.write_via = Some(Arc::clone(&transport));
                        }
                        inner.transport = Some(transport);
                    }
                    fx
                };
                self.apply(fx);
            }
            Err(e) => {
                let fx = {
                    let mut inner = self.inner.lock();
                    let mut fx = Effects::default();
                    self.transition_error(&mut inner, &mut fx, e);
                    fx
                };
                self.apply(fx);
            }
        }
    }

    /// Tears the source down and erases it from the protocol. Idempotent.
    pub(crate) fn close(&self) {
        let fx = {
            let mut inner = self.inner.lock();
            if inner.state == SourceState::Closed {
                return;
            }
            let was_admitted = inner.runtime_id != 0;
            let mut fx = Effects::default();
            inner.state = SourceState::Closed;
            inner.child_pid = None;
            if let Some(t) = inner.transport.take() {
                fx.close_transport = Some(t);
            }
            if let Some(cb) = inner.completion.take() {
                fx.completion = Some((cb, false, "source removed".to_string()));
            }
            if let Some(cb) = inner.probe_report.take() {
                fx.probe_report = Some((cb, false, inner.transaction_id));
            }
            if let Some(cb) = inner.list_report.take() {
                fx.list_report = Some((cb, Vec::new(), inner.transaction_id));
            }
            if inner.role == SourceRole::Open && was_admitted {
                fx.events
                    .push(self.lifecycle_event(&inner, events::SOURCE_CLOSED));
            }
            fx
        };
        self.apply(fx);
    }

    /// Pokes an errored source back through `INIT` and a fresh spawn.
    pub(crate) fn retry(self: &Arc<Self>, transaction_id: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.state != SourceState::Error {
                return;
            }
            inner.counters.retries += 1;
            inner.state = SourceState::Init;
            info!(
                uuid = %self.uuid,
                attempt = inner.counters.retries,
                "retrying errored capture source"
            );
        }
        self.start(SourceRole::Open, transaction_id);
    }

    /// Whether the retry timer should pick this source up.
    pub(crate) fn is_retriable_error(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == SourceState::Error
            && inner.retriable_error
            && self.driver.retriable()
            && self.definition.retry().unwrap_or(true)
    }

    fn transport_events(self: &Arc<Self>) -> TransportEvents {
        let on_frame = {
            let weak = Arc::downgrade(self);
            Box::new(move |frame: Frame| {
                if let Some(source) = weak.upgrade() {
                    source.handle_frame(frame);
                }
            }) as Box<dyn FnMut(Frame) + Send>
        };
        let on_closed = {
            let weak = Arc::downgrade(self);
            Box::new(move |reason: CloseReason| {
                if let Some(source) = weak.upgrade() {
                    source.handle_transport_closed(reason);
                }
            }) as Box<dyn FnMut(CloseReason) + Send>
        };
        let on_stderr = {
            let weak = Arc::downgrade(self);
            Box::new(move |line: String| {
                if let Some(source) = weak.upgrade() {
                    source.handle_stderr_line(line);
                }
            }) as Box<dyn FnMut(String) + Send>
        };
        let on_exit = {
            let weak = Arc::downgrade(self);
            Box::new(move |code: Option<i32>| {
                if let Some(source) = weak.upgrade() {
                    source.handle_child_exit(code);
                }
            }) as Box<dyn FnMut(Option<i32>) + Send>
        };
        TransportEvents {
            on_frame,
            on_closed,
            on_stderr,
            on_exit,
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let fx = {
            let mut inner = self.inner.lock();
            let mut fx = Effects::default();
            self.process_frame(&mut inner, &mut fx, frame);
            fx
        };
        self.apply(fx);
    }

    fn process_frame(&self, inner: &mut Inner, fx: &mut Effects, frame: Frame) {
        inner.counters.frames += 1;
        if let Some(metrics) = &self.ctx.metrics {
            metrics.frames_received.inc();
        }

        // The worker's first frame must be HELLO; anything else fails the
        // handshake outright.
        if inner.state == SourceState::Handshake {
            if frame.frame_type == msg::HELLO {
                self.handle_hello(inner, fx, &frame);
            } else {
                self.transition_error(
                    inner,
                    fx,
                    CaptureError::Protocol(format!(
                        "expected HELLO, got {}",
                        frame.frame_type
                    )),
                );
            }
            return;
        }

        match frame.frame_type.as_str() {
            msg::PROBERESP => self.handle_probe_resp(inner, fx, &frame),
            msg::OPENRESP => self.handle_open_resp(inner, fx, &frame),
            msg::LISTRESP => self.handle_list_resp(inner, fx, &frame),
            msg::DATA => self.handle_data(inner, fx, &frame),
            msg::MESSAGE => self.handle_message(inner, fx, &frame),
            msg::ERROR => self.handle_worker_error(inner, fx, &frame),
            msg::HELLO | msg::PROBE | msg::OPEN | msg::LIST | msg::CONFIG => {
                debug!(
                    uuid = %self.uuid,
                    frame_type = %frame.frame_type,
                    state = %inner.state,
                    "unexpected frame dropped"
                );
            }
            _ => self.on_unknown_frame(&frame),
        }
    }

    /// Hook for frame types outside the protocol; the frame is dropped
    /// after this returns.
    fn on_unknown_frame(&self, frame: &Frame) {
        warn!(
            uuid = %self.uuid,
            frame_type = %frame.frame_type,
            kvs = frame.kvs.len(),
            "unknown frame type dropped"
        );
    }

    fn handle_hello(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        let version = frame.kv_str(key::VERSION).unwrap_or("?").to_string();
        let capname = frame.kv_str(key::CAPNAME).unwrap_or("?").to_string();
        debug!(
            uuid = %self.uuid,
            worker = %capname,
            version = %version,
            role = ?inner.role,
            "worker handshake complete"
        );

        let tid = inner.transaction_id;
        match inner.role {
            SourceRole::Probe => {
                inner.state = SourceState::Probing;
                self.send(
                    inner,
                    fx,
                    Frame::new(msg::PROBE)
                        .with_transaction(tid)
                        .push_str(key::DEFINITION, self.definition.raw()),
                );
            }
            SourceRole::Open => {
                inner.state = SourceState::Opening;
                self.send(
                    inner,
                    fx,
                    Frame::new(msg::OPEN)
                        .with_transaction(tid)
                        .push_str(key::DEFINITION, self.definition.raw()),
                );
            }
            SourceRole::List => {
                inner.state = SourceState::Listing;
                self.send(inner, fx, Frame::new(msg::LIST).with_transaction(tid));
            }
        }
    }

    fn handle_probe_resp(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        if inner.state != SourceState::Probing {
            debug!(uuid = %self.uuid, state = %inner.state, "PROBERESP outside probe dropped");
            return;
        }
        if frame.transaction_id != inner.transaction_id {
            debug!(
                uuid = %self.uuid,
                got = frame.transaction_id,
                want = inner.transaction_id,
                "stale PROBERESP ignored"
            );
            return;
        }

        let claimed = frame.kv_u8(key::SUCCESS).map(|v| v != 0).unwrap_or(false);
        if let Ok(channels) = frame.kv_str_list(key::CHANSET) {
            inner.channels = channels;
        }
        if let Ok(hop) = frame.kv_str_list(key::CHANHOP) {
            inner.hop_channels = hop;
        }
        trace!(
            uuid = %self.uuid,
            claimed,
            message = frame.kv_str(key::MESSAGE).unwrap_or(""),
            "probe response"
        );

        if let Some(report) = inner.probe_report.take() {
            fx.probe_report = Some((report, claimed, frame.transaction_id));
        }
        inner.state = SourceState::Closed;
        inner.child_pid = None;
        if let Some(t) = inner.transport.take() {
            fx.close_transport = Some(t);
        }
    }

    fn handle_open_resp(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        if inner.state != SourceState::Opening {
            debug!(uuid = %self.uuid, state = %inner.state, "OPENRESP outside open dropped");
            return;
        }
        if frame.transaction_id != inner.transaction_id {
            debug!(
                uuid = %self.uuid,
                got = frame.transaction_id,
                want = inner.transaction_id,
                "stale OPENRESP ignored"
            );
            return;
        }

        let success = match frame.kv_u8(key::SUCCESS) {
            Ok(v) => v != 0,
            Err(e) => {
                self.transition_error(
                    inner,
                    fx,
                    CaptureError::Protocol(format!("OPENRESP without SUCCESS: {e}")),
                );
                return;
            }
        };

        if !success {
            let reason = frame
                .kv_str(key::MESSAGE)
                .unwrap_or("worker refused open")
                .to_string();
            self.transition_error(inner, fx, CaptureError::OpenRefused(reason));
            return;
        }

        if let Ok(channels) = frame.kv_str_list(key::CHANSET) {
            inner.channels = channels;
        }
        if let Ok(reported) = frame.kv_str(key::UUID) {
            match Uuid::parse_str(reported) {
                Ok(worker_uuid) if worker_uuid != self.uuid => {
                    debug!(
                        uuid = %self.uuid,
                        worker_uuid = %worker_uuid,
                        "worker reported its own uuid, keeping tracker identity"
                    );
                }
                _ => {}
            }
        }

        inner.state = SourceState::Running;
        inner.error_kind = None;
        inner.error_reason = None;
        info!(
            uuid = %self.uuid,
            interface = %inner.interface,
            driver = self.driver.type_tag(),
            "capture source running"
        );
        if let Some(metrics) = &self.ctx.metrics {
            metrics.sources_opened.inc();
        }

        let mut event = self.lifecycle_event(inner, events::SOURCE_OPENED);
        event.attach(
            attr::DEFINITION,
            EventPayload::Text(self.definition.raw().to_string()),
        );
        fx.events.push(event);

        if let Some(cb) = inner.completion.take() {
            let detail = format!(
                "{} source '{}' opened",
                self.driver.type_tag(),
                inner.interface
            );
            fx.completion = Some((cb, true, detail));
        }

        // Push the definition's channel plan now that the device is up.
        if inner.channel_capable {
            let tid = inner.transaction_id;
            if let Some(channel) = self.definition.channel() {
                self.send(
                    inner,
                    fx,
                    Frame::new(msg::CONFIG)
                        .with_transaction(tid)
                        .push_str(key::CHANNEL, channel),
                );
            } else {
                let channels = self.definition.channels();
                if !channels.is_empty() {
                    self.send(
                        inner,
                        fx,
                        Frame::new(msg::CONFIG)
                            .with_transaction(tid)
                            .push_str_list(key::CHANHOP, &channels),
                    );
                }
            }
        }
    }

    fn handle_list_resp(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        if inner.state != SourceState::Listing {
            debug!(uuid = %self.uuid, state = %inner.state, "LISTRESP outside list dropped");
            return;
        }
        if frame.transaction_id != inner.transaction_id {
            debug!(uuid = %self.uuid, "stale LISTRESP ignored");
            return;
        }

        let interfaces = frame
            .kv_str_list(key::INTERFACES)
            .unwrap_or_default()
            .into_iter()
            .map(|name| Interface {
                name,
                driver_type: self.driver.type_tag().to_string(),
                description: self.driver.description().to_string(),
            })
            .collect::<Vec<_>>();

        if let Some(report) = inner.list_report.take() {
            fx.list_report = Some((report, interfaces, frame.transaction_id));
        }
        inner.state = SourceState::Closed;
        inner.child_pid = None;
        if let Some(t) = inner.transport.take() {
            fx.close_transport = Some(t);
        }
    }

    fn handle_data(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        if inner.state != SourceState::Running {
            debug!(uuid = %self.uuid, state = %inner.state, "DATA outside running dropped");
            return;
        }
        let Ok(packet) = frame.kv_bytes(key::PACKET) else {
            debug!(uuid = %self.uuid, "DATA without PACKET dropped");
            return;
        };

        inner.counters.packets += 1;
        if let Some(metrics) = &self.ctx.metrics {
            metrics.packets_published.inc();
        }
        trace!(
            uuid = %self.uuid,
            len = packet.len(),
            head = %hex::encode(&packet[..packet.len().min(8)]),
            "packet received"
        );

        let mut event = self.lifecycle_event(inner, events::PACKET);
        event.attach(attr::PACKET, EventPayload::Bytes(packet.clone()));
        if let Ok(signal) = frame.kv_i32(key::SIGNAL) {
            event.attach(attr::SIGNAL, EventPayload::Int(signal as i64));
        }
        if let Ok(dlt) = frame.kv_u32(key::DLT) {
            event.attach(attr::DLT, EventPayload::UInt(dlt as u64));
        }
        if let Ok(ts) = frame.kv_u64(key::TS) {
            event.attach(attr::TS, EventPayload::UInt(ts));
        }
        if let Ok(gps) = frame.kv_bytes(key::GPS) {
            event.attach(attr::GPS, EventPayload::Bytes(gps.clone()));
        }
        fx.events.push(event);
    }

    fn handle_message(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        let level = frame.kv_u8(key::LEVEL).unwrap_or(1);
        let text = frame.kv_str(key::MESSAGE).unwrap_or("").to_string();
        debug!(uuid = %self.uuid, level, message = %text, "worker message");

        inner.counters.messages += 1;
        let mut event = self.lifecycle_event(inner, events::MESSAGE);
        event.attach(attr::LEVEL, EventPayload::UInt(level as u64));
        event.attach(attr::TEXT, EventPayload::Text(text));
        fx.events.push(event);
    }

    fn handle_worker_error(&self, inner: &mut Inner, fx: &mut Effects, frame: &Frame) {
        let reason = frame
            .kv_str(key::MESSAGE)
            .unwrap_or("worker reported failure")
            .to_string();
        self.transition_error(inner, fx, CaptureError::Hardware(reason));
    }

    fn handle_transport_closed(&self, reason: CloseReason) {
        // Shutdown is the close we initiated ourselves.
        if reason == CloseReason::Shutdown {
            return;
        }
        let fx = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SourceState::Closed | SourceState::Error) {
                return;
            }
            let mut fx = Effects::default();
            let error = match reason {
                CloseReason::ProtocolError => {
                    CaptureError::Protocol("worker stream framing violation".to_string())
                }
                _ => CaptureError::ReadEof,
            };
            self.transition_error(&mut inner, &mut fx, error);
            fx
        };
        self.apply(fx);
    }

    fn handle_child_exit(&self, code: Option<i32>) {
        let fx = {
            let mut inner = self.inner.lock();
            inner.child_pid = None;
            if matches!(inner.state, SourceState::Closed | SourceState::Error) {
                return;
            }
            let mut fx = Effects::default();
            let error = match code {
                Some(0) | None => CaptureError::ReadEof,
                Some(1) => CaptureError::Protocol("worker exited: protocol error".to_string()),
                Some(2) => CaptureError::Hardware("worker exited: hardware error".to_string()),
                Some(3) => CaptureError::PermissionDenied(
                    "worker exited reporting a permission failure".to_string(),
                ),
                Some(n) => CaptureError::Hardware(format!("worker exited with status {n}")),
            };
            self.transition_error(&mut inner, &mut fx, error);
            fx
        };
        self.apply(fx);
    }

    fn handle_stderr_line(&self, line: String) {
        let fx = {
            let mut inner = self.inner.lock();
            debug!(uuid = %self.uuid, line = %line, "worker stderr");
            inner.counters.messages += 1;
            let mut fx = Effects::default();
            let mut event = self.lifecycle_event(&inner, events::MESSAGE);
            event.attach(attr::LEVEL, EventPayload::UInt(1));
            event.attach(attr::TEXT, EventPayload::Text(line));
            fx.events.push(event);
            fx
        };
        self.apply(fx);
    }

    fn transition_error(&self, inner: &mut Inner, fx: &mut Effects, error: CaptureError) {
        if inner.state == SourceState::Closed {
            return;
        }
        let kind = error.kind();
        let reason = error.to_string();
        let transient = error.is_transient();
        warn!(
            uuid = %self.uuid,
            kind,
            reason = %reason,
            role = ?inner.role,
            "capture source failed"
        );

        inner.counters.errors += 1;
        inner.child_pid = None;
        if let Some(t) = inner.transport.take() {
            fx.close_transport = Some(t);
        }
        if let Some(cb) = inner.completion.take() {
            fx.completion = Some((cb, false, reason.clone()));
        }
        if let Some(cb) = inner.probe_report.take() {
            fx.probe_report = Some((cb, false, inner.transaction_id));
        }
        if let Some(cb) = inner.list_report.take() {
            fx.list_report = Some((cb, Vec::new(), inner.transaction_id));
        }

        match inner.role {
            SourceRole::Open => {
                inner.state = SourceState::Error;
                inner.error_kind = Some(kind);
                inner.error_reason = Some(reason.clone());
                inner.retriable_error = transient;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.source_errors.inc();
                }
                let mut event = self.lifecycle_event(inner, events::SOURCE_ERROR);
                event.attach(attr::KIND, EventPayload::Text(kind.to_string()));
                event.attach(attr::REASON, EventPayload::Text(reason));
                fx.events.push(event);
            }
            // Probe and list workers are ephemeral; they just end.
            _ => inner.state = SourceState::Closed,
        }
    }

    fn lifecycle_event(&self, inner: &Inner, event_type: &str) -> Event {
        self.ctx
            .bus
            .make_event(event_type)
            .with(attr::UUID, EventPayload::Uuid(self.uuid))
            .with(attr::RUNTIME_ID, EventPayload::UInt(inner.runtime_id as u64))
            .with(attr::INTERFACE, EventPayload::Text(inner.interface.clone()))
            .with(
                attr::DRIVER_TYPE,
                EventPayload::Text(self.driver.type_tag().to_string()),
            )
    }

    /// Queues a frame for the worker; buffered if the transport handle has
    /// not landed yet.
    fn send(&self, inner: &mut Inner, fx: &mut Effects, frame: Frame) {
        match &inner.transport {
            Some(transport) => {
                if fx.write_via.is_none() {
                    fx.write_via = Some(Arc::clone(transport));
                }
                fx.writes.push(frame);
            }
            None => inner.pending_writes.push(frame),
        }
    }

    fn apply(&self, fx: Effects) {
        if let Some(transport) = &fx.write_via {
            for frame in fx.writes {
                if let Err(e) = transport.write_frame(frame) {
                    warn!(uuid = %self.uuid, error = %e, "worker write failed");
                    self.fail_write(e);
                    break;
                }
            }
        }
        if let Some(transport) = fx.close_transport {
            transport.close();
        }
        for event in fx.events {
            if self.ctx.bus.publish(event).is_err() {
                trace!(uuid = %self.uuid, "event dropped, bus shutting down");
            }
        }
        if let Some((cb, ok, detail)) = fx.completion {
            cb(ok, detail);
        }
        if let Some((cb, claimed, tid)) = fx.probe_report {
            cb(claimed, tid);
        }
        if let Some((cb, interfaces, tid)) = fx.list_report {
            cb(interfaces, tid);
        }
    }

    fn fail_write(&self, error: CaptureError) {
        let fx = {
            let mut inner = self.inner.lock();
            let mut fx = Effects::default();
            self.transition_error(&mut inner, &mut fx, error);
            fx
        };
        self.apply(fx);
    }
}

impl fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CaptureSource")
            .field("uuid", &self.uuid)
            .field("runtime_id", &inner.runtime_id)
            .field("driver", &self.driver.type_tag())
            .field("state", &inner.state)
            .finish()
    }
}
