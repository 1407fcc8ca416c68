//! Scripted drivers and transports for exercising the tracker, probe
//! races, and source state machine without real capture hardware.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use lyssna_config::LyssnaConfig;
use lyssna_core::events::bus::EventBus;
use lyssna_core::events::EventPayload;
use lyssna_core::time::TimerService;
use lyssna_proto::frame::{key, msg};
use lyssna_proto::Frame;

use crate::definition::SourceDefinition;
use crate::driver::{
    Interface, ListOutcome, ProbeOutcome, SourceDriver, SourceRole, SourceTransport,
    TransportEvents,
};
use crate::error::CaptureError;
use crate::events::attr;
use crate::source::SourceContext;

/// One step of a scripted worker conversation.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Hello,
    /// Violates the handshake by leading with a non-HELLO frame.
    BadHello,
    Delay(u64),
    /// Blocks until the host's next request frame; remembers its
    /// transaction id for subsequent responses.
    AwaitRequest,
    ProbeResp { ok: bool },
    OpenResp { ok: bool, message: String },
    OpenRespStaleTid,
    ListResp(Vec<String>),
    Data(Vec<u8>),
    ErrorFrame(String),
    ExitCode(i32),
}

pub(crate) fn open_ok_script() -> Vec<Step> {
    vec![
        Step::Hello,
        Step::AwaitRequest,
        Step::OpenResp {
            ok: true,
            message: "ok".into(),
        },
    ]
}

/// A driver whose workers follow a fixed script per role.
pub(crate) struct ScriptedDriver {
    tag: String,
    probe_ipc: bool,
    inproc_probe: ProbeOutcome,
    probe_script: Vec<Step>,
    open_scripts: Mutex<VecDeque<Vec<Step>>>,
    default_open_script: Vec<Step>,
    list_ipc: bool,
    inproc_list: Vec<Interface>,
    list_script: Vec<Step>,
    /// Every frame the host wrote, across all workers of this driver.
    pub(crate) host_frames: Arc<Mutex<Vec<Frame>>>,
}

impl ScriptedDriver {
    pub(crate) fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            probe_ipc: false,
            inproc_probe: ProbeOutcome::Decline,
            probe_script: Vec::new(),
            open_scripts: Mutex::new(VecDeque::new()),
            default_open_script: open_ok_script(),
            list_ipc: false,
            inproc_list: Vec::new(),
            list_script: Vec::new(),
            host_frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Probe over IPC, answering after `delay_ms`.
    pub(crate) fn probe_ipc(mut self, delay_ms: u64, claim: bool) -> Self {
        self.probe_ipc = true;
        self.probe_script = vec![
            Step::Hello,
            Step::AwaitRequest,
            Step::Delay(delay_ms),
            Step::ProbeResp { ok: claim },
        ];
        self
    }

    /// Probe over IPC but never answer.
    pub(crate) fn probe_silent(mut self) -> Self {
        self.probe_ipc = true;
        self.probe_script = vec![Step::Hello, Step::AwaitRequest];
        self
    }

    pub(crate) fn probe_inproc(mut self, outcome: ProbeOutcome) -> Self {
        self.probe_ipc = false;
        self.inproc_probe = outcome;
        self
    }

    /// Queue a one-off script for the next open attempt; later attempts
    /// fall back to the default successful open.
    pub(crate) fn next_open(self, steps: Vec<Step>) -> Self {
        self.open_scripts.lock().push_back(steps);
        self
    }

    pub(crate) fn open_script(mut self, steps: Vec<Step>) -> Self {
        self.default_open_script = steps;
        self
    }

    pub(crate) fn list_inproc(mut self, interfaces: Vec<Interface>) -> Self {
        self.list_ipc = false;
        self.inproc_list = interfaces;
        self
    }

    pub(crate) fn list_ipc(mut self, names: Vec<String>) -> Self {
        self.list_ipc = true;
        self.list_script = vec![Step::Hello, Step::AwaitRequest, Step::ListResp(names)];
        self
    }

    pub(crate) fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl SourceDriver for ScriptedDriver {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    fn probe_requires_ipc(&self) -> bool {
        self.probe_ipc
    }

    fn list_requires_ipc(&self) -> bool {
        self.list_ipc
    }

    fn probe(&self, _definition: &SourceDefinition) -> ProbeOutcome {
        if self.probe_ipc {
            ProbeOutcome::RequireIpc
        } else {
            self.inproc_probe
        }
    }

    fn list(&self) -> ListOutcome {
        if self.list_ipc {
            ListOutcome::RequireIpc
        } else {
            ListOutcome::Interfaces(self.inproc_list.clone())
        }
    }

    fn connect(
        &self,
        _definition: &SourceDefinition,
        role: SourceRole,
        events: TransportEvents,
        _config: &lyssna_config::CaptureConfig,
    ) -> Result<Arc<dyn SourceTransport>, CaptureError> {
        let script = match role {
            SourceRole::Probe => self.probe_script.clone(),
            SourceRole::List => self.list_script.clone(),
            SourceRole::Open => self
                .open_scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default_open_script.clone()),
        };
        Ok(ScriptedTransport::launch(
            script,
            events,
            Arc::clone(&self.host_frames),
        ))
    }
}

struct InboxState {
    queue: VecDeque<Frame>,
    closed: bool,
}

struct Inbox {
    state: Mutex<InboxState>,
    cv: Condvar,
}

impl Inbox {
    fn push(&self, frame: Frame) {
        self.state.lock().queue.push_back(frame);
        self.cv.notify_all();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cv.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn pop_wait(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.queue.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    fn wait_closed(&self) {
        let mut state = self.state.lock();
        while !state.closed {
            self.cv.wait(&mut state);
        }
    }
}

/// In-process stand-in for a worker transport, driven by a [`Step`] script
/// on its own thread.
pub(crate) struct ScriptedTransport {
    inbox: Arc<Inbox>,
    host_frames: Arc<Mutex<Vec<Frame>>>,
}

impl ScriptedTransport {
    fn launch(
        script: Vec<Step>,
        events: TransportEvents,
        host_frames: Arc<Mutex<Vec<Frame>>>,
    ) -> Arc<dyn SourceTransport> {
        let inbox = Arc::new(Inbox {
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        });

        let TransportEvents {
            mut on_frame,
            on_closed: _,
            on_stderr: _,
            mut on_exit,
        } = events;

        let thread_inbox = Arc::clone(&inbox);
        std::thread::Builder::new()
            .name("scripted-worker".into())
            .spawn(move || {
                let mut tid = 0u32;
                for step in script {
                    if thread_inbox.is_closed() {
                        return;
                    }
                    match step {
                        Step::Hello => on_frame(
                            Frame::new(msg::HELLO)
                                .push_str(key::VERSION, "2.0")
                                .push_str(key::CAPNAME, "scripted"),
                        ),
                        Step::BadHello => on_frame(Frame::new(msg::DATA)),
                        Step::Delay(ms) => std::thread::sleep(Duration::from_millis(ms)),
                        Step::AwaitRequest => match thread_inbox.pop_wait() {
                            Some(frame) => tid = frame.transaction_id,
                            None => return,
                        },
                        Step::ProbeResp { ok } => {
                            let mut frame = Frame::new(msg::PROBERESP)
                                .with_transaction(tid)
                                .push_u8(key::SUCCESS, ok as u8)
                                .push_str(key::MESSAGE, if ok { "claimed" } else { "not ours" });
                            if ok {
                                frame = frame
                                    .push_str_list(key::CHANSET, &["1", "6", "11"])
                                    .push_str_list(key::CHANHOP, &["1", "6"]);
                            }
                            on_frame(frame);
                        }
                        Step::OpenResp { ok, message } => {
                            let mut frame = Frame::new(msg::OPENRESP)
                                .with_transaction(tid)
                                .push_u8(key::SUCCESS, ok as u8)
                                .push_str(key::MESSAGE, &message);
                            if ok {
                                frame = frame
                                    .push_str(key::UUID, &Uuid::new_v4().to_string())
                                    .push_str_list(key::CHANSET, &["1", "6", "11"]);
                            }
                            on_frame(frame);
                        }
                        Step::OpenRespStaleTid => on_frame(
                            Frame::new(msg::OPENRESP)
                                .with_transaction(tid.wrapping_add(999))
                                .push_u8(key::SUCCESS, 0)
                                .push_str(key::MESSAGE, "stale"),
                        ),
                        Step::ListResp(names) => on_frame(
                            Frame::new(msg::LISTRESP)
                                .with_transaction(tid)
                                .push_str_list(key::INTERFACES, &names),
                        ),
                        Step::Data(payload) => on_frame(
                            Frame::new(msg::DATA)
                                .push_kv(key::PACKET, Bytes::from(payload))
                                .push_i32(key::SIGNAL, -42)
                                .push_u32(key::DLT, 127)
                                .push_u64(key::TS, 1_700_000_000),
                        ),
                        Step::ErrorFrame(message) => {
                            on_frame(Frame::new(msg::ERROR).push_str(key::MESSAGE, &message))
                        }
                        Step::ExitCode(code) => {
                            on_exit(Some(code));
                            return;
                        }
                    }
                }
                thread_inbox.wait_closed();
                on_exit(Some(0));
            })
            .expect("failed to spawn scripted worker");

        Arc::new(Self { inbox, host_frames })
    }
}

impl SourceTransport for ScriptedTransport {
    fn write_frame(&self, frame: Frame) -> Result<(), CaptureError> {
        self.host_frames.lock().push(frame.clone());
        self.inbox.push(frame);
        Ok(())
    }

    fn close(&self) {
        self.inbox.close();
    }

    fn child_pid(&self) -> Option<u32> {
        None
    }
}

/// Context with a fresh bus and the given capture timings.
pub(crate) fn test_context(config: LyssnaConfig) -> SourceContext {
    SourceContext {
        bus: Arc::new(EventBus::new()),
        config: Arc::new(config),
        metrics: None,
    }
}

/// Config with second-granularity timings tightened for tests.
pub(crate) fn fast_config() -> LyssnaConfig {
    let mut config = LyssnaConfig::default();
    config.capture.probe_timeout_secs = 1;
    config.capture.list_timeout_secs = 1;
    config.capture.retry_interval_secs = 1;
    config
}

pub(crate) fn fresh_timer() -> Arc<TimerService> {
    Arc::new(TimerService::new())
}

/// Watches bus channels, forwarding `(event_type, uuid)` pairs.
pub(crate) fn watch_events(
    bus: &EventBus,
    channels: &[&str],
) -> mpsc::Receiver<(String, Option<Uuid>)> {
    let (tx, rx) = mpsc::channel();
    bus.register_listener(
        channels,
        Box::new(move |event| {
            let uuid = event.get(attr::UUID).and_then(EventPayload::as_uuid);
            let _ = tx.send((event.event_type().to_string(), uuid));
        }),
    );
    rx
}

pub(crate) fn recv_event(
    rx: &mpsc::Receiver<(String, Option<Uuid>)>,
    what: &str,
) -> (String, Option<Uuid>) {
    rx.recv_timeout(Duration::from_secs(5))
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
