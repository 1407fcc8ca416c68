//! Driver capability trait.
//!
//! A driver is the prototype for one kind of capture backend. It answers
//! probes ("is this definition mine?"), lists interfaces it could open, and
//! supplies the transport a live source talks to its worker through. Drivers
//! are registered once at startup and are immutable afterwards.

use std::path::Path;
use std::sync::Arc;

use lyssna_config::CaptureConfig;
use lyssna_proto::endpoint::CloseReason;
use lyssna_proto::Frame;

use crate::definition::SourceDefinition;
use crate::error::CaptureError;
use crate::ipc::IpcTransport;

/// Answer to an in-process probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The definition is ours; skip every other driver.
    Claim,
    /// Definitely not ours.
    Decline,
    /// Can't tell without spawning a worker.
    RequireIpc,
}

/// Answer to an in-process interface list.
#[derive(Clone, Debug)]
pub enum ListOutcome {
    Interfaces(Vec<Interface>),
    RequireIpc,
}

/// One listable capture interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub driver_type: String,
    pub description: String,
}

/// Roles a capture worker can be spawned in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceRole {
    Probe,
    Open,
    List,
}

/// Callbacks a transport uses to reach its owning source. Each callback may
/// be invoked from a transport-owned thread.
pub struct TransportEvents {
    pub on_frame: Box<dyn FnMut(Frame) + Send>,
    pub on_closed: Box<dyn FnMut(CloseReason) + Send>,
    pub on_stderr: Box<dyn FnMut(String) + Send>,
    pub on_exit: Box<dyn FnMut(Option<i32>) + Send>,
}

/// Live frame channel to one capture worker.
pub trait SourceTransport: Send + Sync {
    fn write_frame(&self, frame: Frame) -> Result<(), CaptureError>;

    /// Begins teardown. Asynchronous with respect to the worker's actual
    /// exit; callers must not assume the child is reaped on return.
    fn close(&self);

    fn child_pid(&self) -> Option<u32>;
}

/// A registered capture backend.
pub trait SourceDriver: Send + Sync {
    /// Short tag matched against the definition's `type=` option.
    fn type_tag(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether probing requires spawning a worker.
    fn probe_requires_ipc(&self) -> bool;

    /// Whether listing requires spawning a worker.
    fn list_requires_ipc(&self) -> bool;

    /// Whether sources of this kind can tune channels at all.
    fn default_channel_capable(&self) -> bool {
        true
    }

    /// Whether errored sources of this kind go back through the retry
    /// timer.
    fn retriable(&self) -> bool {
        true
    }

    /// Capture worker executable for IPC roles.
    fn executable(&self) -> Option<&Path> {
        None
    }

    /// In-process probe. The default defers to IPC when the driver says
    /// probing needs a worker, and declines otherwise.
    fn probe(&self, definition: &SourceDefinition) -> ProbeOutcome {
        let _ = definition;
        if self.probe_requires_ipc() {
            ProbeOutcome::RequireIpc
        } else {
            ProbeOutcome::Decline
        }
    }

    /// In-process interface list, same shape as [`probe`](Self::probe).
    fn list(&self) -> ListOutcome {
        if self.list_requires_ipc() {
            ListOutcome::RequireIpc
        } else {
            ListOutcome::Interfaces(Vec::new())
        }
    }

    /// Connects a transport for `definition` in `role`. The default spawns
    /// the driver's worker executable over stdio.
    fn connect(
        &self,
        definition: &SourceDefinition,
        role: SourceRole,
        events: TransportEvents,
        config: &CaptureConfig,
    ) -> Result<Arc<dyn SourceTransport>, CaptureError> {
        let _ = (definition, role);
        let executable = self.executable().ok_or_else(|| CaptureError::Spawn {
            command: self.type_tag().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "driver has no worker executable",
            ),
        })?;
        let transport = IpcTransport::spawn(executable, events, config)?;
        Ok(transport)
    }
}
