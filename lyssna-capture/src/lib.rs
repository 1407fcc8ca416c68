//! # lyssna-capture
//!
//! Capture-source management: the registry and supervisor for heterogeneous
//! packet-capture drivers and the live capture workers they spawn.
//!
//! A textual definition such as `wlan0` or `wlan0:type=wifi,channels="1,6,11"`
//! resolves to a driver either directly (`type=`) or by racing every
//! registered driver's probe. The winning driver's worker runs out of
//! process, speaking the framed protocol from `lyssna-proto` over its stdio;
//! lifecycle and packet events flow to the rest of the system through the
//! `lyssna-core` event bus.
//!
//! ### Key Submodules:
//! - `definition`: source definition syntax
//! - `driver`: driver capability trait and transport seam
//! - `ipc`: out-of-process worker transport with staged teardown
//! - `source`: per-source protocol state machine
//! - `probe` / `list`: time-bounded races across drivers
//! - `tracker`: the registry tying it all together

pub mod definition;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod list;
pub mod probe;
pub mod source;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testkit;

pub use definition::SourceDefinition;
pub use driver::{
    Interface, ListOutcome, ProbeOutcome, SourceDriver, SourceRole, SourceTransport,
    TransportEvents,
};
pub use error::CaptureError;
pub use list::ListCompletion;
pub use source::{
    CaptureSource, OpenCompletion, SourceContext, SourceCounters, SourceSnapshot, SourceState,
};
pub use tracker::{SourceTracker, SourceWorker};

/// Event types and attachment names published on the bus.
pub mod events {
    pub const SOURCE_OPENED: &str = "SOURCE_OPENED";
    pub const SOURCE_ERROR: &str = "SOURCE_ERROR";
    pub const SOURCE_CLOSED: &str = "SOURCE_CLOSED";
    pub const PACKET: &str = "PACKET";
    pub const MESSAGE: &str = "MESSAGE";

    /// Attachment names carried by the events above.
    pub mod attr {
        pub const UUID: &str = "uuid";
        pub const RUNTIME_ID: &str = "runtime_id";
        pub const DEFINITION: &str = "definition";
        pub const INTERFACE: &str = "interface";
        pub const DRIVER_TYPE: &str = "driver_type";
        pub const KIND: &str = "kind";
        pub const REASON: &str = "reason";
        pub const PACKET: &str = "packet";
        pub const SIGNAL: &str = "signal";
        pub const DLT: &str = "dlt";
        pub const TS: &str = "ts";
        pub const GPS: &str = "gps";
        pub const LEVEL: &str = "level";
        pub const TEXT: &str = "text";
    }
}
