//! # lyssna-core
//!
//! Foundation layer for the capture-source management core: the in-process
//! event bus that decouples producers from listeners, and the timer service
//! that drives retries and deadlines.
//!
//! ### Key Submodules:
//! - `events`: channel-keyed publish/subscribe with a single dispatcher thread
//! - `time`: one timer thread multiplexing periodic and one-shot timers
//!
//! Nothing here is global: callers construct the bus and timer once and hand
//! references to the components that need them.

pub mod events;
pub mod time;

pub mod prelude {
    pub use crate::events::bus::EventBus;
    pub use crate::events::{Event, EventPayload};
    pub use crate::time::TimerService;
}
