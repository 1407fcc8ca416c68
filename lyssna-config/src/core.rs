//! Core system configuration: event bus and timer behavior.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Core system configuration parameters.
#[derive(Debug, Default, Serialize, Deserialize, Validate, Clone)]
pub struct CoreConfig {
    /// Event bus tuning.
    #[validate(nested)]
    pub event_bus: EventBusConfig,
}

/// Event bus tuning.
///
/// The dispatch queue is unbounded; the watermark only controls when a
/// deep queue starts being reported.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct EventBusConfig {
    /// Queue depth above which publishing logs a warning.
    #[serde(default = "default_queue_watermark")]
    #[validate(range(min = 64, max = 1_048_576))]
    pub queue_watermark: usize,
}

fn default_queue_watermark() -> usize {
    4096
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_watermark: default_queue_watermark(),
        }
    }
}
