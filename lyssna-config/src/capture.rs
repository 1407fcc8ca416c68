//! Capture-source management parameters: probe/list deadlines, error
//! retry cadence, worker teardown grace, and endpoint buffer sizing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct CaptureConfig {
    /// Deadline for an auto-type probe race, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub probe_timeout_secs: u64,

    /// Deadline for an interface list sweep, in seconds.
    #[serde(default = "default_list_timeout_secs")]
    #[validate(range(min = 1, max = 60))]
    pub list_timeout_secs: u64,

    /// Cadence of the errored-source retry timer, in seconds.
    #[serde(default = "default_retry_interval_secs")]
    #[validate(range(min = 1, max = 600))]
    pub retry_interval_secs: u64,

    /// Whether errored sources are retried at all.
    #[serde(default = "default_true")]
    pub retry_on_error: bool,

    /// Grace between SIGTERM and SIGKILL when tearing a worker down,
    /// in seconds.
    #[serde(default = "default_kill_grace_secs")]
    #[validate(range(min = 1, max = 30))]
    pub kill_grace_secs: u64,

    /// Per-worker stream buffer sizing.
    #[validate(nested)]
    #[serde(default)]
    pub endpoint: EndpointBufferConfig,
}

/// Ring-buffer sizing for one worker endpoint.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct EndpointBufferConfig {
    /// Cap on unconsumed inbound bytes.
    #[serde(default = "default_inbound_bytes")]
    #[validate(range(min = 4096, max = 16_777_216))]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub inbound_bytes: usize,

    /// Cap on serialized-but-unsent outbound bytes.
    #[serde(default = "default_outbound_bytes")]
    #[validate(range(min = 4096, max = 16_777_216))]
    #[validate(custom(function = validation::validate_power_of_two))]
    pub outbound_bytes: usize,
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_list_timeout_secs() -> u64 {
    5
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_kill_grace_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_inbound_bytes() -> usize {
    512 * 1024
}

fn default_outbound_bytes() -> usize {
    256 * 1024
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
            list_timeout_secs: default_list_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_on_error: default_true(),
            kill_grace_secs: default_kill_grace_secs(),
            endpoint: EndpointBufferConfig::default(),
        }
    }
}

impl Default for EndpointBufferConfig {
    fn default() -> Self {
        Self {
            inbound_bytes: default_inbound_bytes(),
            outbound_bytes: default_outbound_bytes(),
        }
    }
}

impl CaptureConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
