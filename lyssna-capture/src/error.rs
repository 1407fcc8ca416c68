//! Capture error taxonomy.
//!
//! Errors split by recoverability: transient failures send a source through
//! the retry timer, permanent ones park it in `ERROR` until removed, and
//! operational mistakes surface synchronously from tracker calls.

use thiserror::Error;
use uuid::Uuid;

use lyssna_proto::EndpointError;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to spawn capture worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker stream ended")]
    ReadEof,

    #[error("worker stream rejected writes")]
    WriteEof,

    #[error("hardware failure: {0}")]
    Hardware(String),

    #[error("worker refused open: {0}")]
    OpenRefused(String),

    #[error("timeout")]
    Timeout,

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed source definition: {0}")]
    BadDefinition(String),

    #[error("source not found")]
    NotFound,

    #[error("a source with uuid {0} already exists")]
    DuplicateUuid(Uuid),

    #[error("no driver of type '{0}' registered")]
    UnknownDriver(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl CaptureError {
    /// Short machine-readable tag, carried on `SOURCE_ERROR` events.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Spawn { .. } => "spawn_failed",
            CaptureError::ReadEof => "read_eof",
            CaptureError::WriteEof => "write_eof",
            CaptureError::Hardware(_) => "hardware_transient",
            CaptureError::OpenRefused(_) => "open_refused",
            CaptureError::Timeout => "timeout",
            CaptureError::Protocol(_) => "protocol_error",
            CaptureError::PermissionDenied(_) => "permission_denied",
            CaptureError::BadDefinition(_) => "bad_definition",
            CaptureError::NotFound => "not_found",
            CaptureError::DuplicateUuid(_) => "duplicate_uuid",
            CaptureError::UnknownDriver(_) => "unknown_driver",
            CaptureError::Endpoint(_) => "write_eof",
        }
    }

    /// Whether a source failing with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Spawn { .. }
                | CaptureError::ReadEof
                | CaptureError::WriteEof
                | CaptureError::Hardware(_)
                | CaptureError::OpenRefused(_)
                | CaptureError::Timeout
                | CaptureError::Endpoint(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_split() {
        assert!(CaptureError::ReadEof.is_transient());
        assert!(CaptureError::Hardware("usb gone".into()).is_transient());
        assert!(CaptureError::OpenRefused("device busy".into()).is_transient());
        assert!(CaptureError::Timeout.is_transient());
        assert!(!CaptureError::Protocol("bad frame".into()).is_transient());
        assert!(!CaptureError::PermissionDenied("wlan0".into()).is_transient());
        assert!(!CaptureError::BadDefinition("empty".into()).is_transient());
    }

    #[test]
    fn kinds_are_stable_tags() {
        assert_eq!(CaptureError::ReadEof.kind(), "read_eof");
        assert_eq!(CaptureError::Timeout.kind(), "timeout");
        assert_eq!(
            CaptureError::Protocol("x".into()).kind(),
            "protocol_error"
        );
        assert_eq!(
            CaptureError::UnknownDriver("sdr".into()).kind(),
            "unknown_driver"
        );
    }
}
