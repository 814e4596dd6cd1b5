//! Camera error taxonomy

use thiserror::Error;

/// Errors produced by camera operations and the connection lifecycle
#[derive(Debug, Clone, Error)]
pub enum CameraError {
    /// No compatible device attached on the bus
    #[error("No camera detected")]
    DeviceNotFound,

    /// A connect attempt failed with a plain (non-timeout) cause
    #[error("Connection attempt {attempt} failed: {cause}")]
    ConnectionFailed { attempt: u32, cause: String },

    /// The device's low-level command state machine is stuck;
    /// recovery requires a bus-level reset
    #[error("Protocol timeout, device requires bus reset")]
    ProtocolTimeout,

    /// Transient bus-busy condition, retried by the access queue
    #[error("I/O in progress")]
    TransientIoBusy,

    /// A capture was requested while another is in flight
    #[error("Capture already in progress")]
    CaptureAlreadyInProgress,

    /// Configuration section/option does not exist on this device
    #[error("Unknown option {section}/{option}")]
    UnknownOption { section: String, option: String },

    /// Configuration value could not be coerced or applied
    #[error("Unsupported option {section}/{option} = {value}")]
    UnsupportedOption {
        section: String,
        option: String,
        value: String,
    },

    /// No write access to the sysfs authorized attribute
    #[error("Permission denied writing {path}")]
    ResetPermissionDenied { path: String },

    /// Automatic recovery budget exhausted; operator intervention required
    #[error("Recovery budget exhausted, manual restart required")]
    RecoveryBudgetExhausted,

    /// Operation submitted while the device is not in a usable state
    #[error("Camera not ready (state: {state})")]
    NotReady { state: String },

    /// The queue thread is gone or the reply channel was dropped
    #[error("Camera worker unavailable")]
    WorkerUnavailable,

    /// Caller-boundary await timed out; the queued operation still
    /// runs to completion on the worker thread
    #[error("Operation '{op}' timed out after {timeout_ms}ms")]
    OpTimedOut { op: &'static str, timeout_ms: u64 },
}

impl CameraError {
    /// Transient errors are retried transparently by the access queue
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::TransientIoBusy)
    }

    /// Protocol stalls escalate to the supervisor's recovery path
    pub fn is_protocol_stall(&self) -> bool {
        matches!(self, CameraError::ProtocolTimeout)
    }
}

/// Type alias for camera results
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CameraError::ConnectionFailed {
            attempt: 2,
            cause: "no answer from port".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("attempt 2"));
        assert!(msg.contains("no answer from port"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CameraError::TransientIoBusy.is_transient());
        assert!(!CameraError::ProtocolTimeout.is_transient());
        assert!(!CameraError::DeviceNotFound.is_transient());
    }

    #[test]
    fn test_stall_classification() {
        assert!(CameraError::ProtocolTimeout.is_protocol_stall());
        assert!(!CameraError::TransientIoBusy.is_protocol_stall());
    }

    #[test]
    fn test_unsupported_option_display() {
        let err = CameraError::UnsupportedOption {
            section: "settings".to_string(),
            option: "capturetarget".to_string(),
            value: "Memory card".to_string(),
        };
        assert!(format!("{}", err).contains("settings/capturetarget"));
    }
}
