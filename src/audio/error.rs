// Error definitions for the audio coordination layer
//
// Hardware failures carry a numeric host error code so the stream manager can tell
// transient conditions (which empirically clear on retry) from everything else.

use super::types::{Direction, StreamId};

/// Host reports the device as temporarily unavailable
pub const DEVICE_UNAVAILABLE: i32 = -9985;
/// Host-internal failure, typically while a device is being re-plumbed
pub const INTERNAL_HOST_ERROR: i32 = -9986;
/// Any failure without a more specific host code
pub const UNSPECIFIED_HOST_ERROR: i32 = -9999;
/// Native device-change subscription cannot be registered
pub const SUBSCRIPTION_UNAVAILABLE: i32 = -10001;

/// Codes treated as transient unless configuration says otherwise
pub const DEFAULT_TRANSIENT_CODES: [i32; 2] = [DEVICE_UNAVAILABLE, INTERNAL_HOST_ERROR];

/// Failure reported by an `AudioHardware` backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} [host error {code}]")]
pub struct HardwareError {
    pub code: i32,
    pub message: String,
}

impl HardwareError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::new(DEVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_HOST_ERROR, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(UNSPECIFIED_HOST_ERROR, message)
    }

    pub fn subscription_unavailable(message: impl Into<String>) -> Self {
        Self::new(SUBSCRIPTION_UNAVAILABLE, message)
    }

    /// Whether the code is one of the given transient codes
    pub fn is_transient_in(&self, transient_codes: &[i32]) -> bool {
        transient_codes.contains(&self.code)
    }
}

/// Errors surfaced by the stream lifecycle manager
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{direction} already has an active stream ({active})")]
    DirectionOccupied { direction: Direction, active: StreamId },

    #[error("{stream} is not the active {direction} stream")]
    StaleHandle { direction: Direction, stream: StreamId },

    #[error("{stream} on {direction} did not confirm inactive within {waited_ms} ms")]
    CloseUnconfirmed {
        direction: Direction,
        stream: StreamId,
        waited_ms: u64,
    },

    #[error("Device '{device_id}' is not present for {direction}")]
    DeviceNotPresent { direction: Direction, device_id: String },

    #[error("Failed to open stream on '{device_id}' after {attempts} attempts: {last_error}")]
    Exhausted {
        device_id: String,
        attempts: u32,
        last_error: HardwareError,
    },

    #[error("Switch to '{device_id}' failed after {attempts} attempts: {last_error} (previous stream restored: {restored})")]
    SwitchFailed {
        device_id: String,
        attempts: u32,
        last_error: HardwareError,
        restored: bool,
    },

    #[error("System error: {0}")]
    System(#[from] anyhow::Error),
}

impl StreamError {
    /// Attempt count for failures that went through the retry loop
    pub fn attempts(&self) -> Option<u32> {
        match self {
            StreamError::Exhausted { attempts, .. } | StreamError::SwitchFailed { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Last hardware error for failures that went through the retry loop
    pub fn last_error(&self) -> Option<&HardwareError> {
        match self {
            StreamError::Exhausted { last_error, .. }
            | StreamError::SwitchFailed { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// Configuration problems
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}
