use derive_more::Display;

use crate::DeviceId;

/// Errors returned by scheduler operations.
#[derive(Debug, Display)]
pub enum SchedError {
    /// The device is being deregistered or is not registered anymore.
    #[display("device {device} has been withdrawn")]
    DeviceWithdrawn { device: DeviceId },
    /// A device with the same id is already registered.
    #[display("device {device} is already registered")]
    DuplicateDevice { device: DeviceId },
    /// No device with this id is registered.
    #[display("device {device} is not registered")]
    UnknownDevice { device: DeviceId },
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
    /// A dispatcher or balancer task could not be started or joined.
    #[display("background task failed: {reason}")]
    TaskFailed { reason: String },
}

impl core::error::Error for SchedError {}

impl SchedError {
    pub fn withdrawn(device: DeviceId) -> Self {
        Self::DeviceWithdrawn { device }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn task_failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            reason: reason.into(),
        }
    }
}

/// Per-request failure delivered through a [`Completion`](crate::Completion).
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum IoError {
    /// The request was still queued when its device was deregistered.
    #[display("device {device} withdrawn")]
    DeviceWithdrawn { device: DeviceId },
    /// The device failed this request.
    #[display("device error: {reason}")]
    Device { reason: String },
}

impl core::error::Error for IoError {}

impl IoError {
    pub fn device(reason: impl Into<String>) -> Self {
        Self::Device {
            reason: reason.into(),
        }
    }
}
