//! Core value types shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an open session, unique within one [`Driver`](crate::Driver)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Index of a physical device handled by a driver
///
/// Sessions opened with the same index share the device: status events are
/// broadcast to all of them and claims are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceIndex(pub u32);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Identifier assigned to asynchronous output commands
///
/// Reported back in the matching
/// [`OutputCompleteEvent`](crate::event::OutputCompleteEvent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId(pub i32);

impl OutputId {
    /// Id following `self`; wraps to zero at `i32::MAX`
    pub fn next(self) -> OutputId {
        OutputId((self.0 + 1) % i32::MAX)
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Closed,
    Idle,
    Busy,
    Error,
}

/// Where an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLocus {
    /// Output command failed
    Output,
    /// Input failed, no buffered input data remains
    Input,
    /// Input failed while input data is still buffered
    InputData,
}

impl ErrorLocus {
    /// Response applied when the application does not choose one
    pub fn default_response(self) -> ErrorResponse {
        match self {
            ErrorLocus::Output => ErrorResponse::Retry,
            ErrorLocus::Input => ErrorResponse::Clear,
            ErrorLocus::InputData => ErrorResponse::ContinueInput,
        }
    }

    /// Whether errors of this locus travel on the output channel
    pub fn is_output(self) -> bool {
        self == ErrorLocus::Output
    }
}

/// What happens after an error event has been delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorResponse {
    Retry,
    Clear,
    ContinueInput,
}

/// Power state reported by sessions with power notification enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    Unknown,
    Online,
    Off,
    Offline,
    OffOffline,
}

/// How sessions may share a physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusivity {
    /// Must be claimed before it can be enabled
    Exclusive,
    /// Can be claimed, but enabling does not require it
    Allowed,
    /// Cannot be claimed at all
    Shareable,
}

/// Partition a command belongs to for clear and retry operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Carries no output id, never produces an output complete event and
    /// reports input locus errors
    Input,
    Output,
}

impl CommandKind {
    pub fn error_locus(self) -> ErrorLocus {
        match self {
            CommandKind::Input => ErrorLocus::Input,
            CommandKind::Output => ErrorLocus::Output,
        }
    }
}

/// Well-known status values carried by status update events
pub mod status {
    pub const POWER_ONLINE: i32 = 2001;
    pub const POWER_OFF: i32 = 2002;
    pub const POWER_OFFLINE: i32 = 2003;
    pub const POWER_OFF_OFFLINE: i32 = 2004;

    /// Firmware update progress, `UPDATE_FIRMWARE_PROGRESS + percent`
    pub const UPDATE_FIRMWARE_PROGRESS: i32 = 2100;
    pub const UPDATE_FIRMWARE_COMPLETE: i32 = 2200;
    pub const UPDATE_FIRMWARE_FAILED_DEVICE_OK: i32 = 2201;
    pub const UPDATE_FIRMWARE_FAILED_DEVICE_UNRECOVERABLE: i32 = 2202;
    pub const UPDATE_FIRMWARE_FAILED_DEVICE_NEEDS_FIRMWARE: i32 = 2203;
    pub const UPDATE_FIRMWARE_FAILED_DEVICE_UNKNOWN: i32 = 2204;
    pub const UPDATE_FIRMWARE_COMPLETE_DEVICE_NOT_RESTORED: i32 = 2205;

    /// Power statuses
    pub fn is_power(status: i32) -> bool {
        (POWER_ONLINE..=POWER_OFF_OFFLINE).contains(&status)
    }

    /// Firmware update progress and result statuses
    pub fn is_firmware(status: i32) -> bool {
        (UPDATE_FIRMWARE_PROGRESS..UPDATE_FIRMWARE_PROGRESS + 100).contains(&status)
            || (UPDATE_FIRMWARE_COMPLETE..=UPDATE_FIRMWARE_COMPLETE_DEVICE_NOT_RESTORED)
                .contains(&status)
    }
}
