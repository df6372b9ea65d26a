//! Device error types
//!
//! Every failing engine or device-class operation reports a [`DeviceError`].
//! The numeric codes match the UPOS `E_*` result codes so that logs and
//! delivered [`ErrorEvent`](crate::event::ErrorEvent)s can be correlated with
//! vendor documentation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result code of a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Closed,
    Claimed,
    NotClaimed,
    NoService,
    Disabled,
    Illegal,
    NoHardware,
    Offline,
    NoExist,
    Exists,
    Failure,
    Timeout,
    Busy,
    /// Device-class specific condition, see [`DeviceError::extended`]
    Extended,
}

impl ErrorCode {
    /// UPOS numeric value of this code
    pub fn value(self) -> i32 {
        match self {
            ErrorCode::Closed => 101,
            ErrorCode::Claimed => 102,
            ErrorCode::NotClaimed => 103,
            ErrorCode::NoService => 104,
            ErrorCode::Disabled => 105,
            ErrorCode::Illegal => 106,
            ErrorCode::NoHardware => 107,
            ErrorCode::Offline => 108,
            ErrorCode::NoExist => 109,
            ErrorCode::Exists => 110,
            ErrorCode::Failure => 111,
            ErrorCode::Timeout => 112,
            ErrorCode::Busy => 113,
            ErrorCode::Extended => 114,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Closed => "closed",
            ErrorCode::Claimed => "claimed",
            ErrorCode::NotClaimed => "not claimed",
            ErrorCode::NoService => "no service",
            ErrorCode::Disabled => "disabled",
            ErrorCode::Illegal => "illegal",
            ErrorCode::NoHardware => "no hardware",
            ErrorCode::Offline => "offline",
            ErrorCode::NoExist => "no exist",
            ErrorCode::Exists => "exists",
            ErrorCode::Failure => "failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Busy => "busy",
            ErrorCode::Extended => "extended",
        };
        write!(f, "{} ({})", name, self.value())
    }
}

/// Error raised by an engine or device-class operation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct DeviceError {
    pub code: ErrorCode,
    /// Class specific detail, meaningful for [`ErrorCode::Extended`] and for
    /// some classes also with other codes. Zero when unused.
    pub extended: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            extended: 0,
            message: message.into(),
        }
    }

    /// Create an [`ErrorCode::Extended`] error
    pub fn extended(extended: i32, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Extended,
            extended,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failure, message)
    }

    pub fn illegal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Illegal, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Closed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Attach an extended code to an existing error
    pub fn with_extended(mut self, extended: i32) -> Self {
        self.extended = extended;
        self
    }
}

impl From<common::Error> for DeviceError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Closed => DeviceError::new(ErrorCode::Offline, err.to_string()),
            common::Error::Timeout(_) => DeviceError::timeout(err.to_string()),
            _ => DeviceError::failure(err.to_string()),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Fail with `code` when `condition` holds
///
/// Mirrors the validation style of device-class setters:
/// `check(!claimed, ErrorCode::NotClaimed, "Device not claimed")?`.
pub fn check(condition: bool, code: ErrorCode, message: &str) -> Result<()> {
    if condition {
        Err(DeviceError::new(code, message))
    } else {
        Ok(())
    }
}

/// Like [`check`], for class specific conditions
pub fn check_extended(condition: bool, extended: i32, message: &str) -> Result<()> {
    if condition {
        Err(DeviceError::extended(extended, message))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_code() {
        let err = DeviceError::new(ErrorCode::NotClaimed, "Device not claimed");
        assert_eq!(err.to_string(), "not claimed (103): Device not claimed");
    }

    #[test]
    fn test_check() {
        assert!(check(false, ErrorCode::Illegal, "ok").is_ok());
        let err = check(true, ErrorCode::Disabled, "Device disabled").unwrap_err();
        assert_eq!(err.code, ErrorCode::Disabled);
        assert_eq!(err.extended, 0);
    }

    #[test]
    fn test_extended() {
        let err = check_extended(true, 203, "Cover open").unwrap_err();
        assert_eq!(err.code, ErrorCode::Extended);
        assert_eq!(err.extended, 203);
        assert_eq!(ErrorCode::Extended.value(), 114);
    }

    #[test]
    fn test_from_transport_error() {
        let err: DeviceError = common::Error::Closed.into();
        assert_eq!(err.code, ErrorCode::Offline);
        let err: DeviceError = common::Error::Timeout("read".into()).into();
        assert_eq!(err.code, ErrorCode::Timeout);
    }
}
