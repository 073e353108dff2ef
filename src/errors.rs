use std::io;
use thiserror::Error;

/// Errors returned by every engine operation.
///
/// The scan thread never returns these to a caller directly; it records
/// overrun conditions in the session flags and the next status or read call
/// reports them.
#[derive(Debug, Error)]
pub enum HatError {
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("device is busy")]
    Busy,
    #[error("timeout waiting for the device")]
    Timeout,
    #[error("timeout obtaining the bus lock")]
    LockTimeout,
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("device is not the expected type (expected id {expected:#06x}, found {found:#06x})")]
    InvalidDevice { expected: u16, found: u16 },
    #[error("communication failure: {0}")]
    CommsFailure(#[from] io::Error),
    #[error("undefined device status {0:#04x}")]
    Undefined(u8),
}

impl HatError {
    /// Stable negative result code, as exposed to Python callers.
    pub fn code(&self) -> i32 {
        match self {
            HatError::BadParameter(_) => -1,
            HatError::Busy => -2,
            HatError::Timeout => -3,
            HatError::LockTimeout => -4,
            HatError::InvalidDevice { .. } => -5,
            HatError::ResourceUnavailable(_) => -6,
            HatError::CommsFailure(_) => -7,
            HatError::Undefined(_) => -10,
        }
    }

    /// Timeouts (device or lock) may succeed if the caller tries again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HatError::Timeout | HatError::LockTimeout)
    }

    pub(crate) fn bad_param(msg: impl Into<String>) -> Self {
        HatError::BadParameter(msg.into())
    }

    pub(crate) fn no_scan() -> Self {
        HatError::ResourceUnavailable("no scan is active".into())
    }
}

pub type Result<T> = std::result::Result<T, HatError>;
