//! Outcome taxonomy shared by every component.
//!
//! Raw radio error codes never cross a component boundary: whichever
//! component issued a request translates its [`RilErrno`] through
//! [`RilErrno::into_result`] before returning to its caller.
//!
//! [`RilErrno`]: crate::ril::RilErrno
//! [`RilErrno::into_result`]: crate::ril::RilErrno::into_result

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
pub enum CellularError {
    /// The requested stage has already been reached.
    #[error("operation already completed")]
    Already,
    /// `connect()` called on a context whose bearer is already up.
    #[error("context is already connected")]
    IsConnected,
    /// A non-blocking attempt for the same gate is still outstanding.
    #[error("operation in progress")]
    Busy,
    #[error("operation timed out")]
    Timeout,
    /// Radio or transport failure, including a refused send.
    #[error("radio device error")]
    DeviceError,
    /// The event queue could not accept a progression task.
    #[error("event queue full")]
    NoMemory,
    #[error("operation not supported by this radio")]
    Unsupported,
    #[error("invalid parameter")]
    Parameter,
}

pub type Result<T> = std::result::Result<T, CellularError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_and_terse() {
        assert_eq!(CellularError::Timeout.to_string(), "operation timed out");
        assert_eq!(CellularError::NoMemory.to_string(), "event queue full");
    }
}
