//! C-compatible error codes mirroring `isoch_core::TransportError`.
//!
//! Grounded on `bbx_ffi`'s `BbxError` re-export pattern: a `#[repr(C)]`
//! enum with an explicit `Ok = 0`, one value per source variant.

use std::fmt;

use isoch_core::TransportError;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsochError {
    Ok = 0,
    BadArgument = 1,
    NotReady = 2,
    Busy = 3,
    OutOfMemory = 4,
    BusIo = 5,
    Overrun = 6,
    Timeout = 7,
    AbiMismatch = 8,
    /// A required out-pointer or handle was null.
    NullPointer = 9,
}

impl From<TransportError> for IsochError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::BadArgument => IsochError::BadArgument,
            TransportError::NotReady => IsochError::NotReady,
            TransportError::Busy => IsochError::Busy,
            TransportError::OutOfMemory => IsochError::OutOfMemory,
            TransportError::BusIO => IsochError::BusIo,
            TransportError::Overrun => IsochError::Overrun,
            TransportError::Timeout => IsochError::Timeout,
            TransportError::AbiMismatch => IsochError::AbiMismatch,
        }
    }
}

impl fmt::Display for IsochError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsochError::Ok => write!(f, "no error"),
            IsochError::BadArgument => write!(f, "bad argument"),
            IsochError::NotReady => write!(f, "not ready"),
            IsochError::Busy => write!(f, "busy"),
            IsochError::OutOfMemory => write!(f, "out of memory"),
            IsochError::BusIo => write!(f, "bus i/o error"),
            IsochError::Overrun => write!(f, "overrun"),
            IsochError::Timeout => write!(f, "timeout"),
            IsochError::AbiMismatch => write!(f, "abi mismatch"),
            IsochError::NullPointer => write!(f, "null pointer"),
        }
    }
}

pub(crate) fn result_to_code<T>(result: isoch_core::Result<T>) -> IsochError {
    match result {
        Ok(_) => IsochError::Ok,
        Err(err) => IsochError::from(err),
    }
}

/// Decode a bus-side vtable call's raw return code. `0` is success;
/// `1..=8` map onto `TransportError` in declaration order, matching
/// `IsochError`'s discriminants minus `Ok`/`NullPointer`. Any other
/// value is folded to `BusIo`.
pub(crate) fn code_to_result(code: i32) -> isoch_core::Result<()> {
    match code {
        0 => Ok(()),
        1 => Err(TransportError::BadArgument),
        2 => Err(TransportError::NotReady),
        3 => Err(TransportError::Busy),
        4 => Err(TransportError::OutOfMemory),
        5 => Err(TransportError::BusIO),
        6 => Err(TransportError::Overrun),
        7 => Err(TransportError::Timeout),
        8 => Err(TransportError::AbiMismatch),
        _ => Err(TransportError::BusIO),
    }
}
