//! Error types shared across the isoch audio engine workspace.
//!
//! This module provides the error taxonomy and a `Result` type alias used
//! by every crate downstream of `isoch_core`.

use core::fmt;

/// Error taxonomy for the isoch audio transport engine.
///
/// Each variant's propagation policy is documented on the variant itself;
/// see the crate that raises it for the exact condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportError {
    /// Invalid configuration: unaligned buffer, non power-of-two capacity, etc.
    /// Surfaced to the caller; there is no recovery.
    BadArgument,
    /// Operation attempted while the state machine was in the wrong state.
    NotReady,
    /// Reconfiguration attempted while running, or a concurrency violation
    /// on a state machine that only tolerates one in-flight transition.
    Busy,
    /// VM allocation failed. The owning `Stream` becomes unusable.
    OutOfMemory,
    /// A peer callback returned an error, or channel allocation failed.
    /// The `Stream` transitions to `Stopped`.
    BusIO,
    /// The hardware outran the descriptor program. Reported via the
    /// message callback; the `Stream` stops.
    Overrun,
    /// `stop()` did not observe the finalize callback within its deadline.
    /// The `Stream` is quarantined and cannot be restarted.
    Timeout,
    /// The shared-memory ring's `abiVersion` or `capacity` did not match
    /// on attach. Only the consumer side is affected.
    AbiMismatch,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::BadArgument => write!(f, "invalid argument"),
            TransportError::NotReady => write!(f, "operation attempted in wrong state"),
            TransportError::Busy => write!(f, "busy: reconfiguration or concurrent transition rejected"),
            TransportError::OutOfMemory => write!(f, "buffer allocation failed"),
            TransportError::BusIO => write!(f, "bus I/O error"),
            TransportError::Overrun => write!(f, "descriptor program overrun"),
            TransportError::Timeout => write!(f, "stop deadline elapsed before finalize"),
            TransportError::AbiMismatch => write!(f, "shared-memory ring ABI mismatch"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

/// Result type alias for isoch audio engine operations.
pub type Result<T> = core::result::Result<T, TransportError>;
