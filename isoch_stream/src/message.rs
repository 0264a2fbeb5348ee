//! The client message callback (`spec.md §6`): `(code, param1, param2)`,
//! delivered on the runloop thread or a client-lifecycle thread; the
//! client must not block on it.

/// Message codes a `Stream` may surface to the client's message
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    /// The talker's payload source had no data for the current cycle.
    DataPull,
    /// Reported bus cycle time drifted from what the engine expected.
    TimeStampAdjust,
    /// The descriptor program's overrun sentinel fired and auto-restart
    /// was not attempted.
    DclOverrunAutoRestartFailed,
    /// An isoch port/channel was allocated.
    AllocateIsochPort,
    /// An isoch port/channel was released.
    ReleaseIsochPort,
    /// `start()` completed successfully.
    Started,
    /// `stop()` completed (with or without timeout).
    Stopped,
    /// A non-fatal error occurred outside the caller's own return path.
    Error,
}

/// `(code, param1, param2)`. Never invoked re-entrantly; the client must
/// not block inside it.
pub type MessageCallback = Box<dyn FnMut(MessageCode, u32, u32) + Send>;
