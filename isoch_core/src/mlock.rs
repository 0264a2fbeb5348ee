//! Best-effort memory locking (`spec.md §5`/`§9`).
//!
//! Pinning the SPSC ring and the transport buffers resident avoids a
//! page fault landing on the runloop thread mid-cycle. Locking is
//! attempted once at startup, after all allocations; a failure is a
//! warning, never an error — callers surface it through a counter or
//! flag rather than failing the operation that asked for it.

/// Attempt to lock `len` bytes starting at `ptr` into physical memory.
/// Returns `true` on success. A zero-length range trivially succeeds.
#[cfg(unix)]
pub fn lock_memory(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    // SAFETY: the caller guarantees `ptr` is valid for `len` bytes for
    // the duration of the lock; `mlock` itself only pins pages, it does
    // not read or write through the pointer.
    unsafe { libc::mlock(ptr.cast(), len) == 0 }
}

#[cfg(not(unix))]
pub fn lock_memory(_ptr: *const u8, _len: usize) -> bool {
    false
}
