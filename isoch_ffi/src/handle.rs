//! Opaque handle wrapper for `isoch_stream::Stream`.
//!
//! Grounded on `bbx_ffi::handle`'s `BbxGraph`/`GraphInner` split: a
//! zero-sized `#[repr(C)]` marker type C code points at, and an
//! internal type the FFI functions convert to/from via
//! `Box::into_raw`/`Box::from_raw`.

use isoch_stream::Stream;

use crate::ffi_bus::{FfiBusConnector, FfiPlugConnector};

/// Opaque handle to a talker or listener stream. C code never sees past
/// this; all operations go through the `isoch_stream_*` functions.
#[repr(C)]
pub struct IsochStream {
    _private: [u8; 0],
}

pub(crate) type StreamInner = Stream<FfiBusConnector, FfiPlugConnector>;

/// Convert a raw handle back into a reference to the owned `Stream`.
///
/// # Safety
/// `handle` must be non-null and have been produced by
/// `handle_from_stream`, and not yet passed to `stream_from_handle`.
#[inline]
pub(crate) unsafe fn stream_from_handle<'a>(handle: *mut IsochStream) -> &'a mut StreamInner {
    unsafe { &mut *(handle as *mut StreamInner) }
}

/// Convert an owned `Stream` into a raw handle for C to hold.
#[inline]
pub(crate) fn handle_from_stream(stream: Box<StreamInner>) -> *mut IsochStream {
    Box::into_raw(stream) as *mut IsochStream
}

/// Reclaim and drop the `Stream` behind `handle`.
///
/// # Safety
/// `handle` must have been produced by `handle_from_stream` and not
/// already destroyed.
#[inline]
pub(crate) unsafe fn destroy_handle(handle: *mut IsochStream) {
    unsafe {
        drop(Box::from_raw(handle as *mut StreamInner));
    }
}
