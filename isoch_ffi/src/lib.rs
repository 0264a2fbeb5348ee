//! # isoch_ffi
//!
//! C ABI waist over [`isoch_stream::Stream`] and [`isoch_shm`] for the
//! out-of-process driver plug-in (`spec.md §1`: "a single-producer /
//! single-consumer shared-memory ring used to hand audio PCM across a
//! process boundary between a driver plug-in and this engine"). The
//! plug-in links this crate as a `cdylib`/`staticlib` and drives a
//! `Stream` through host-supplied `extern "C"` callback vtables
//! (`ffi_bus::IsochBusVTable`/`IsochPlugVTable`) rather than a linked-in
//! platform bus library.
//!
//! Grounded on `bbx_ffi::lib`'s handle lifecycle (`bbx_graph_create` /
//! `_destroy` / null checks / `BbxError` return codes) and its module
//! split (`handle`, a thin `lib.rs` of `#[no_mangle]` entry points).

mod callbacks;
mod error;
mod ffi_bus;
mod handle;

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use isoch_cip::SampleRate;
use isoch_transport::{ChannelRequest, Role, Speed, SystemClock};

pub use callbacks::{CMessageCallback, CPacketCallback};
pub use error::IsochError;
pub use ffi_bus::{IsochBusVTable, IsochPlugVTable};
pub use handle::IsochStream;

use callbacks::{message_callback, packet_sink};
use handle::{destroy_handle, handle_from_stream, stream_from_handle, StreamInner};

fn sample_rate_from_hz(hz: u32) -> Option<SampleRate> {
    Some(match hz {
        44_100 => SampleRate::Hz44100,
        48_000 => SampleRate::Hz48000,
        88_200 => SampleRate::Hz88200,
        96_000 => SampleRate::Hz96000,
        176_400 => SampleRate::Hz176400,
        192_000 => SampleRate::Hz192000,
        _ => return None,
    })
}

fn speed_from_code(code: u8) -> Option<Speed> {
    Some(match code {
        0 => Speed::S100,
        1 => Speed::S200,
        2 => Speed::S400,
        3 => Speed::S800,
        _ => return None,
    })
}

fn channel_request_from_i32(channel: i32) -> ChannelRequest {
    if channel < 0 {
        ChannelRequest::Any
    } else {
        ChannelRequest::Specific(channel as u32)
    }
}

// ============================================================================
// Lifecycle functions
// ============================================================================

/// Create a talker (transmit) stream.
///
/// Returns null if `sample_rate_hz` is unsupported or allocation fails.
/// The returned handle must be destroyed with `isoch_stream_destroy`.
///
/// # Safety
/// `bus_ctx` and `plug_ctx` must be valid for as long as the returned
/// handle is alive, per `IsochBusVTable`/`IsochPlugVTable`'s contract.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_new_talker(
    bus_vtable: IsochBusVTable,
    bus_ctx: *mut c_void,
    plug_vtable: IsochPlugVTable,
    plug_ctx: *mut c_void,
    cycles_per_segment: u32,
    num_segments: u32,
    channels: u32,
    sample_rate_hz: u32,
    blocks_per_packet: u8,
    dbs_quadlets: u8,
) -> *mut IsochStream {
    let Some(sample_rate) = sample_rate_from_hz(sample_rate_hz) else {
        return std::ptr::null_mut();
    };

    let connector = ffi_bus::FfiBusConnector::new(bus_vtable, bus_ctx);
    let plug = ffi_bus::FfiPlugConnector::new(plug_vtable, plug_ctx);

    let stream = StreamInner::new_talker(
        connector,
        plug,
        Arc::new(SystemClock::new()),
        cycles_per_segment,
        num_segments,
        channels as usize,
        sample_rate,
        blocks_per_packet,
        dbs_quadlets,
    );

    match stream {
        Ok(stream) => handle_from_stream(Box::new(stream)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Create a listener (receive) stream. See `isoch_stream_new_talker` for
/// the shared parameters' meaning and the handle's safety contract.
///
/// # Safety
/// Same as `isoch_stream_new_talker`.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_new_listener(
    bus_vtable: IsochBusVTable,
    bus_ctx: *mut c_void,
    plug_vtable: IsochPlugVTable,
    plug_ctx: *mut c_void,
    cycles_per_segment: u32,
    num_segments: u32,
    channels: u32,
) -> *mut IsochStream {
    let connector = ffi_bus::FfiBusConnector::new(bus_vtable, bus_ctx);
    let plug = ffi_bus::FfiPlugConnector::new(plug_vtable, plug_ctx);

    let stream =
        StreamInner::new_listener(connector, plug, Arc::new(SystemClock::new()), cycles_per_segment, num_segments, channels as usize);

    match stream {
        Ok(stream) => handle_from_stream(Box::new(stream)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Destroy a stream created by `isoch_stream_new_talker`/`_new_listener`.
/// Safe to call with a null handle.
///
/// # Safety
/// `handle` must not be used again after this call.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_destroy(handle: *mut IsochStream) {
    if !handle.is_null() {
        unsafe { destroy_handle(handle) };
    }
}

// ============================================================================
// Configuration and lifecycle
// ============================================================================

/// `speed_code`: 0=S100, 1=S200, 2=S400, 3=S800. `channel < 0` means
/// "any channel".
///
/// # Safety
/// `handle` must be a live handle from `isoch_stream_new_talker`/`_new_listener`.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_configure(handle: *mut IsochStream, speed_code: u8, channel: i32) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let Some(speed) = speed_from_code(speed_code) else {
        return IsochError::BadArgument;
    };

    let stream = unsafe { stream_from_handle(handle) };
    error::result_to_code(stream.configure(speed, channel_request_from_i32(channel)))
}

/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_connect_plug(handle: *mut IsochStream) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    error::result_to_code(stream.connect_plug())
}

/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_disconnect_plug(handle: *mut IsochStream) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    error::result_to_code(stream.disconnect_plug())
}

/// Register the packet callback. Only meaningful for a listener stream;
/// ignored for a talker. Must be called before `isoch_stream_start`.
///
/// # Safety
/// `handle` must be live; `user_data` must outlive the callback's use.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_set_packet_callback(handle: *mut IsochStream, callback: CPacketCallback, user_data: *mut c_void) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    stream.set_packet_callback(packet_sink(callback, user_data));
    IsochError::Ok
}

/// Register the message callback (`code ∈ {DataPull, TimeStampAdjust,
/// DclOverrunAutoRestartFailed, AllocateIsochPort, ReleaseIsochPort,
/// Started, Stopped, Error}`, encoded 0..=7 in that order).
///
/// # Safety
/// `handle` must be live; `user_data` must outlive the callback's use.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_set_message_callback(
    handle: *mut IsochStream,
    callback: CMessageCallback,
    user_data: *mut c_void,
) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    stream.set_message_callback(message_callback(callback, user_data));
    IsochError::Ok
}

/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_start(handle: *mut IsochStream) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    error::result_to_code(stream.start())
}

/// Stop the stream, waiting up to `timeout_ms` for the finalize callback.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_stop(handle: *mut IsochStream, timeout_ms: u32) -> IsochError {
    if handle.is_null() {
        return IsochError::NullPointer;
    }
    let stream = unsafe { stream_from_handle(handle) };
    error::result_to_code(stream.stop(Duration::from_millis(timeout_ms as u64)))
}

/// Non-blocking client push for a talker stream (`spec.md §6`:
/// `pushAudioData(ptr, len) -> bool`). Returns `false` for a listener
/// stream or a full ring.
///
/// # Safety
/// `handle` must be live; `data` must be valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_push_audio_data(handle: *mut IsochStream, data: *const u8, len: usize) -> bool {
    if handle.is_null() || data.is_null() {
        return false;
    }
    let stream = unsafe { stream_from_handle(handle) };
    let slice = unsafe { std::slice::from_raw_parts(data, len) };
    stream.push_audio_data(slice)
}

/// `1` if the stream's role is talker, `0` if listener.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_is_talker(handle: *mut IsochStream) -> bool {
    if handle.is_null() {
        return false;
    }
    let stream = unsafe { stream_from_handle(handle) };
    matches!(stream.role(), Role::Talker)
}

/// `1` while the stream's runloop is active.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_is_running(handle: *mut IsochStream) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { stream_from_handle(handle) }.is_running()
}

/// Total overrun count surfaced by the descriptor program's sentinel
/// since stream creation.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_overrun_count(handle: *mut IsochStream) -> u32 {
    if handle.is_null() {
        return 0;
    }
    unsafe { stream_from_handle(handle) }.overrun_count()
}

/// `true` if locking a region into physical memory failed at `start()`.
/// Never fatal; a diagnostic-only flag.
///
/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn isoch_stream_memory_lock_warning(handle: *mut IsochStream) -> bool {
    if handle.is_null() {
        return false;
    }
    unsafe { stream_from_handle(handle) }.memory_lock_warning()
}
