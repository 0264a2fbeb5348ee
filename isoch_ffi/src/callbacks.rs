//! Bridges a host's `extern "C"` callback + opaque user-data pair into
//! the `PacketSink` / message-callback closures `isoch_stream::Stream`
//! expects.

use std::ffi::c_void;

use isoch_stream::MessageCode;
use isoch_worker::PacketSink;

/// `(user_data, segment_index, data, data_len, timestamp)`. `data` is
/// only valid for the duration of the call.
pub type CPacketCallback = extern "C" fn(user_data: *mut c_void, segment_index: u32, data: *const u8, data_len: u32, timestamp: u32);

/// `(user_data, code, param1, param2)`.
pub type CMessageCallback = extern "C" fn(user_data: *mut c_void, code: u32, param1: u32, param2: u32);

struct CPacketSink {
    callback: CPacketCallback,
    user_data: *mut c_void,
}

// SAFETY: the host guarantees `user_data` is safe to dereference from
// whichever thread invokes `callback`, which is this type's only use
// of it; `ProcessingWorker` invokes `on_packet` from its single
// background thread.
unsafe impl Send for CPacketSink {}

impl PacketSink for CPacketSink {
    fn on_packet(&mut self, segment_index: u32, data: &[u8], timestamp: u32) {
        (self.callback)(self.user_data, segment_index, data.as_ptr(), data.len() as u32, timestamp);
    }
}

pub(crate) fn packet_sink(callback: CPacketCallback, user_data: *mut c_void) -> Box<dyn PacketSink> {
    Box::new(CPacketSink { callback, user_data })
}

struct CMessageSink {
    callback: CMessageCallback,
    user_data: *mut c_void,
}

// SAFETY: see `CPacketSink`; the runloop thread is the only caller.
unsafe impl Send for CMessageSink {}

fn message_code_to_u32(code: MessageCode) -> u32 {
    match code {
        MessageCode::DataPull => 0,
        MessageCode::TimeStampAdjust => 1,
        MessageCode::DclOverrunAutoRestartFailed => 2,
        MessageCode::AllocateIsochPort => 3,
        MessageCode::ReleaseIsochPort => 4,
        MessageCode::Started => 5,
        MessageCode::Stopped => 6,
        MessageCode::Error => 7,
    }
}

pub(crate) fn message_callback(callback: CMessageCallback, user_data: *mut c_void) -> isoch_stream::MessageCallback {
    let sink = CMessageSink { callback, user_data };
    Box::new(move |code, param1, param2| {
        (sink.callback)(sink.user_data, message_code_to_u32(code), param1, param2);
    })
}
