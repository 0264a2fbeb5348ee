//! `ProcessingWorker` (`spec.md §4.6`/§5`): the soft-real-time thread
//! that drains `DoubleBufferHandoff`'s read bank and invokes the
//! client's packet callback.
//!
//! Grounded on `AudioProcessingThread.{hpp,cpp}`'s condition-variable
//! wait / `shouldExit_` join idiom, adapted to `bbx_player`'s
//! stop-flag + background-thread pattern (`backend.rs::PlayHandle`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::double_buffer::DoubleBufferHandoff;

/// Invoked once per drained segment: `(segment_index, data, timestamp)`.
/// Never called from the runloop thread (`spec.md §6`).
pub trait PacketSink: Send {
    fn on_packet(&mut self, segment_index: u32, data: &[u8], timestamp: u32);
}

impl<F: FnMut(u32, &[u8], u32) + Send> PacketSink for F {
    fn on_packet(&mut self, segment_index: u32, data: &[u8], timestamp: u32) {
        (self)(segment_index, data, timestamp)
    }
}

struct Signal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self { mutex: Mutex::new(false), condvar: Condvar::new() }
    }

    fn notify(&self) {
        let mut available = self.mutex.lock().unwrap();
        *available = true;
        self.condvar.notify_one();
    }

    /// Waits for a notification, consuming it. Wakes spuriously at most
    /// as often as the underlying condvar does; callers loop on
    /// `should_exit`.
    fn wait_timeout(&self) {
        let available = self.mutex.lock().unwrap();
        let (mut available, _) = self.condvar.wait_timeout(available, std::time::Duration::from_millis(50)).unwrap();
        *available = false;
    }
}

/// A cloneable, `Send + Sync` handle that wakes a `ProcessingWorker` from
/// the bus-callback side without giving access to the rest of its state.
/// Grounded on `AudioProcessingThread::notifyNewData`.
#[derive(Clone)]
pub struct NotifyHandle {
    signal: Arc<Signal>,
}

impl NotifyHandle {
    pub fn notify(&self) {
        self.signal.notify();
    }
}

/// Owning handle over the background processing thread. Dropping it
/// does not join the thread; call `stop()` explicitly (matching
/// `bbx_player::PlayHandle`'s stop-flag pattern) so the caller controls
/// when the join happens.
pub struct ProcessingWorker {
    should_exit: Arc<AtomicBool>,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessingWorker {
    /// Spawns the worker thread. `sink` is invoked synchronously for
    /// each drained segment, in segment-index order, after a
    /// successful `try_swap`.
    pub fn start(handoff: Arc<DoubleBufferHandoff>, mut sink: Box<dyn PacketSink>) -> Self {
        let should_exit = Arc::new(AtomicBool::new(false));
        let signal = Arc::new(Signal::new());

        let should_exit_thread = Arc::clone(&should_exit);
        let signal_thread = Arc::clone(&signal);

        let handle = thread::spawn(move || {
            while !should_exit_thread.load(Ordering::Relaxed) {
                if !handoff.try_swap() {
                    signal_thread.wait_timeout();
                    continue;
                }

                for segment in 0..handoff.num_segments() {
                    let Some((ptr, timestamp)) = handoff.read_segment(segment) else { continue };
                    // SAFETY: `read_segment` only returns `Some` for a
                    // segment the write side marked complete and handed
                    // off via `try_swap`; the write side will not touch
                    // this bank's memory again until `mark_processed`
                    // below and a later swap return it to write.
                    let data = unsafe { std::slice::from_raw_parts(ptr, handoff.segment_size()) };
                    sink.on_packet(segment, data, timestamp);
                    handoff.mark_processed(segment);
                }
            }
        });

        Self { should_exit, signal, handle: Some(handle) }
    }

    /// Called from the bus-callback side after `DoubleBufferHandoff::mark_complete`
    /// to wake the worker promptly instead of waiting out its poll timeout.
    pub fn notify_new_data(&self) {
        self.signal.notify();
    }

    /// A cloneable handle equivalent to `notify_new_data`, for callers
    /// (e.g. a `SegmentCompletionSink`) that outlive a borrow of `self`.
    pub fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle { signal: Arc::clone(&self.signal) }
    }

    /// Signals the thread to exit and joins it deterministically.
    pub fn stop(mut self) {
        self.should_exit.store(true, Ordering::Relaxed);
        self.signal.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProcessingWorker {
    fn drop(&mut self) {
        self.should_exit.store(true, Ordering::Relaxed);
        self.signal.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
