//! Listener-side `SegmentCompletionSink`: copies the just-completed
//! segment's client-region payload into the write bank of a
//! `DoubleBufferHandoff` and wakes the processing worker.
//!
//! Grounded on `AudioDeviceStream.cpp`'s receive path, which hands the
//! DMA'd segment to `IsochDoubleBufferManager::markSegmentComplete`
//! followed by `AudioProcessingThread::notifyNewData`.

use isoch_transport::SegmentCompletionSink;
use isoch_worker::{DoubleBufferHandoff, NotifyHandle};
use std::sync::Arc;

pub struct HandoffSegmentSink {
    handoff: Arc<DoubleBufferHandoff>,
    notify: NotifyHandle,
    payload_base: usize,
    timestamps_base: usize,
    cycles_per_segment: u32,
    payload_stride: usize,
    overruns: u32,
}

impl HandoffSegmentSink {
    pub fn new(
        handoff: Arc<DoubleBufferHandoff>,
        notify: NotifyHandle,
        payload_base: usize,
        timestamps_base: usize,
        cycles_per_segment: u32,
        payload_stride: usize,
    ) -> Self {
        Self { handoff, notify, payload_base, timestamps_base, cycles_per_segment, payload_stride, overruns: 0 }
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

impl SegmentCompletionSink for HandoffSegmentSink {
    fn on_segment_complete(&mut self, segment: u32) {
        let Some(dst) = self.handoff.write_segment(segment) else { return };

        let segment_start_cycle = segment * self.cycles_per_segment;
        let src = self.payload_base + segment_start_cycle as usize * self.payload_stride;
        let len = self.handoff.segment_size().min(self.cycles_per_segment as usize * self.payload_stride);

        // SAFETY: `src` lies within the caller's `client` region for
        // `cycles_per_segment * payload_stride` bytes, written by the
        // bus hardware before this callback fires; `dst` was just
        // returned by `write_segment`, which only yields a pointer to a
        // slot the worker has finished processing.
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst, len);
        }

        let last_cycle = segment_start_cycle + self.cycles_per_segment - 1;
        let ts_addr = self.timestamps_base + last_cycle as usize * 4;
        // SAFETY: `ts_addr` lies within the `timestamps` region, written
        // by the bus hardware before this callback fires.
        let timestamp = unsafe { (ts_addr as *const u32).read_unaligned() };

        self.handoff.mark_complete(segment, timestamp);
        self.notify.notify();
    }

    fn on_overrun(&mut self) {
        self.overruns += 1;
    }
}
