//! `DoubleBufferHandoff` (`spec.md §4.6`): two buffer banks, each
//! containing `numSegments` segment slots, decoupling the bus-callback
//! context (hard real-time) from the processing worker (soft real-time).
//!
//! Grounded on `IsochDoubleBufferManager.{hpp,cpp}`'s bank-A/bank-B
//! layout and `trySwapBuffers` gate, generalized from its two parallel
//! flag arrays into one atomic `complete`/`processed` pair per slot.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// One segment's storage plus its two single-word atomic flags and its
/// timestamp. Kept entirely per-bank (`IsochDoubleBufferManager.hpp`'s
/// `segmentsA_`/`segmentsB_`) so a swap cannot expose the write bank's
/// in-progress timestamp to a read of the other bank's same-index slot.
struct Slot {
    buffer: Box<[u8]>,
    /// `true` once the bus-callback side finished writing this segment.
    complete: AtomicBool,
    /// `true` once the worker finished reading this segment.
    processed: AtomicBool,
    timestamp: AtomicU32,
}

impl Slot {
    fn new(segment_size: usize) -> Self {
        Self {
            buffer: vec![0u8; segment_size].into_boxed_slice(),
            complete: AtomicBool::new(false),
            processed: AtomicBool::new(true),
            timestamp: AtomicU32::new(0),
        }
    }
}

struct Bank {
    slots: Vec<Slot>,
}

impl Bank {
    fn new(num_segments: u32, segment_size: usize) -> Self {
        Self { slots: (0..num_segments).map(|_| Slot::new(segment_size)).collect() }
    }

    fn all_complete(&self) -> bool {
        self.slots.iter().all(|s| s.complete.load(Ordering::Acquire))
    }

    fn all_processed(&self) -> bool {
        self.slots.iter().all(|s| s.processed.load(Ordering::Acquire))
    }
}

/// Two banks of `num_segments` segment slots; one is always the *write*
/// bank (bus-callback side) and the other the *read* bank (worker
/// side). A swap is only permitted once the write bank is fully
/// complete and the read bank is fully processed (`spec.md §4.6`).
pub struct DoubleBufferHandoff {
    banks: [Bank; 2],
    /// `false`: bank 0 is write, bank 1 is read. `true`: reversed.
    swapped: AtomicBool,
    num_segments: u32,
    segment_size: usize,
    swap_count: AtomicUsize,
}

impl DoubleBufferHandoff {
    pub fn new(num_segments: u32, segment_size: usize) -> Self {
        Self {
            banks: [Bank::new(num_segments, segment_size), Bank::new(num_segments, segment_size)],
            swapped: AtomicBool::new(false),
            num_segments,
            segment_size,
            swap_count: AtomicUsize::new(0),
        }
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn write_bank(&self) -> &Bank {
        if self.swapped.load(Ordering::Acquire) { &self.banks[1] } else { &self.banks[0] }
    }

    fn read_bank(&self) -> &Bank {
        if self.swapped.load(Ordering::Acquire) { &self.banks[0] } else { &self.banks[1] }
    }

    /// Returns a writable pointer to segment `i` of the write bank if
    /// it has been marked processed (available for reuse); `None`
    /// otherwise.
    pub fn write_segment(&self, i: u32) -> Option<*mut u8> {
        let slot = self.write_bank().slots.get(i as usize)?;
        if slot.processed.load(Ordering::Acquire) {
            Some(slot.buffer.as_ptr() as *mut u8)
        } else {
            None
        }
    }

    /// Marks segment `i` of the write bank complete and available to
    /// the read side once a swap occurs. Also records `timestamp`.
    pub fn mark_complete(&self, i: u32, timestamp: u32) {
        if let Some(slot) = self.write_bank().slots.get(i as usize) {
            slot.timestamp.store(timestamp, Ordering::Release);
            slot.processed.store(false, Ordering::Release);
            slot.complete.store(true, Ordering::Release);
        }
    }

    /// Returns a readable pointer to segment `i` of the read bank if it
    /// has been marked complete; `None` otherwise.
    pub fn read_segment(&self, i: u32) -> Option<(*const u8, u32)> {
        let slot = self.read_bank().slots.get(i as usize)?;
        if slot.complete.load(Ordering::Acquire) {
            Some((slot.buffer.as_ptr(), slot.timestamp.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Marks segment `i` of the read bank processed and available for
    /// the write side to reuse after the next swap.
    pub fn mark_processed(&self, i: u32) {
        if let Some(slot) = self.read_bank().slots.get(i as usize) {
            slot.complete.store(false, Ordering::Release);
            slot.processed.store(true, Ordering::Release);
        }
    }

    /// Atomically exchanges the write/read bank roles iff every slot of
    /// the write bank is complete and every slot of the read bank is
    /// processed. Returns whether the swap happened.
    pub fn try_swap(&self) -> bool {
        if self.write_bank().all_complete() && self.read_bank().all_processed() {
            self.swapped.fetch_xor(true, Ordering::AcqRel);
            self.swap_count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn swap_count(&self) -> usize {
        self.swap_count.load(Ordering::Relaxed)
    }
}

// SAFETY: slot buffers are accessed only through the complete/processed
// atomics' acquire/release pairing, matching the SPSC ring's protocol:
// the write side never reads a slot the read side owns and vice versa.
unsafe impl Send for DoubleBufferHandoff {}
unsafe impl Sync for DoubleBufferHandoff {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handoff_write_segments_are_immediately_writable() {
        let handoff = DoubleBufferHandoff::new(4, 16);
        for i in 0..4 {
            assert!(handoff.write_segment(i).is_some());
        }
    }

    /// §8 property 6 / S4 — swap gate.
    #[test]
    fn swap_requires_full_write_bank_and_full_read_bank() {
        let handoff = DoubleBufferHandoff::new(4, 16);

        for i in 0..3 {
            handoff.mark_complete(i, i);
        }
        assert!(!handoff.try_swap());

        handoff.mark_complete(3, 3);
        assert!(handoff.try_swap());
        assert_eq!(handoff.swap_count(), 1);

        // Second swap must wait until the new read bank (old write
        // bank) is fully processed.
        assert!(!handoff.try_swap());
    }

    #[test]
    fn swap_exposes_complete_segments_to_read_side() {
        let handoff = DoubleBufferHandoff::new(2, 8);
        handoff.mark_complete(0, 100);
        handoff.mark_complete(1, 200);
        assert!(handoff.try_swap());

        let (_, ts0) = handoff.read_segment(0).unwrap();
        assert_eq!(ts0, 100);
        let (_, ts1) = handoff.read_segment(1).unwrap();
        assert_eq!(ts1, 200);

        handoff.mark_processed(0);
        handoff.mark_processed(1);
        assert!(handoff.read_segment(0).is_none());
    }

    #[test]
    fn round_trips_through_multiple_swaps() {
        let handoff = DoubleBufferHandoff::new(2, 8);

        for round in 0..5u32 {
            for i in 0..2 {
                assert!(handoff.write_segment(i).is_some());
                handoff.mark_complete(i, round * 10 + i);
            }
            assert!(handoff.try_swap());

            for i in 0..2 {
                let (_, ts) = handoff.read_segment(i).unwrap();
                assert_eq!(ts, round * 10 + i);
                handoff.mark_processed(i);
            }
        }
        assert_eq!(handoff.swap_count(), 5);
    }

    #[test]
    fn write_segment_refuses_unprocessed_slot() {
        let handoff = DoubleBufferHandoff::new(1, 8);
        handoff.mark_complete(0, 1);
        assert!(handoff.try_swap());
        // The now-write bank (old read bank) was processed at construction,
        // so it remains writable until marked complete again.
        assert!(handoff.write_segment(0).is_some());
        handoff.mark_complete(0, 2);
        assert!(handoff.write_segment(0).is_none());
    }

    /// The timestamp for a segment read out of the read bank must never
    /// reflect a later generation's `mark_complete` on the write bank's
    /// same-index slot — they are different `Slot`s once a swap has
    /// happened, never a shared array indexed by segment number.
    #[test]
    fn read_timestamp_is_isolated_from_the_next_generation_write() {
        let handoff = DoubleBufferHandoff::new(1, 8);
        handoff.mark_complete(0, 100);
        assert!(handoff.try_swap());

        let (_, ts) = handoff.read_segment(0).unwrap();
        assert_eq!(ts, 100);

        // The write side (now the old read bank, reusable since
        // `try_swap` only just happened and this slot hasn't been
        // re-marked) starts filling the next generation with a very
        // different timestamp before the read side calls
        // `mark_processed`.
        handoff.mark_complete(0, 999);

        let (_, ts) = handoff.read_segment(0).unwrap();
        assert_eq!(ts, 100, "read bank's timestamp must not be clobbered by the write bank's next generation");
    }
}
