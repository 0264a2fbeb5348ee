//! # isoch_shm
//!
//! Cross-process SPSC ring over a fixed shared-memory layout (`spec.md
//! §4.7`). Follows the same push/pop protocol as `isoch_core::SpscRing`
//! but over plain-old-data laid out for an external mapping rather than
//! a heap allocation owned by one process: a `ControlBlock` with
//! cache-line-isolated `write_index`/`read_index`, followed by a
//! power-of-two array of fixed-size `Slot`s.
//!
//! Grounded on `SharedMemoryStructures.hpp` (`ControlBlock_POD`,
//! `AudioChunk_POD`, `push`/`pop`) and `RingBufferManager.{hpp,cpp}`
//! (map/unmap lifecycle, ABI-version gate on attach, reader thread that
//! slices popped chunks into fixed packet payloads).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use isoch_core::{CachePadded, Result, TransportError};

/// Current layout version. Bumped whenever `ControlBlock` or `Slot`'s
/// field order, size, or meaning changes.
pub const ABI_VERSION: u32 = 1;

/// Largest chunk a single `push` may carry.
pub const MAX_FRAMES_PER_CHUNK: usize = 4096;
/// Largest channel count a chunk may carry.
pub const MAX_CHANNELS: usize = 32;
/// Bytes per sample (32-bit float or int).
pub const MAX_BYTES_PER_SAMPLE: usize = 4;
/// Bytes per frame at the maximum channel count.
pub const MAX_BYTES_PER_FRAME: usize = MAX_CHANNELS * MAX_BYTES_PER_SAMPLE;
/// Fixed size of a `Slot`'s `audio` payload.
pub const AUDIO_DATA_BYTES: usize = MAX_FRAMES_PER_CHUNK * MAX_BYTES_PER_FRAME;
/// Default ring capacity (slots), a power of two.
pub const DEFAULT_RING_CAPACITY: usize = 128;
/// Packet payload size the reader thread slices popped chunks into
/// (the per-cycle transmit payload length).
pub const READER_SLICE_BYTES: usize = 64;

/// `(host time, sample time, seed)` presentation timestamp carried with
/// each chunk, per `spec.md §4.7`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmTimeStamp {
    pub host_time_ns: u64,
    pub sample_time: u64,
    pub seed: u32,
}

/// One ring slot: a chunk of interleaved audio plus its publish sequence.
#[repr(C, align(64))]
pub struct Slot {
    pub time_stamp: ShmTimeStamp,
    pub frame_count: u32,
    pub data_bytes: u32,
    /// `writeIndex + 1` once the chunk in `audio` is fully published.
    pub sequence: AtomicU64,
    pub audio: [u8; AUDIO_DATA_BYTES],
}

/// Fixed control header: ABI/capacity identification plus the
/// cache-line-isolated write/read indices and overrun/underrun counters.
#[repr(C)]
pub struct ControlBlock {
    pub abi_version: AtomicU32,
    pub capacity: AtomicU32,
    write_index: CachePadded<AtomicU64>,
    read_index: CachePadded<AtomicU64>,
    pub overruns: AtomicU32,
    pub underruns: AtomicU32,
}

impl ControlBlock {
    fn zeroed() -> Self {
        Self {
            abi_version: AtomicU32::new(0),
            capacity: AtomicU32::new(0),
            write_index: CachePadded::new(AtomicU64::new(0)),
            read_index: CachePadded::new(AtomicU64::new(0)),
            overruns: AtomicU32::new(0),
            underruns: AtomicU32::new(0),
        }
    }
}

struct ShmLayout {
    base: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    owns_memory: bool,
}

// SAFETY: all access to the pointed-to `ControlBlock`/`Slot`s goes through
// the atomics in `ControlBlock` and per-slot `sequence`, per the push/pop
// protocol below; `ShmLayout` itself holds no non-atomic mutable state.
unsafe impl Send for ShmLayout {}
unsafe impl Sync for ShmLayout {}

impl ShmLayout {
    fn control(&self) -> &ControlBlock {
        // SAFETY: `base` points at a live `ControlBlock` for the lifetime
        // of this `ShmLayout`.
        unsafe { &*self.base.as_ptr().cast::<ControlBlock>() }
    }

    /// Raw pointer to the slot for `index`. Returns a pointer rather than
    /// a reference: the producer writes through it while the consumer
    /// only reads it (after observing `sequence`), and neither side may
    /// hold a `&Slot` while the other mutates it.
    fn slot_ptr(&self, index: u64) -> *mut Slot {
        let slot_index = (index & (self.capacity as u64 - 1)) as usize;
        let control_size = size_of::<ControlBlock>();
        // SAFETY: `slot_index < capacity`, and the region was sized in
        // `region_size` to hold `capacity` `Slot`s after the control block.
        unsafe {
            let slots = self.base.as_ptr().add(control_size).cast::<Slot>();
            slots.add(slot_index)
        }
    }
}

impl Drop for ShmLayout {
    fn drop(&mut self) {
        if self.owns_memory {
            // SAFETY: `base`/`layout` are exactly the pointer and layout
            // returned by the matching `alloc_zeroed` call in `ShmRing::create`.
            unsafe {
                dealloc(self.base.as_ptr(), self.layout);
            }
        }
    }
}

fn region_size(capacity: usize) -> usize {
    size_of::<ControlBlock>() + capacity * size_of::<Slot>()
}

/// One side's handle onto a shared-memory ring. Producer and consumer
/// handles are separate types (below) so a process only ever gets the
/// operations valid for its role, but both wrap the same underlying
/// layout type.
struct ShmRingInner {
    layout: ShmLayout,
}

impl ShmRingInner {
    fn create(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(TransportError::BadArgument);
        }

        let size = region_size(capacity);
        let layout = Layout::from_size_align(size, 64).map_err(|_| TransportError::BadArgument)?;

        // SAFETY: `layout` has non-zero size and valid alignment.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(TransportError::OutOfMemory)?;

        // SAFETY: the region is freshly zeroed and sized for one
        // `ControlBlock` followed by `capacity` `Slot`s; writing the
        // header in place and leaving slots zeroed matches `Slot::zeroed`
        // / `ControlBlock::zeroed`'s all-zero-valid representations.
        unsafe {
            base.as_ptr().cast::<ControlBlock>().write(ControlBlock::zeroed());
        }

        let shm = Self { layout: ShmLayout { base, layout, capacity, owns_memory: true } };
        shm.layout.control().abi_version.store(ABI_VERSION, Ordering::Relaxed);
        shm.layout.control().capacity.store(capacity as u32, Ordering::Relaxed);
        Ok(shm)
    }

    /// Attach to an externally-mapped region of at least
    /// `region_size(capacity)` bytes, validating its ABI header.
    ///
    /// # Safety
    /// `base` must point at a live mapping of at least `region_size(capacity)`
    /// bytes, valid for the lifetime of the returned value, either freshly
    /// zeroed (a creator attaching to its own mapping) or already
    /// initialized by a creator process.
    unsafe fn attach(base: NonNull<u8>, capacity: usize, is_creator: bool) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(TransportError::BadArgument);
        }

        if is_creator {
            base.as_ptr().cast::<ControlBlock>().write(ControlBlock::zeroed());
            let control = &*base.as_ptr().cast::<ControlBlock>();
            control.abi_version.store(ABI_VERSION, Ordering::Relaxed);
            control.capacity.store(capacity as u32, Ordering::Relaxed);
        } else {
            let control = &*base.as_ptr().cast::<ControlBlock>();
            let header_version = control.abi_version.load(Ordering::Acquire);
            let header_capacity = control.capacity.load(Ordering::Acquire);
            if header_version != ABI_VERSION || header_capacity as usize != capacity {
                return Err(TransportError::AbiMismatch);
            }
        }

        let layout = Layout::from_size_align_unchecked(region_size(capacity), 64);
        Ok(Self { layout: ShmLayout { base, layout, capacity, owns_memory: false } })
    }

    /// Best-effort page lock over the whole region (`spec.md §5`).
    fn lock_in_memory(&self) -> bool {
        isoch_core::lock_memory(self.layout.base.as_ptr(), self.layout.layout.size())
    }
}

/// A chunk read out of the ring by `ShmConsumer::pop`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub time_stamp: ShmTimeStamp,
    pub frame_count: u32,
    pub audio: Vec<u8>,
}

/// Producer-side handle. Never blocks; a full ring increments `overruns`
/// and rejects the push.
pub struct ShmProducer {
    inner: std::sync::Arc<ShmRingInner>,
}

/// Consumer-side handle. Never blocks; an empty ring increments
/// `underruns` and returns `None`.
pub struct ShmConsumer {
    inner: std::sync::Arc<ShmRingInner>,
}

/// Factory for an in-process-owned shared-memory-shaped ring (used when
/// both sides live in this process, e.g. tests, or as the creator side
/// before handing the mapping's fd to a peer process).
pub struct ShmRing;

impl ShmRing {
    /// Allocate a ring of `capacity` slots (rounded up is not performed;
    /// `capacity` must already be a power of two, matching the ABI's
    /// `capacity` header field exactly).
    pub fn create(capacity: usize) -> Result<(ShmProducer, ShmConsumer)> {
        let inner = std::sync::Arc::new(ShmRingInner::create(capacity)?);
        Ok((ShmProducer { inner: inner.clone() }, ShmConsumer { inner }))
    }

    /// Attach producer and consumer handles to a region the caller has
    /// already mapped (e.g. via `mmap` on a POSIX shared-memory fd).
    ///
    /// # Safety
    /// See `ShmRingInner::attach`; additionally, `base` must remain valid
    /// for as long as either returned handle is alive.
    pub unsafe fn attach(
        base: NonNull<u8>,
        capacity: usize,
        is_creator: bool,
    ) -> Result<(ShmProducer, ShmConsumer)> {
        let inner = std::sync::Arc::new(ShmRingInner::attach(base, capacity, is_creator)?);
        Ok((ShmProducer { inner: inner.clone() }, ShmConsumer { inner }))
    }

    /// Total byte size of the control block plus `capacity` slots —
    /// what a caller must `mmap`/allocate before calling `attach`.
    pub fn region_size(capacity: usize) -> usize {
        region_size(capacity)
    }
}

impl ShmProducer {
    /// Best-effort page lock over the ring (`spec.md §5`). Either side
    /// may call this; the region is shared, so one successful lock
    /// covers both. Failure is a warning, not an error.
    pub fn lock_in_memory(&self) -> bool {
        self.inner.lock_in_memory()
    }

    /// Copy `audio` (already framed as `frameCount * bytesPerFrame`
    /// bytes) into the next slot. Returns `false` (and increments
    /// `overruns`) if the ring is full or `audio` exceeds the fixed slot
    /// capacity.
    pub fn push(&mut self, time_stamp: ShmTimeStamp, frame_count: u32, audio: &[u8]) -> bool {
        let control = self.inner.layout.control();

        if audio.len() > AUDIO_DATA_BYTES {
            return false;
        }

        let rd = control.read_index.load(Ordering::Acquire);
        let wr = control.write_index.load(Ordering::Relaxed);

        if wr.wrapping_sub(rd) >= self.inner.layout.capacity as u64 {
            control.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let slot_ptr = self.inner.layout.slot_ptr(wr);
        // SAFETY: this producer is the only writer of this slot's
        // non-atomic fields; the consumer does not read them until it
        // observes `sequence == wr + 1` below. Writing through the raw
        // pointer (never forming a `&Slot`) keeps this free of the other
        // side's concurrent atomic access to the same allocation.
        unsafe {
            (*slot_ptr).time_stamp = time_stamp;
            (*slot_ptr).frame_count = frame_count;
            (*slot_ptr).data_bytes = audio.len() as u32;
            (*slot_ptr).audio[..audio.len()].copy_from_slice(audio);
            (*slot_ptr).sequence.store(wr + 1, Ordering::Release);
        }

        control.write_index.store(wr + 1, Ordering::Release);
        true
    }

    pub fn overruns(&self) -> u32 {
        self.inner.layout.control().overruns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.layout.capacity
    }
}

// SAFETY: `ShmProducer` only ever touches the write side of the
// push/pop protocol; the `Arc<ShmRingInner>` keeps the mapping alive.
unsafe impl Send for ShmProducer {}

impl ShmConsumer {
    /// Best-effort page lock over the ring (`spec.md §5`); see
    /// `ShmProducer::lock_in_memory`.
    pub fn lock_in_memory(&self) -> bool {
        self.inner.lock_in_memory()
    }

    /// Pop the next chunk, if the producer has published one. Returns
    /// `None` (and increments `underruns`) if the ring is empty.
    pub fn pop(&mut self) -> Option<Chunk> {
        let control = self.inner.layout.control();

        let wr = control.write_index.load(Ordering::Acquire);
        let rd = control.read_index.load(Ordering::Relaxed);

        if rd == wr {
            control.underruns.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slot_ptr = self.inner.layout.slot_ptr(rd);
        let expected_sequence = rd + 1;
        // SAFETY: reading through the raw pointer, not a `&Slot`, so this
        // never aliases the producer's concurrent writes to a slot still
        // in flight; the `sequence` check below is what makes the
        // subsequent plain-field reads safe to observe.
        unsafe {
            if (*slot_ptr).sequence.load(Ordering::Acquire) != expected_sequence {
                // Producer has reserved the slot but not finished publishing.
                return None;
            }

            let chunk = Chunk {
                time_stamp: (*slot_ptr).time_stamp,
                frame_count: (*slot_ptr).frame_count,
                audio: (*slot_ptr).audio[..(*slot_ptr).data_bytes as usize].to_vec(),
            };

            control.read_index.store(rd + 1, Ordering::Release);
            Some(chunk)
        }
    }

    pub fn underruns(&self) -> u32 {
        self.inner.layout.control().underruns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.layout.capacity
    }

    /// Drain chunks into fixed-size `READER_SLICE_BYTES` packets, handing
    /// each to `sink`. Sleeps briefly between empty polls instead of
    /// blocking; intended for a dedicated non-realtime reader thread.
    /// Returns when `running` turns false, joining cleanly.
    ///
    /// Grounded on `RingBufferManager::readerLoop`.
    pub fn run_reader_loop(&mut self, running: &std::sync::atomic::AtomicBool, mut sink: impl FnMut(&[u8]) -> bool) {
        while running.load(Ordering::Relaxed) {
            let Some(chunk) = self.pop() else {
                thread::sleep(Duration::from_micros(50));
                continue;
            };

            let mut offset = 0;
            while offset < chunk.audio.len() {
                let end = (offset + READER_SLICE_BYTES).min(chunk.audio.len());
                let slice = &chunk.audio[offset..end];
                if sink(slice) {
                    offset = end;
                } else {
                    thread::sleep(Duration::from_micros(10));
                }
            }
        }
    }
}

// SAFETY: `ShmConsumer` only ever touches the read side of the
// push/pop protocol; the `Arc<ShmRingInner>` keeps the mapping alive.
unsafe impl Send for ShmConsumer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    fn ts(seed: u32) -> ShmTimeStamp {
        ShmTimeStamp { host_time_ns: 0, sample_time: 0, seed }
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert_eq!(ShmRing::create(0).unwrap_err(), TransportError::BadArgument);
        assert_eq!(ShmRing::create(3).unwrap_err(), TransportError::BadArgument);
    }

    #[test]
    fn lock_in_memory_does_not_panic() {
        let (producer, consumer) = ShmRing::create(4).unwrap();
        let _ = producer.lock_in_memory();
        let _ = consumer.lock_in_memory();
    }

    #[test]
    fn basic_push_pop_round_trip() {
        let (mut producer, mut consumer) = ShmRing::create(4).unwrap();
        assert!(producer.push(ts(1), 2, &[1, 2, 3, 4]));

        let chunk = consumer.pop().unwrap();
        assert_eq!(chunk.frame_count, 2);
        assert_eq!(chunk.audio, vec![1, 2, 3, 4]);
        assert_eq!(chunk.time_stamp.seed, 1);
    }

    /// S3 — SPSC overrun/underrun accounting.
    #[test]
    fn s3_overrun_and_underrun_accounting() {
        let (mut producer, mut consumer) = ShmRing::create(4).unwrap();

        for i in 0..4u32 {
            assert!(producer.push(ts(i), 1, &[i as u8]));
        }
        assert!(!producer.push(ts(9), 1, &[9]));
        assert_eq!(producer.overruns(), 1);

        for i in 0..4u32 {
            let chunk = consumer.pop().unwrap();
            assert_eq!(chunk.audio, vec![i as u8]);
        }
        assert!(consumer.pop().is_none());
        assert_eq!(consumer.underruns(), 1);
    }

    #[test]
    fn rejects_payload_larger_than_slot() {
        let (mut producer, _consumer) = ShmRing::create(2).unwrap();
        let oversized = vec![0u8; AUDIO_DATA_BYTES + 1];
        assert!(!producer.push(ts(0), 0, &oversized));
    }

    #[test]
    fn attach_with_mismatched_header_fails() {
        let capacity = 4;
        let size = ShmRing::region_size(capacity);
        let layout = Layout::from_size_align(size, 64).unwrap();
        // SAFETY: freshly allocated for this test, freed below via Vec<u8> drop equivalent.
        let base = unsafe { NonNull::new(alloc_zeroed(layout)).unwrap() };

        // SAFETY: region is exactly `size` bytes, `true` initializes the header.
        let (_producer, _consumer) = unsafe { ShmRing::attach(base, capacity, true).unwrap() };

        // A second attach as non-creator with a different capacity must
        // see the ABI mismatch rather than silently misreading the ring.
        let result = unsafe { ShmRing::attach(base, capacity * 2, false) };
        assert_eq!(result.unwrap_err(), TransportError::AbiMismatch);

        // SAFETY: matches the `alloc_zeroed` call above; no `ShmRing`
        // retains this pointer since both attach calls' handles were
        // dropped (the failed one never constructed any).
        unsafe { dealloc(base.as_ptr(), layout) };
    }

    /// §8 property 4 (liveness), cross-process-shaped: two threads
    /// sharing one `Arc`-backed region rather than two processes sharing
    /// an `mmap`, but exercising the identical push/pop protocol.
    #[test]
    fn liveness_all_chunks_delivered_in_order() {
        let (mut producer, mut consumer) = ShmRing::create(16).unwrap();
        let num_chunks = 5_000u32;

        let producer_thread = thread::spawn(move || {
            for i in 0..num_chunks {
                while !producer.push(ts(i), 1, &i.to_le_bytes()) {
                    thread::yield_now();
                }
            }
        });

        let consumer_thread = thread::spawn(move || {
            let mut received = Vec::with_capacity(num_chunks as usize);
            while received.len() < num_chunks as usize {
                if let Some(chunk) = consumer.pop() {
                    received.push(chunk.time_stamp.seed);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer_thread.join().unwrap();
        let received = consumer_thread.join().unwrap();

        assert_eq!(received.len(), num_chunks as usize);
        for (i, &seed) in received.iter().enumerate() {
            assert_eq!(seed, i as u32);
        }
    }

    /// §8 property 5 (safety): fault-inject a delayed `sequence` store —
    /// a consumer racing ahead of a producer that reserved a slot but
    /// hasn't published yet must see `pop` return `None`, never torn data.
    #[test]
    fn pop_refuses_reserved_but_unpublished_slot() {
        let (producer, mut consumer) = ShmRing::create(4).unwrap();

        // Reserve the slot (advance write_index) without storing `sequence`,
        // simulating a producer paused between steps 4 and 5 of `push`.
        let control = producer.inner.layout.control();
        control.write_index.store(1, Ordering::Release);

        assert!(consumer.pop().is_none());
        assert_eq!(control.read_index.load(Ordering::Relaxed), 0);

        // Once the producer finishes publishing, pop succeeds.
        let slot_ptr = producer.inner.layout.slot_ptr(0);
        // SAFETY: no other reference to this slot is live at this point.
        unsafe { (*slot_ptr).sequence.store(1, Ordering::Release) };
        assert!(consumer.pop().is_some());
    }

    #[test]
    fn reader_loop_slices_into_fixed_packets_and_stops_cleanly() {
        let (mut producer, mut consumer) = ShmRing::create(4).unwrap();
        let payload = vec![7u8; READER_SLICE_BYTES * 3 + 10];
        assert!(producer.push(ts(0), 1, &payload));

        let running = Arc::new(AtomicBool::new(true));
        let running_reader = Arc::clone(&running);
        let slices_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slices_seen_reader = Arc::clone(&slices_seen);

        let reader = thread::spawn(move || {
            consumer.run_reader_loop(&running_reader, |slice| {
                slices_seen_reader.lock().unwrap().push(slice.len());
                true
            });
        });

        // Give the reader a moment to drain the one chunk, then stop it.
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Relaxed);
        reader.join().unwrap();

        let seen = slices_seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[READER_SLICE_BYTES, READER_SLICE_BYTES, READER_SLICE_BYTES, 10]);
    }
}
