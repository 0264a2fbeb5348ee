//! Lock-free single-producer single-consumer ring buffer.
//!
//! Realtime-safe intra-process channel: the runloop (bus-callback)
//! thread can push without ever blocking, locking, or allocating. Used
//! for handoff that stays within one process (e.g. message-callback
//! events); `isoch_shm::ShmRing` is the cross-process counterpart and
//! follows the same push/pop protocol over a different memory layout.

use core::{cell::UnsafeCell, mem::MaybeUninit};
#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::cache::CachePadded;

struct SpscRingInner<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    mask: usize,
    head: CachePadded<AtomicUsize>, // write position (producer)
    tail: CachePadded<AtomicUsize>, // read position (consumer)
}

// SAFETY: access to `buffer` is synchronized through the head/tail atomics;
// only the producer ever writes a given slot, only the consumer ever reads it.
unsafe impl<T: Send> Send for SpscRingInner<T> {}
unsafe impl<T: Send> Sync for SpscRingInner<T> {}

impl<T> SpscRingInner<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1);
        let mask = capacity - 1;

        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl<T> Drop for SpscRingInner<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        for i in tail..head {
            let index = i & self.mask;
            // SAFETY: elements between tail and head are initialized.
            unsafe {
                let ptr = (*self.buffer[index].get()).as_mut_ptr();
                core::ptr::drop_in_place(ptr);
            }
        }
    }
}

/// Factory for creating producer/consumer pairs.
pub struct SpscRing;

impl SpscRing {
    /// Creates a new SPSC ring with the given capacity, rounded up to the
    /// next power of two, returning a `(Producer, Consumer)` pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use isoch_core::spsc::SpscRing;
    ///
    /// let (mut producer, mut consumer) = SpscRing::new::<i32>(4);
    /// producer.try_push(42).unwrap();
    /// assert_eq!(consumer.try_pop(), Some(42));
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
        let inner = Arc::new(SpscRingInner::new(capacity));
        (Producer { inner: Arc::clone(&inner) }, Consumer { inner })
    }
}

/// Producer handle. `Send` but not `Clone` — only one producer may exist.
pub struct Producer<T> {
    inner: Arc<SpscRingInner<T>>,
}

// SAFETY: Producer can be sent to another thread if T: Send.
unsafe impl<T: Send> Send for Producer<T> {}

impl<T> Producer<T> {
    /// Push a value. Never blocks; returns `Err(value)` if full.
    #[inline]
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.inner.capacity {
            return Err(value);
        }

        let index = head & self.inner.mask;
        // SAFETY: space was verified above, and only the producer writes this slot.
        unsafe {
            (*self.inner.buffer[index].get()).write(value);
        }

        self.inner.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Approximate occupancy; may be stale by the time it's read.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Consumer handle. `Send` but not `Clone` — only one consumer may exist.
pub struct Consumer<T> {
    inner: Arc<SpscRingInner<T>>,
}

// SAFETY: Consumer can be sent to another thread if T: Send.
unsafe impl<T: Send> Send for Consumer<T> {}

impl<T> Consumer<T> {
    /// Pop a value. Never blocks; returns `None` if empty.
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);

        if tail >= head {
            return None;
        }

        let index = tail & self.inner.mask;
        // SAFETY: data presence was verified above, and only the consumer reads this slot.
        let value = unsafe { (*self.inner.buffer[index].get()).assume_init_read() };

        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::{rc::Rc, thread};

    use super::*;

    #[test]
    fn basic_push_pop() {
        let (mut producer, mut consumer) = SpscRing::new::<i32>(4);

        assert!(producer.try_push(1).is_ok());
        assert!(producer.try_push(2).is_ok());
        assert!(producer.try_push(3).is_ok());

        assert_eq!(consumer.try_pop(), Some(1));
        assert_eq!(consumer.try_pop(), Some(2));
        assert_eq!(consumer.try_pop(), Some(3));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn full_buffer_rejects_push() {
        let (mut producer, _consumer) = SpscRing::new::<i32>(4);

        assert!(producer.try_push(1).is_ok());
        assert!(producer.try_push(2).is_ok());
        assert!(producer.try_push(3).is_ok());
        assert!(producer.try_push(4).is_ok());
        assert!(producer.is_full());

        assert_eq!(producer.try_push(5), Err(5));
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let (producer, _consumer) = SpscRing::new::<i32>(3);
        assert_eq!(producer.capacity(), 4);

        let (producer, _consumer) = SpscRing::new::<i32>(5);
        assert_eq!(producer.capacity(), 8);

        let (producer, _consumer) = SpscRing::new::<i32>(0);
        assert_eq!(producer.capacity(), 1);
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut producer, mut consumer) = SpscRing::new::<i32>(4);

        for round in 0..10 {
            for i in 0..4 {
                assert!(producer.try_push(round * 10 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(consumer.try_pop(), Some(round * 10 + i));
            }
        }
    }

    /// §8 property 4: SPSC liveness — M >> capacity items delivered in order, no duplicates.
    #[test]
    fn liveness_all_items_delivered_in_order() {
        let (mut producer, mut consumer) = SpscRing::new::<i32>(64);
        let num_items = 20_000;

        let producer_thread = thread::spawn(move || {
            for i in 0..num_items {
                while producer.try_push(i).is_err() {
                    thread::yield_now();
                }
            }
        });

        let consumer_thread = thread::spawn(move || {
            let mut received = Vec::with_capacity(num_items as usize);
            while received.len() < num_items as usize {
                if let Some(value) = consumer.try_pop() {
                    received.push(value);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer_thread.join().unwrap();
        let received = consumer_thread.join().unwrap();

        assert_eq!(received.len(), num_items as usize);
        for (i, &value) in received.iter().enumerate() {
            assert_eq!(value, i as i32);
        }
    }

    #[test]
    fn drop_runs_for_remaining_items() {
        let counter = Rc::new(());

        {
            let (mut producer, _consumer) = SpscRing::new::<Rc<()>>(4);
            producer.try_push(Rc::clone(&counter)).unwrap();
            producer.try_push(Rc::clone(&counter)).unwrap();
            producer.try_push(Rc::clone(&counter)).unwrap();
            assert_eq!(Rc::strong_count(&counter), 4);
        }

        assert_eq!(Rc::strong_count(&counter), 1);
    }
}

#[cfg(loom)]
mod loom_tests {
    use loom::thread;

    use super::*;

    #[test]
    fn loom_concurrent_push_pop() {
        loom::model(|| {
            let (mut producer, mut consumer) = SpscRing::new::<i32>(2);

            let producer_thread = thread::spawn(move || {
                let _ = producer.try_push(1);
                let _ = producer.try_push(2);
            });

            let consumer_thread = thread::spawn(move || {
                let mut received = Vec::new();
                for _ in 0..2 {
                    if let Some(v) = consumer.try_pop() {
                        received.push(v);
                    }
                }
                received
            });

            producer_thread.join().unwrap();
            let _received = consumer_thread.join().unwrap();
        });
    }
}
