//! Fixed-capacity byte queue between the clock interrupt (single producer)
//! and the polled task (single consumer).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Capacity of the receive queue used by the driver.
pub const RING_SIZE: usize = 16;

/// Lock-free SPSC ring buffer. `N` must be a power of two.
///
/// Indices run freely and are masked on access, so `tail - head` (wrapping)
/// is always the fill level and never exceeds `N`. A full buffer rejects new
/// bytes instead of overwriting old ones.
pub struct RingBuffer<const N: usize = RING_SIZE> {
    buf: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<const N: usize> RingBuffer<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ring buffer size must be a power of two");
        N - 1
    };

    pub fn new() -> Self {
        let _ = Self::MASK;
        Self {
            buf: std::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Producer side. Returns false if the buffer is full.
    pub fn put(&self, byte: u8) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            return false;
        }
        self.buf[tail & Self::MASK].store(byte, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    pub fn get(&self) -> Option<u8> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let byte = self.buf[head & Self::MASK].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Consumer side: discard everything queued so far.
    pub fn reset(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
