//! Fixed-capacity single-producer/single-consumer ring.
//!
//! Every queue in this crate (submission queue, completion queue, provided
//! buffer rings) is one of these. The layout is the one io_uring uses:
//! an arena of `2^n` slots and two free-running `u32` indices. The producer
//! owns the tail, the consumer owns the head, and each side only ever
//! *reads* the other side's index.
//!
//! Ownership of the two roles is expressed in the type system: [`new`]
//! returns a [`Producer`] and a [`Consumer`], neither of which is `Clone`,
//! and every mutating method takes `&mut self`. Indices are wrapped in
//! distinct types ([`Head`], [`Tail`]) so that one role's index cannot be
//! passed where the other's is expected.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crossbeam_utils::CachePadded;

/// Upper bound on ring entries. Same limit as `IORING_MAX_CQ_ENTRIES`.
pub const MAX_ENTRIES: u32 = 1 << 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring must have at least one entry")]
    Empty,
    #[error("ring entries must be a power of two, got {0}")]
    NotPowerOfTwo(u32),
    #[error("ring entries must not exceed 65536, got {0}")]
    TooLarge(u32),
}

/// The producer tried to push into a ring whose free slots are exhausted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("ring is full")]
pub struct Full;

/// Consumer-owned index. Only [`Consumer`] advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head(u32);

/// Producer-owned index. Only [`Producer`] advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail(u32);

impl Tail {
    fn distance_from(self, head: Head) -> u32 {
        self.0.wrapping_sub(head.0)
    }
}

struct RingBuffer<T> {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only by the producer while it lies outside
// `head..tail`, and read only by the consumer while it lies inside. The
// acquire/release pairs on `head` and `tail` order those accesses.
unsafe impl<T: Send> Sync for RingBuffer<T> {}
unsafe impl<T: Send> Send for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    fn capacity(&self) -> u32 {
        self.mask + 1
    }

    fn slot(&self, index: u32) -> *mut MaybeUninit<T> {
        self.slots[(index & self.mask) as usize].get()
    }
}

/// Writing half of a ring.
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
    tail: Tail,
}

/// Reading half of a ring.
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
    head: Head,
}

/// Create a ring with `entries` slots.
///
/// `entries` must be a non-zero power of two no larger than [`MAX_ENTRIES`].
pub fn new<T: Copy + Send>(entries: u32) -> Result<(Producer<T>, Consumer<T>), RingError> {
    if entries == 0 {
        return Err(RingError::Empty);
    }
    if entries > MAX_ENTRIES {
        return Err(RingError::TooLarge(entries));
    }
    if !entries.is_power_of_two() {
        return Err(RingError::NotPowerOfTwo(entries));
    }
    let ring = Arc::new(RingBuffer {
        head: CachePadded::new(AtomicU32::new(0)),
        tail: CachePadded::new(AtomicU32::new(0)),
        mask: entries - 1,
        slots: (0..entries)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect(),
    });
    Ok((
        Producer {
            ring: Arc::clone(&ring),
            tail: Tail(0),
        },
        Consumer { ring, head: Head(0) },
    ))
}

impl<T: Copy> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity() as usize
    }

    /// Number of published entries the consumer has not taken yet.
    pub fn len(&self) -> usize {
        let head = Head(self.ring.head.load(Ordering::Acquire));
        self.tail.distance_from(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_slots(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn tail(&self) -> Tail {
        self.tail
    }

    pub fn push(&mut self, value: T) -> Result<(), Full> {
        self.push_batch(std::slice::from_ref(&value))
    }

    /// Write all of `values` and publish them with a single tail update.
    ///
    /// Either every value is published or, if they don't all fit, none is.
    pub fn push_batch(&mut self, values: &[T]) -> Result<(), Full> {
        if values.len() > self.free_slots() {
            return Err(Full);
        }
        let mut tail = self.tail.0;
        for value in values {
            // SAFETY: the slot lies outside head..tail, the consumer doesn't touch it.
            unsafe { (*self.ring.slot(tail)).write(*value) };
            tail = tail.wrapping_add(1);
        }
        self.tail = Tail(tail);
        self.ring.tail.store(tail, Ordering::Release);
        Ok(())
    }
}

impl<T: Copy> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.ring.capacity() as usize
    }

    /// Number of entries ready to be consumed.
    pub fn len(&self) -> usize {
        let tail = Tail(self.ring.tail.load(Ordering::Acquire));
        tail.distance_from(self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn head(&self) -> Head {
        self.head
    }

    /// Copy out the `nth` ready entry without consuming it.
    pub fn peek(&self, nth: usize) -> Option<T> {
        if nth >= self.len() {
            return None;
        }
        let index = self.head.0.wrapping_add(nth as u32);
        // SAFETY: index lies inside head..tail, so the producer has initialized
        // it and won't overwrite it until we advance past it.
        Some(unsafe { (*self.ring.slot(index)).assume_init_read() })
    }

    /// Release the first `n` ready entries back to the producer.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` entries are ready.
    pub fn advance(&mut self, n: usize) {
        let ready = self.len();
        assert!(n <= ready, "advance by {n} but only {ready} entries are ready");
        let head = self.head.0.wrapping_add(n as u32);
        self.head = Head(head);
        self.ring.head.store(head, Ordering::Release);
    }

    pub fn pop(&mut self) -> Option<T> {
        let value = self.peek(0)?;
        self.advance(1);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_sizes() {
        assert_eq!(new::<u8>(0).err(), Some(RingError::Empty));
        assert_eq!(new::<u8>(3).err(), Some(RingError::NotPowerOfTwo(3)));
        assert_eq!(
            new::<u8>(MAX_ENTRIES * 2).err(),
            Some(RingError::TooLarge(MAX_ENTRIES * 2))
        );
    }

    #[test]
    fn fifo_and_full() {
        let (mut tx, mut rx) = new::<u32>(4).unwrap();
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(4), Err(Full));
        assert_eq!(rx.len(), 4);
        assert_eq!(rx.pop(), Some(0));
        tx.push(4).unwrap();
        let drained: Vec<_> = std::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut tx, mut rx) = new::<u32>(2).unwrap();
        tx.push(7).unwrap();
        assert_eq!(rx.peek(0), Some(7));
        assert_eq!(rx.peek(1), None);
        assert_eq!(rx.len(), 1);
        rx.advance(1);
        assert!(rx.is_empty());
        assert!(tx.is_empty());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (mut tx, rx) = new::<u32>(4).unwrap();
        tx.push(0).unwrap();
        assert_eq!(tx.push_batch(&[1, 2, 3, 4]), Err(Full));
        assert_eq!(rx.len(), 1);
        tx.push_batch(&[1, 2, 3]).unwrap();
        assert_eq!(rx.len(), 4);
        assert_eq!(tx.tail(), Tail(4));
    }

    #[test]
    fn indices_wrap() {
        let (mut tx, mut rx) = new::<u32>(2).unwrap();
        for i in 0..1000 {
            tx.push(i).unwrap();
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.head(), Head(1000));
    }

    #[test]
    #[should_panic(expected = "only 0 entries are ready")]
    fn advance_past_tail_panics() {
        let (_tx, mut rx) = new::<u32>(2).unwrap();
        rx.advance(1);
    }

    #[test]
    fn cross_thread_order() {
        let (mut tx, mut rx) = new::<u64>(8).unwrap();
        let producer = std::thread::spawn(move || {
            let mut next = 0;
            while next < 10_000 {
                if tx.push(next).is_ok() {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut expect = 0;
        while expect < 10_000 {
            match rx.pop() {
                Some(v) => {
                    assert_eq!(v, expect);
                    expect += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
