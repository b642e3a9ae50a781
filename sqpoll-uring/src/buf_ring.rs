//! Provided buffers.
//!
//! A [`ProvidedBufferPool`] is a ring of [`BufferDescriptor`]s for one buffer
//! group, backed by a page-aligned arena the pool owns. Receive operations
//! that set `BUFFER_SELECT` draw their destination buffer from the ring of
//! their group instead of bringing their own.
//!
//! The ring is split the same way every ring in this crate is:
//!
//! - the application keeps the [`ProvidedBufferPool`] (producer side) and
//!   uses it to [`replenish`](ProvidedBufferPool::replenish) and
//!   [`release`](ProvidedBufferPool::release) buffers, and to read the data of
//!   buffers handed to it by completions;
//! - the engine keeps the [`BufferSelector`] (consumer side), registered
//!   with [`crate::Engine::register_buffers`], and selects from it on the
//!   poller thread.
//!
//! Selection on the poller is two-phase: the operation peeks the head
//! descriptor, receives into it, and only commits (advances the head) if
//! the receive produced data. A receive that would block thus leaves the
//! buffer available.
//!
//! A buffer is *issued* from the moment a selection commits it until the
//! application releases it. Issued ids are tracked in an atomic bitmap so
//! that [`ProvidedBufferPool::release`] can reject ids that were never
//! issued or were already released. A second bitmap tracks the ids sitting
//! in the ring, so [`ProvidedBufferPool::replenish`] can refuse an id the
//! pool already holds or has lent out. Every id is thus free, in the ring
//! or issued, never two of those at once.

use std::{
    alloc::Layout,
    collections::HashMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tracing::{debug, trace};

use crate::{
    ring::{self, RingError},
    system::completion::CompletionEntry,
};

/// Alignment of the backing arena.
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no buffer available in group {group}")]
    PoolEmpty { group: u16 },
    #[error("buffer ring of group {group} is full")]
    PoolFull { group: u16 },
    #[error("buffer {id} of group {group} is not issued")]
    InvalidRelease { group: u16, id: u16 },
    #[error("no buffer ring registered for group {group}")]
    UnknownGroup { group: u16 },
    #[error("a buffer ring is already registered for group {group}")]
    GroupAlreadyRegistered { group: u16 },
    #[error("buffer {id} of group {group} is already in the ring or issued")]
    AlreadyProvided { group: u16, id: u16 },
    #[error("descriptor {id} does not belong to group {group}")]
    ForeignDescriptor { group: u16, id: u16 },
    #[error("completion for tag {user_tag} carries no buffer")]
    NoBufferInCompletion { user_tag: u64 },
    #[error("invalid buffer geometry: {count} buffers of {len} bytes")]
    InvalidGeometry { count: u16, len: u32 },
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// One provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub id: u16,
    pub addr: *mut u8,
    pub len: u32,
    pub group: u16,
}

// SAFETY: the pointer targets the arena of the pool that created the
// descriptor; access to the memory is governed by the available/issued
// protocol described in the module docs, not by who holds the descriptor.
unsafe impl Send for BufferDescriptor {}
unsafe impl Sync for BufferDescriptor {}

impl BufferDescriptor {
    /// # Safety
    ///
    /// The caller must own the buffer: it must have peeked or selected it
    /// from the ring and not yet handed it back, and the pool's arena must
    /// still be alive.
    pub(crate) unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.addr, self.len as usize)
    }
}

struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(size: usize) -> Option<Arena> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // SAFETY: size is non-zero, checked by the caller.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        Some(Arena {
            ptr: NonNull::new(ptr)?,
            layout,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in Arena::new with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Atomic bitmap of buffer ids.
struct IdSet(Box<[AtomicU64]>);

impl IdSet {
    fn new(count: u16) -> Self {
        IdSet((0..(count as usize).div_ceil(64)).map(|_| AtomicU64::new(0)).collect())
    }
    fn word_bit(id: u16) -> (usize, u64) {
        (id as usize / 64, 1 << (id % 64))
    }
    /// Returns whether the bit was previously clear.
    fn set(&self, id: u16) -> bool {
        let (word, bit) = Self::word_bit(id);
        self.0[word].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }
    /// Returns whether the bit was previously set.
    fn clear(&self, id: u16) -> bool {
        let (word, bit) = Self::word_bit(id);
        self.0[word].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
    fn is_set(&self, id: u16) -> bool {
        let (word, bit) = Self::word_bit(id);
        self.0[word].load(Ordering::Acquire) & bit != 0
    }
    fn count(&self) -> usize {
        self.0
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

struct Shared {
    group: u16,
    count: u16,
    buf_len: u32,
    arena: Arena,
    /// Set on replenish or release before the descriptor is published,
    /// cleared by the selector after it marks the id issued.
    in_ring: IdSet,
    issued: IdSet,
}

// SAFETY: the arena is only accessed through descriptors, see BufferDescriptor.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn descriptor(&self, id: u16) -> Option<BufferDescriptor> {
        if id >= self.count {
            return None;
        }
        let offset = id as usize * self.buf_len as usize;
        Some(BufferDescriptor {
            id,
            // SAFETY: offset is within the arena, id < count.
            addr: unsafe { self.arena.ptr.as_ptr().add(offset) },
            len: self.buf_len,
            group: self.group,
        })
    }

    fn validate(&self, desc: &BufferDescriptor) -> Result<(), PoolError> {
        match self.descriptor(desc.id) {
            Some(ours) if ours == *desc => Ok(()),
            _ => Err(PoolError::ForeignDescriptor {
                group: self.group,
                id: desc.id,
            }),
        }
    }
}

/// Application side of a buffer group. See module docs.
pub struct ProvidedBufferPool {
    shared: Arc<Shared>,
    producer: ring::Producer<BufferDescriptor>,
}

/// Engine side of a buffer group. See module docs.
pub struct BufferSelector {
    shared: Arc<Shared>,
    consumer: ring::Consumer<BufferDescriptor>,
}

impl ProvidedBufferPool {
    /// Allocate `count` buffers of `buf_len` bytes for `group`.
    ///
    /// The ring gets `count.next_power_of_two()` entries and starts out empty;
    /// use [`Self::provide_all`] or [`Self::replenish`] to make buffers available.
    pub fn new(
        group: u16,
        count: u16,
        buf_len: u32,
    ) -> Result<(ProvidedBufferPool, BufferSelector), PoolError> {
        let geometry = PoolError::InvalidGeometry {
            count,
            len: buf_len,
        };
        if count == 0 || buf_len == 0 {
            return Err(geometry);
        }
        let (producer, consumer) = ring::new((count as u32).next_power_of_two())?;
        let arena = (count as usize)
            .checked_mul(buf_len as usize)
            .and_then(Arena::new)
            .ok_or(geometry)?;
        let shared = Arc::new(Shared {
            group,
            count,
            buf_len,
            arena,
            in_ring: IdSet::new(count),
            issued: IdSet::new(count),
        });
        debug!(group, count, buf_len, "allocated provided buffers");
        Ok((
            ProvidedBufferPool {
                shared: Arc::clone(&shared),
                producer,
            },
            BufferSelector { shared, consumer },
        ))
    }

    pub fn group(&self) -> u16 {
        self.shared.group
    }

    /// Ring capacity; a power of two.
    pub fn capacity(&self) -> usize {
        self.producer.capacity()
    }

    pub fn buffer_count(&self) -> u16 {
        self.shared.count
    }

    pub fn buffer_len(&self) -> u32 {
        self.shared.buf_len
    }

    /// Buffers currently in the ring, i.e. selectable by the engine.
    pub fn available_count(&self) -> usize {
        self.producer.len()
    }

    /// Buffers handed out by completions and not yet released.
    pub fn issued_count(&self) -> usize {
        self.shared.issued.count()
    }

    pub fn descriptor(&self, id: u16) -> Option<BufferDescriptor> {
        self.shared.descriptor(id)
    }

    pub fn replenish(&mut self, desc: BufferDescriptor) -> Result<(), PoolError> {
        self.replenish_batch(&[desc])
    }

    /// Add several descriptors and publish them with one tail update.
    ///
    /// Nothing is published if any descriptor is foreign, already in the
    /// ring or issued, named twice, or if they don't all fit.
    pub fn replenish_batch(&mut self, descs: &[BufferDescriptor]) -> Result<(), PoolError> {
        let group = self.shared.group;
        for desc in descs {
            self.shared.validate(desc)?;
        }
        for (i, desc) in descs.iter().enumerate() {
            // in_ring first: the selector sets issued before clearing it
            let claimed = self.shared.in_ring.set(desc.id);
            if !claimed || self.shared.issued.is_set(desc.id) {
                let marked = if claimed { &descs[..=i] } else { &descs[..i] };
                self.unmark(marked);
                return Err(PoolError::AlreadyProvided { group, id: desc.id });
            }
        }
        if self.producer.push_batch(descs).is_err() {
            self.unmark(descs);
            return Err(PoolError::PoolFull { group });
        }
        trace!(group, n = descs.len(), "replenished");
        Ok(())
    }

    fn unmark(&self, descs: &[BufferDescriptor]) {
        for desc in descs {
            self.shared.in_ring.clear(desc.id);
        }
    }

    /// Make every buffer of the arena available, in id order.
    pub fn provide_all(&mut self) -> Result<(), PoolError> {
        let descs: Vec<_> = (0..self.shared.count)
            .filter_map(|id| self.shared.descriptor(id))
            .collect();
        self.replenish_batch(&descs)
    }

    /// Hand an issued buffer back to the ring.
    pub fn release(&mut self, id: u16) -> Result<(), PoolError> {
        let group = self.shared.group;
        let desc = self
            .shared
            .descriptor(id)
            .ok_or(PoolError::InvalidRelease { group, id })?;
        if !self.shared.issued.is_set(id) {
            return Err(PoolError::InvalidRelease { group, id });
        }
        self.shared.in_ring.set(id);
        self.shared.issued.clear(id);
        if self.producer.push(desc).is_err() {
            self.shared.issued.set(id);
            self.shared.in_ring.clear(id);
            return Err(PoolError::PoolFull { group });
        }
        trace!(group, id, "released");
        Ok(())
    }

    /// Bytes received into the buffer named by `cqe`.
    ///
    /// Fails unless the completion carries a buffer id of this pool that is
    /// currently issued.
    pub fn buffer(&self, cqe: &CompletionEntry) -> Result<&[u8], PoolError> {
        let id = cqe.buffer_id.ok_or(PoolError::NoBufferInCompletion {
            user_tag: cqe.user_tag,
        })?;
        let len = usize::try_from(cqe.result).unwrap_or(0);
        self.issued_buffer(id, len)
    }

    /// The first `len` bytes of issued buffer `id`.
    pub fn issued_buffer(&self, id: u16, len: usize) -> Result<&[u8], PoolError> {
        let group = self.shared.group;
        let desc = self
            .shared
            .descriptor(id)
            .filter(|_| self.shared.issued.is_set(id))
            .ok_or(PoolError::InvalidRelease { group, id })?;
        let len = len.min(desc.len as usize);
        // SAFETY: the buffer is issued, so the engine won't write into it until
        // it is released, which needs `&mut self` and thus ends this borrow.
        Ok(unsafe { std::slice::from_raw_parts(desc.addr, len) })
    }
}

impl BufferSelector {
    pub fn group(&self) -> u16 {
        self.shared.group
    }

    pub fn available_count(&self) -> usize {
        self.consumer.len()
    }

    /// The descriptor the next selection would return, without taking it.
    pub(crate) fn peek(&self) -> Option<BufferDescriptor> {
        self.consumer.peek(0)
    }

    /// Take the descriptor returned by the preceding [`Self::peek`].
    pub(crate) fn commit(&mut self, desc: BufferDescriptor) {
        debug_assert_eq!(self.consumer.peek(0), Some(desc));
        self.consumer.advance(1);
        let was_clear = self.shared.issued.set(desc.id);
        debug_assert!(was_clear, "buffer {} issued twice", desc.id);
        self.shared.in_ring.clear(desc.id);
    }

    /// Remove and return the oldest available descriptor.
    pub fn select(&mut self) -> Result<BufferDescriptor, PoolError> {
        let desc = self.peek().ok_or(PoolError::PoolEmpty {
            group: self.shared.group,
        })?;
        self.commit(desc);
        Ok(desc)
    }
}

/// The engine's table of registered buffer groups.
#[derive(Default)]
pub(crate) struct BufferGroups {
    groups: HashMap<u16, BufferSelector>,
}

impl BufferGroups {
    pub(crate) fn register(&mut self, selector: BufferSelector) -> Result<(), PoolError> {
        let group = selector.group();
        if self.groups.contains_key(&group) {
            return Err(PoolError::GroupAlreadyRegistered { group });
        }
        self.groups.insert(group, selector);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, group: u16) -> Option<BufferSelector> {
        self.groups.remove(&group)
    }

    pub(crate) fn get_mut(&mut self, group: u16) -> Result<&mut BufferSelector, PoolError> {
        self.groups
            .get_mut(&group)
            .ok_or(PoolError::UnknownGroup { group })
    }

    #[cfg(test)]
    pub(crate) fn select(&mut self, group: u16) -> Result<BufferDescriptor, PoolError> {
        self.get_mut(group)?.select()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::completion::{CompletionEntry, CqeFlags};

    fn pool(count: u16) -> (ProvidedBufferPool, BufferSelector) {
        ProvidedBufferPool::new(0, count, 2048).unwrap()
    }

    #[test]
    fn geometry() {
        let (pool, selector) = pool(3);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.buffer_count(), 3);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(selector.available_count(), 0);
        let d0 = pool.descriptor(0).unwrap();
        let d1 = pool.descriptor(1).unwrap();
        assert_eq!(d0.addr as usize % PAGE_SIZE, 0);
        assert_eq!(d1.addr as usize - d0.addr as usize, 2048);
        assert!(pool.descriptor(3).is_none());
        assert!(matches!(
            ProvidedBufferPool::new(0, 0, 2048),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn select_is_fifo() {
        let (mut pool, mut selector) = pool(2);
        pool.provide_all().unwrap();
        assert_eq!(selector.select().unwrap().id, 0);
        assert_eq!(selector.select().unwrap().id, 1);
        assert_eq!(selector.select(), Err(PoolError::PoolEmpty { group: 0 }));
        assert_eq!(pool.issued_count(), 2);
    }

    #[test]
    fn replenish_rejects_available() {
        let (mut pool, mut selector) = pool(3);
        pool.provide_all().unwrap();
        let d0 = pool.descriptor(0).unwrap();
        assert_eq!(
            pool.replenish(d0),
            Err(PoolError::AlreadyProvided { group: 0, id: 0 })
        );
        assert_eq!(pool.available_count(), 3);
        let ids: Vec<_> = (0..4).map(|_| selector.select().map(|d| d.id)).collect();
        assert_eq!(
            ids,
            vec![Ok(0), Ok(1), Ok(2), Err(PoolError::PoolEmpty { group: 0 })]
        );
    }

    #[test]
    fn replenish_rejects_issued() {
        let (mut pool, mut selector) = pool(3);
        pool.provide_all().unwrap();
        let first = selector.select().unwrap();
        assert_eq!(
            pool.replenish(first),
            Err(PoolError::AlreadyProvided { group: 0, id: 0 })
        );
        assert_eq!(pool.available_count(), 2);
        assert_eq!(selector.select().unwrap().id, 1);
        assert_eq!(selector.select().unwrap().id, 2);
        assert_eq!(selector.select(), Err(PoolError::PoolEmpty { group: 0 }));
        // release is the way back
        pool.release(first.id).unwrap();
        assert_eq!(selector.select().unwrap().id, 0);
    }

    #[test]
    fn replenish_batch_is_all_or_nothing() {
        let (mut pool, mut selector) = pool(3);
        let [d0, d1, d2] = [0, 1, 2].map(|id| pool.descriptor(id).unwrap());
        assert_eq!(
            pool.replenish_batch(&[d0, d1, d0]),
            Err(PoolError::AlreadyProvided { group: 0, id: 0 })
        );
        assert_eq!(pool.available_count(), 0);
        pool.replenish_batch(&[d0, d1]).unwrap();
        selector.select().unwrap();
        assert_eq!(
            pool.replenish_batch(&[d2, d0]),
            Err(PoolError::AlreadyProvided { group: 0, id: 0 })
        );
        assert_eq!(pool.available_count(), 1);
        pool.replenish(d2).unwrap();
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn replenish_rejects_foreign() {
        let (mut pool, _selector) = pool(2);
        let (other, _other_selector) = ProvidedBufferPool::new(1, 2, 2048).unwrap();
        let foreign = other.descriptor(0).unwrap();
        assert_eq!(
            pool.replenish(foreign),
            Err(PoolError::ForeignDescriptor { group: 0, id: 0 })
        );
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn release_round_trip() {
        let (mut pool, mut selector) = pool(2);
        pool.provide_all().unwrap();
        let desc = selector.select().unwrap();
        assert_eq!(pool.available_count(), 1);
        pool.release(desc.id).unwrap();
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.issued_count(), 0);
    }

    #[test]
    fn double_release_rejected() {
        let (mut pool, mut selector) = pool(2);
        pool.provide_all().unwrap();
        let desc = selector.select().unwrap();
        pool.release(desc.id).unwrap();
        assert_eq!(
            pool.release(desc.id),
            Err(PoolError::InvalidRelease { group: 0, id: 0 })
        );
        // never issued
        assert_eq!(
            pool.release(1),
            Err(PoolError::InvalidRelease { group: 0, id: 1 })
        );
        // out of range
        assert_eq!(
            pool.release(9),
            Err(PoolError::InvalidRelease { group: 0, id: 9 })
        );
    }

    #[test]
    fn peek_without_commit_keeps_buffer() {
        let (mut pool, mut selector) = pool(1);
        pool.provide_all().unwrap();
        let desc = selector.peek().unwrap();
        assert_eq!(selector.available_count(), 1);
        assert_eq!(pool.issued_count(), 0);
        selector.commit(desc);
        assert_eq!(selector.available_count(), 0);
        assert_eq!(pool.issued_count(), 1);
    }

    #[test]
    fn read_issued_buffer() {
        let (mut pool, mut selector) = pool(2);
        pool.provide_all().unwrap();
        let desc = selector.peek().unwrap();
        unsafe { desc.as_mut_slice()[..3].copy_from_slice(b"abc") };
        selector.commit(desc);
        let cqe = CompletionEntry {
            user_tag: 1,
            result: 3,
            buffer_id: Some(desc.id),
            flags: CqeFlags::MORE | CqeFlags::BUFFER,
        };
        assert_eq!(pool.buffer(&cqe).unwrap(), b"abc");
        // a buffer that is not issued can't be read
        assert!(pool.issued_buffer(1, 3).is_err());
        pool.release(desc.id).unwrap();
        assert!(pool.buffer(&cqe).is_err());
    }

    #[test]
    fn groups_table() {
        let (_pool0, selector0) = pool(1);
        let (_pool0_again, selector0_again) = pool(1);
        let mut groups = BufferGroups::default();
        groups.register(selector0).unwrap();
        assert_eq!(
            groups.register(selector0_again).err(),
            Some(PoolError::GroupAlreadyRegistered { group: 0 })
        );
        assert_eq!(groups.select(0), Err(PoolError::PoolEmpty { group: 0 }));
        assert_eq!(groups.select(5), Err(PoolError::UnknownGroup { group: 5 }));
        assert!(groups.unregister(0).is_some());
        assert_eq!(groups.select(0), Err(PoolError::UnknownGroup { group: 0 }));
    }

    #[test]
    fn cross_thread_select_and_release() {
        let (mut pool, mut selector) = pool(8);
        pool.provide_all().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let poller = std::thread::spawn(move || {
            let mut selected = 0;
            while selected < 1000 {
                match selector.select() {
                    Ok(desc) => {
                        tx.send(desc.id).unwrap();
                        selected += 1;
                    }
                    Err(PoolError::PoolEmpty { .. }) => std::thread::yield_now(),
                    Err(e) => panic!("{e}"),
                }
            }
        });
        for _ in 0..1000 {
            let id = rx.recv().unwrap();
            pool.release(id).unwrap();
        }
        poller.join().unwrap();
        assert_eq!(pool.available_count(), 8);
        assert_eq!(pool.issued_count(), 0);
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        Replenish(u16),
        Select,
        Release(u16),
    }

    fn pool_op(count: u16) -> impl proptest::strategy::Strategy<Value = PoolOp> {
        use proptest::prelude::*;
        prop_oneof![
            (0..count).prop_map(PoolOp::Replenish),
            Just(PoolOp::Select),
            Just(PoolOp::Select),
            (0..count + 2).prop_map(PoolOp::Release),
        ]
    }

    proptest::proptest! {
        #[test]
        fn available_count_accounting(ops in proptest::collection::vec(pool_op(6), 0..200)) {
            let (mut pool, mut selector) = pool(6);
            let mut available = std::collections::VecDeque::new();
            let mut issued = std::collections::HashSet::new();
            let (mut replenished, mut selected, mut released) = (0usize, 0usize, 0usize);
            for op in ops {
                match op {
                    PoolOp::Replenish(id) => {
                        let res = pool.replenish(pool.descriptor(id).unwrap());
                        if available.contains(&id) || issued.contains(&id) {
                            proptest::prop_assert_eq!(res, Err(PoolError::AlreadyProvided { group: 0, id }));
                        } else {
                            proptest::prop_assert_eq!(res, Ok(()));
                            available.push_back(id);
                            replenished += 1;
                        }
                    }
                    PoolOp::Select => match selector.select() {
                        Ok(desc) => {
                            proptest::prop_assert_eq!(Some(desc.id), available.pop_front());
                            issued.insert(desc.id);
                            selected += 1;
                        }
                        Err(e) => {
                            proptest::prop_assert_eq!(e, PoolError::PoolEmpty { group: 0 });
                            proptest::prop_assert!(available.is_empty());
                        }
                    },
                    PoolOp::Release(id) => {
                        let ok = pool.release(id).is_ok();
                        proptest::prop_assert_eq!(ok, issued.remove(&id));
                        if ok {
                            available.push_back(id);
                            released += 1;
                        }
                    }
                }
                proptest::prop_assert_eq!(pool.available_count(), replenished - selected + released);
                proptest::prop_assert!(pool.available_count() <= pool.capacity());
                proptest::prop_assert_eq!(pool.issued_count(), issued.len());
            }
        }
    }
}
