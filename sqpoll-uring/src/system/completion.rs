//! The completion queue.
//!
//! The poller owns the writing half ([`CompletionPoster`]), the application
//! owns the reading half ([`CompletionSide`]). Completions that don't fit
//! into the ring go into an ordered backlog on the poller side.

use std::{
    collections::VecDeque,
    fmt,
    ops::BitOr,
    sync::{
        atomic::{self, Ordering},
        Arc,
    },
};

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use crate::{config::OverflowPolicy, ring};

use super::{lifecycle::SystemError, sq_flags, Shared};

/// Flags carried by a [`CompletionEntry`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CqeFlags(u32);

impl CqeFlags {
    /// The originating operation is still armed and will post more completions.
    pub const MORE: CqeFlags = CqeFlags(1 << 1);
    /// `buffer_id` names a provided buffer that now belongs to the application.
    pub const BUFFER: CqeFlags = CqeFlags(1 << 0);

    pub const fn empty() -> Self {
        CqeFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: CqeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CqeFlags {
    type Output = CqeFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        CqeFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CqeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::BUFFER) {
            set.entry(&"BUFFER");
        }
        if self.contains(Self::MORE) {
            set.entry(&"MORE");
        }
        set.finish()
    }
}

/// One completion record.
///
/// `result` is a byte count when non-negative and a negated errno otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub user_tag: u64,
    pub result: i32,
    pub buffer_id: Option<u16>,
    pub flags: CqeFlags,
}

impl CompletionEntry {
    pub(crate) fn new(user_tag: u64, result: i32) -> Self {
        CompletionEntry {
            user_tag,
            result,
            buffer_id: None,
            flags: CqeFlags::empty(),
        }
    }

    pub(crate) fn error(user_tag: u64, errno: Errno) -> Self {
        Self::new(user_tag, -(errno as i32))
    }

    pub(crate) fn with_buffer(user_tag: u64, len: usize, buffer_id: u16, more: bool) -> Self {
        let flags = if more {
            CqeFlags::BUFFER | CqeFlags::MORE
        } else {
            CqeFlags::BUFFER
        };
        CompletionEntry {
            user_tag,
            result: i32::try_from(len).unwrap_or(i32::MAX),
            buffer_id: Some(buffer_id),
            flags,
        }
    }

    /// Whether the originating operation is still armed.
    pub fn is_more(&self) -> bool {
        self.flags.contains(CqeFlags::MORE)
    }

    /// Decode `result`: the number of bytes received, or why the operation ended.
    pub fn outcome(&self) -> Result<usize, CompletionError> {
        match CompletionError::from_result(self.result) {
            Some(err) => Err(err),
            None => Ok(self.result as usize),
        }
    }
}

/// A negative [`CompletionEntry::result`], decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("no provided buffer available in the group")]
    NoBuffers,
    #[error("operation was canceled")]
    Canceled,
    #[error("no operation matched the cancel request")]
    NotFound,
    #[error("invalid submission")]
    InvalidArgument,
    #[error("transport error: {0}")]
    Transport(Errno),
}

impl CompletionError {
    pub fn from_result(result: i32) -> Option<Self> {
        if result >= 0 {
            return None;
        }
        Some(match Errno::from_i32(-result) {
            Errno::ENOBUFS => CompletionError::NoBuffers,
            Errno::ECANCELED => CompletionError::Canceled,
            Errno::ENOENT => CompletionError::NotFound,
            Errno::EINVAL => CompletionError::InvalidArgument,
            other => CompletionError::Transport(other),
        })
    }

    pub fn errno(&self) -> Errno {
        match self {
            CompletionError::NoBuffers => Errno::ENOBUFS,
            CompletionError::Canceled => Errno::ECANCELED,
            CompletionError::NotFound => Errno::ENOENT,
            CompletionError::InvalidArgument => Errno::EINVAL,
            CompletionError::Transport(errno) => *errno,
        }
    }
}

/// Application half of the completion queue.
pub(crate) struct CompletionSide {
    cq: ring::Consumer<CompletionEntry>,
    shared: Arc<Shared>,
}

impl CompletionSide {
    pub(crate) fn new(cq: ring::Consumer<CompletionEntry>, shared: Arc<Shared>) -> Self {
        CompletionSide { cq, shared }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cq.capacity()
    }

    pub(crate) fn ready(&self) -> usize {
        self.cq.len()
    }

    pub(crate) fn next(&mut self) -> Option<CompletionEntry> {
        let cqe = self.cq.pop()?;
        self.space_freed();
        Some(cqe)
    }

    pub(crate) fn peek_batch(&mut self, max: usize) -> CqeBatch<'_> {
        CqeBatch {
            side: self,
            max,
            yielded: 0,
        }
    }

    /// # Panics
    ///
    /// Panics if fewer than `n` completions are ready.
    pub(crate) fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.cq.advance(n);
        self.space_freed();
    }

    /// Wait until at least `nr` completions are ready.
    ///
    /// Fails right away if `nr` exceeds the queue capacity.
    pub(crate) async fn wait_nr(&self, nr: usize) -> Result<(), SystemError> {
        let capacity = self.capacity();
        if nr > capacity {
            return Err(SystemError::WaitExceedsCapacity { nr, capacity });
        }
        loop {
            let notified = self.shared.cq_ready.notified();
            if self.ready() >= nr {
                return Ok(());
            }
            if self.shared.has_flag(sq_flags::POLLER_EXITED) {
                return Err(SystemError::PollerExited);
            }
            notified.await;
        }
    }

    fn space_freed(&self) {
        // Paired with the fence on the poller before it re-checks free slots.
        atomic::fence(Ordering::SeqCst);
        if self.shared.has_flag(sq_flags::CQ_OVERFLOW | sq_flags::CQ_FULL) {
            self.shared.cq_space.notify_one();
        }
    }
}

/// Up to `max` ready completions, read in place.
///
/// Iterating doesn't consume anything. Call [`CqeBatch::ack`] to release the
/// entries that were yielded; dropping the batch without acknowledging leaves
/// them in the queue.
pub struct CqeBatch<'a> {
    side: &'a mut CompletionSide,
    max: usize,
    yielded: usize,
}

impl Iterator for CqeBatch<'_> {
    type Item = CompletionEntry;

    fn next(&mut self) -> Option<CompletionEntry> {
        if self.yielded >= self.max {
            return None;
        }
        let cqe = self.side.cq.peek(self.yielded)?;
        self.yielded += 1;
        Some(cqe)
    }
}

impl CqeBatch<'_> {
    /// Release every entry yielded so far. Returns how many that was.
    pub fn ack(self) -> usize {
        let n = self.yielded;
        self.side.advance(n);
        n
    }
}

/// Poller half of the completion queue.
pub(crate) struct CompletionPoster {
    cq: ring::Producer<CompletionEntry>,
    backlog: VecDeque<CompletionEntry>,
    policy: OverflowPolicy,
    shared: Arc<Shared>,
}

impl CompletionPoster {
    pub(crate) fn new(
        cq: ring::Producer<CompletionEntry>,
        policy: OverflowPolicy,
        shared: Arc<Shared>,
    ) -> Self {
        CompletionPoster {
            cq,
            backlog: VecDeque::new(),
            policy,
            shared,
        }
    }

    /// Post a completion. Never drops it: if the ring is full it's appended
    /// to the backlog, and once a backlog exists everything goes behind it.
    pub(crate) fn post(&mut self, cqe: CompletionEntry) {
        trace!(?cqe, "post");
        self.shared.metrics.cqes_posted.fetch_add(1, Ordering::Relaxed);
        if self.backlog.is_empty() && self.cq.push(cqe).is_ok() {
            self.shared.cq_ready.notify_one();
            return;
        }
        if self.backlog.is_empty() {
            warn!(
                capacity = self.cq.capacity(),
                "completion queue full, keeping completions in the overflow backlog"
            );
            self.shared.set_flag(sq_flags::CQ_OVERFLOW);
        }
        self.backlog.push_back(cqe);
        self.shared.metrics.cq_overflows.fetch_add(1, Ordering::Relaxed);
        self.shared
            .overflow_pending
            .store(self.backlog.len(), Ordering::Relaxed);
    }

    /// Move as much of the backlog into the ring as fits, oldest first.
    pub(crate) fn flush_backlog(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(&cqe) = self.backlog.front() {
            if self.cq.push(cqe).is_err() {
                break;
            }
            self.backlog.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            self.shared
                .overflow_pending
                .store(self.backlog.len(), Ordering::Relaxed);
            if self.backlog.is_empty() {
                debug!(flushed, "overflow backlog drained");
                self.shared.clear_flag(sq_flags::CQ_OVERFLOW);
            }
            self.shared.cq_ready.notify_one();
        }
        flushed
    }

    pub(crate) fn is_backlogged(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cq.capacity()
    }

    /// Whether `n` more completions may be produced now.
    ///
    /// Under [`OverflowPolicy::Backlog`] always true. Under
    /// [`OverflowPolicy::Block`] only if they fit into the ring.
    pub(crate) fn may_post(&self, n: usize) -> bool {
        match self.policy {
            OverflowPolicy::Backlog => true,
            OverflowPolicy::Block => self.backlog.is_empty() && self.cq.free_slots() >= n,
        }
    }

    pub(crate) fn into_backlog(self) -> Vec<CompletionEntry> {
        self.backlog.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(entries: u32, policy: OverflowPolicy) -> (CompletionPoster, CompletionSide) {
        let shared = Arc::new(Shared::new(0));
        let (tx, rx) = ring::new(entries).unwrap();
        (
            CompletionPoster::new(tx, policy, Arc::clone(&shared)),
            CompletionSide::new(rx, shared),
        )
    }

    #[test]
    fn decode_results() {
        assert_eq!(CompletionEntry::new(1, 5).outcome(), Ok(5));
        assert_eq!(
            CompletionEntry::error(1, Errno::ENOBUFS).outcome(),
            Err(CompletionError::NoBuffers)
        );
        assert_eq!(
            CompletionEntry::error(1, Errno::ECONNRESET).outcome(),
            Err(CompletionError::Transport(Errno::ECONNRESET))
        );
        assert_eq!(CompletionError::Canceled.errno(), Errno::ECANCELED);
        let cqe = CompletionEntry::with_buffer(3, 1, 0, true);
        assert!(cqe.is_more());
        assert_eq!(cqe.flags, CqeFlags::MORE | CqeFlags::BUFFER);
        assert_eq!(format!("{:?}", cqe.flags), r#"{"BUFFER", "MORE"}"#);
    }

    #[test]
    fn batch_without_ack_is_restartable() {
        let (mut poster, mut side) = pair(4, OverflowPolicy::Backlog);
        for tag in 0..3 {
            poster.post(CompletionEntry::new(tag, 0));
        }
        let seen: Vec<_> = side.peek_batch(8).map(|c| c.user_tag).collect();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(side.ready(), 3);

        let mut batch = side.peek_batch(2);
        assert_eq!(batch.next().map(|c| c.user_tag), Some(0));
        assert_eq!(batch.ack(), 1);
        assert_eq!(side.ready(), 2);

        let batch = side.peek_batch(8);
        assert_eq!(batch.count(), 2);
        assert_eq!(side.next().map(|c| c.user_tag), Some(1));
        side.advance(1);
        assert_eq!(side.ready(), 0);
    }

    #[test]
    fn backlog_keeps_order() {
        let (mut poster, mut side) = pair(2, OverflowPolicy::Backlog);
        for tag in 0..5 {
            poster.post(CompletionEntry::new(tag, 0));
        }
        assert!(poster.is_backlogged());
        assert!(side.shared.has_flag(sq_flags::CQ_OVERFLOW));
        assert_eq!(side.shared.overflow_pending.load(Ordering::Relaxed), 3);
        assert_eq!(side.shared.metrics.cq_overflows.load(Ordering::Relaxed), 3);

        let mut got = Vec::new();
        while got.len() < 5 {
            poster.flush_backlog();
            got.extend(side.next().map(|c| c.user_tag));
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(!poster.is_backlogged());
        assert!(!side.shared.has_flag(sq_flags::CQ_OVERFLOW));
    }

    #[test]
    fn new_completions_go_behind_backlog() {
        let (mut poster, mut side) = pair(2, OverflowPolicy::Backlog);
        for tag in 0..3 {
            poster.post(CompletionEntry::new(tag, 0));
        }
        side.advance(2);
        // Space is free now, but tag 2 is still backlogged.
        poster.post(CompletionEntry::new(3, 0));
        assert_eq!(side.ready(), 0);
        poster.flush_backlog();
        let tags: Vec<_> = side.peek_batch(2).map(|c| c.user_tag).collect();
        assert_eq!(tags, vec![2, 3]);
    }

    #[test]
    fn block_policy_reports_room() {
        let (mut poster, mut side) = pair(2, OverflowPolicy::Block);
        assert!(poster.may_post(2));
        poster.post(CompletionEntry::new(0, 0));
        assert!(poster.may_post(1));
        assert!(!poster.may_post(2));
        poster.post(CompletionEntry::new(1, 0));
        assert!(!poster.may_post(1));
        side.next();
        assert!(poster.may_post(1));
        assert_eq!(poster.into_backlog(), vec![]);
    }

    #[tokio::test]
    async fn wait_nr_wakes_on_post() {
        let (mut poster, side) = pair(4, OverflowPolicy::Backlog);
        let waiter = async {
            side.wait_nr(2).await.unwrap();
            side.ready()
        };
        let poster_task = async {
            poster.post(CompletionEntry::new(0, 0));
            tokio::task::yield_now().await;
            poster.post(CompletionEntry::new(1, 0));
        };
        let (ready, ()) = tokio::join!(waiter, poster_task);
        assert_eq!(ready, 2);
    }

    #[tokio::test]
    async fn wait_nr_fails_once_poller_exited() {
        let (_poster, side) = pair(4, OverflowPolicy::Backlog);
        side.shared.set_flag(sq_flags::POLLER_EXITED);
        assert_eq!(side.wait_nr(1).await, Err(SystemError::PollerExited));
    }

    #[tokio::test]
    async fn wait_nr_beyond_capacity_fails() {
        let (mut poster, side) = pair(4, OverflowPolicy::Backlog);
        for tag in 0..4 {
            poster.post(CompletionEntry::new(tag, 0));
        }
        assert_eq!(
            side.wait_nr(5).await,
            Err(SystemError::WaitExceedsCapacity { nr: 5, capacity: 4 })
        );
        assert_eq!(side.wait_nr(4).await, Ok(()));
    }
}
