//! The submission queue: entries, and the application-side producer.

use std::{
    ops::BitOr,
    sync::{
        atomic::{self, Ordering},
        Arc,
    },
};

use tracing::trace;

use crate::{ring, transport::Handle};

use super::{sq_flags, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Nop,
    /// Receive one message into a buffer selected from `buf_group`.
    Recv,
    /// Receive messages into buffers selected from `buf_group` until the
    /// group runs dry, the operation is canceled, or the peer closes.
    RecvMultishot,
    /// Cancel the armed operation submitted with `target_tag`.
    AsyncCancel { target_tag: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SqeFlags(u8);

impl SqeFlags {
    /// Let the engine pick the receive buffer from the entry's `buf_group`.
    pub const BUFFER_SELECT: SqeFlags = SqeFlags(1 << 5);

    pub const fn empty() -> Self {
        SqeFlags(0)
    }

    pub const fn contains(self, other: SqeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SqeFlags {
    type Output = SqeFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        SqeFlags(self.0 | rhs.0)
    }
}

/// One submission. Immutable once pushed.
///
/// ```
/// use sqpoll_uring::{Handle, SubmissionEntry};
///
/// let sqe = SubmissionEntry::recv_multishot(Handle(3), 0).user_tag(42);
/// assert_eq!(sqe.user_tag, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionEntry {
    pub opcode: Opcode,
    pub handle: Handle,
    pub flags: SqeFlags,
    pub buf_group: u16,
    pub user_tag: u64,
}

impl SubmissionEntry {
    pub fn nop() -> Self {
        SubmissionEntry {
            opcode: Opcode::Nop,
            handle: Handle(-1),
            flags: SqeFlags::empty(),
            buf_group: 0,
            user_tag: 0,
        }
    }

    pub fn recv(handle: Handle, buf_group: u16) -> Self {
        SubmissionEntry {
            opcode: Opcode::Recv,
            handle,
            flags: SqeFlags::BUFFER_SELECT,
            buf_group,
            user_tag: 0,
        }
    }

    pub fn recv_multishot(handle: Handle, buf_group: u16) -> Self {
        SubmissionEntry {
            opcode: Opcode::RecvMultishot,
            ..Self::recv(handle, buf_group)
        }
    }

    pub fn async_cancel(target_tag: u64) -> Self {
        SubmissionEntry {
            opcode: Opcode::AsyncCancel { target_tag },
            ..Self::nop()
        }
    }

    pub fn user_tag(mut self, user_tag: u64) -> Self {
        self.user_tag = user_tag;
        self
    }

    pub fn flags(mut self, flags: SqeFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("submission queue is full")]
    QueueFull,
    #[error("engine is shut down")]
    ShutDown,
}

/// Application half of the submission queue.
pub(crate) struct SubmitSide {
    sq: ring::Producer<SubmissionEntry>,
    shared: Arc<Shared>,
}

impl SubmitSide {
    pub(crate) fn new(sq: ring::Producer<SubmissionEntry>, shared: Arc<Shared>) -> Self {
        SubmitSide { sq, shared }
    }

    /// Publish `entries` (all or none) and ring the doorbell if the poller is idle.
    pub(crate) fn submit(&mut self, entries: &[SubmissionEntry]) -> Result<(), SubmitError> {
        if self.shared.has_flag(sq_flags::POLLER_EXITED) {
            return Err(SubmitError::ShutDown);
        }
        self.sq
            .push_batch(entries)
            .map_err(|ring::Full| SubmitError::QueueFull)?;
        // Order the tail store before the flag load, see `Shared::set_flag`.
        atomic::fence(Ordering::SeqCst);
        if self.shared.has_flag(sq_flags::NEED_WAKEUP) {
            trace!(submitted = entries.len(), "ringing doorbell of idle poller");
            self.shared.doorbell.notify_one();
        }
        Ok(())
    }

    pub(crate) fn wake(&self) {
        self.shared.doorbell.notify_one();
    }

    /// Entries the poller hasn't consumed yet.
    pub(crate) fn pending(&self) -> usize {
        self.sq.len()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.sq.free_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(entries: u32) -> (SubmitSide, ring::Consumer<SubmissionEntry>, Arc<Shared>) {
        let shared = Arc::new(Shared::new(0));
        let (tx, rx) = ring::new(entries).unwrap();
        (SubmitSide::new(tx, Arc::clone(&shared)), rx, shared)
    }

    #[test]
    fn builders() {
        let sqe = SubmissionEntry::recv_multishot(Handle(5), 3).user_tag(9);
        assert_eq!(sqe.opcode, Opcode::RecvMultishot);
        assert!(sqe.flags.contains(SqeFlags::BUFFER_SELECT));
        assert_eq!((sqe.handle, sqe.buf_group, sqe.user_tag), (Handle(5), 3, 9));
        let sqe = sqe.flags(SqeFlags::empty());
        assert!(!sqe.flags.contains(SqeFlags::BUFFER_SELECT));
        assert_eq!(
            SubmissionEntry::async_cancel(9).opcode,
            Opcode::AsyncCancel { target_tag: 9 }
        );
    }

    #[test]
    fn full_queue_rejects_whole_batch() {
        let (mut side, mut rx, _shared) = side(2);
        side.submit(&[SubmissionEntry::nop()]).unwrap();
        let batch = [SubmissionEntry::nop().user_tag(1), SubmissionEntry::nop().user_tag(2)];
        assert_eq!(side.submit(&batch), Err(SubmitError::QueueFull));
        assert_eq!(side.pending(), 1);
        assert_eq!(side.free_slots(), 1);
        rx.advance(1);
        side.submit(&batch).unwrap();
        assert_eq!(rx.pop().map(|e| e.user_tag), Some(1));
    }

    #[tokio::test]
    async fn doorbell_only_when_needed() {
        let (mut side, _rx, shared) = side(4);
        side.submit(&[SubmissionEntry::nop()]).unwrap();
        // No permit was stored: the poller was awake.
        let woken = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            shared.doorbell.notified(),
        )
        .await;
        assert!(woken.is_err());

        shared.set_flag(sq_flags::NEED_WAKEUP);
        side.submit(&[SubmissionEntry::nop()]).unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            shared.doorbell.notified(),
        )
        .await
        .unwrap();
    }

    #[test]
    fn shut_down_engine_rejects() {
        let (mut side, _rx, shared) = side(4);
        shared.set_flag(sq_flags::POLLER_EXITED);
        assert_eq!(
            side.submit(&[SubmissionEntry::nop()]),
            Err(SubmitError::ShutDown)
        );
    }
}
