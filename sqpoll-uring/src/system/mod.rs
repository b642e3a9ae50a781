pub(super) mod completion;
pub(super) mod lifecycle;
pub(super) mod poller;
pub(super) mod submission;
#[cfg(test)]
mod test_util;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::metrics::EngineMetricsStorage;

/// Default number of SQ entries, used unless overridden by config or env.
pub(crate) const RING_SIZE: u32 = 128;

/// Bits of the flag word the poller publishes to the application.
///
/// Values follow `IORING_SQ_NEED_WAKEUP` / `IORING_SQ_CQ_OVERFLOW`.
pub mod sq_flags {
    /// The poller went idle and must be woken through the doorbell.
    pub const NEED_WAKEUP: u32 = 1 << 0;
    /// Completions are waiting in the overflow backlog.
    pub const CQ_OVERFLOW: u32 = 1 << 1;
    /// The poller is stalled on a full completion queue (`OverflowPolicy::Block`).
    pub const CQ_FULL: u32 = 1 << 2;
    /// The poller thread has exited.
    pub const POLLER_EXITED: u32 = 1 << 3;
}

/// State shared between the application side and the poller thread,
/// beside the rings themselves.
pub(crate) struct Shared {
    pub(crate) id: usize,
    flags: AtomicU32,
    /// Application -> poller: "there is new work, leave idle".
    pub(crate) doorbell: Notify,
    /// Poller -> application: "new completions were posted".
    pub(crate) cq_ready: Notify,
    /// Application -> poller: "completion queue space was freed".
    pub(crate) cq_space: Notify,
    pub(crate) overflow_pending: AtomicUsize,
    pub(crate) metrics: EngineMetricsStorage,
}

impl Shared {
    pub(crate) fn new(id: usize) -> Self {
        Shared {
            id,
            flags: AtomicU32::new(0),
            doorbell: Notify::new(),
            cq_ready: Notify::new(),
            cq_space: Notify::new(),
            overflow_pending: AtomicUsize::new(0),
            metrics: EngineMetricsStorage::default(),
        }
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        // Paired with the fence in `SubmitSide::submit`: either the poller's
        // SQ re-check sees the new entry or the submitter sees NEED_WAKEUP.
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }
}
