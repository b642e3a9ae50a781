use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
pub struct Metrics {
    pub engines_launched: u64,
    pub engines_shut_down: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) engines_launched: AtomicU64,
    pub(crate) engines_shut_down: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            engines_launched: AtomicU64::new(0),
            engines_shut_down: AtomicU64::new(0),
        }
    }
}

impl MetricsStorage {
    fn make_pub(&self) -> Metrics {
        Metrics {
            engines_launched: self.engines_launched.load(Ordering::Relaxed),
            engines_shut_down: self.engines_shut_down.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}

/// Counters of a single engine, see [`crate::Engine::metrics`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetrics {
    pub sqes_consumed: u64,
    pub cqes_posted: u64,
    /// Completions that had to go through the overflow backlog.
    pub cq_overflows: u64,
    pub buffers_selected: u64,
    /// Doorbell wakeups of an idle poller.
    pub poller_wakeups: u64,
    pub idle_transitions: u64,
}

#[derive(Default)]
pub(crate) struct EngineMetricsStorage {
    pub(crate) sqes_consumed: AtomicU64,
    pub(crate) cqes_posted: AtomicU64,
    pub(crate) cq_overflows: AtomicU64,
    pub(crate) buffers_selected: AtomicU64,
    pub(crate) poller_wakeups: AtomicU64,
    pub(crate) idle_transitions: AtomicU64,
}

impl EngineMetricsStorage {
    pub(crate) fn make_pub(&self) -> EngineMetrics {
        EngineMetrics {
            sqes_consumed: self.sqes_consumed.load(Ordering::Relaxed),
            cqes_posted: self.cqes_posted.load(Ordering::Relaxed),
            cq_overflows: self.cq_overflows.load(Ordering::Relaxed),
            buffers_selected: self.buffers_selected.load(Ordering::Relaxed),
            poller_wakeups: self.poller_wakeups.load(Ordering::Relaxed),
            idle_transitions: self.idle_transitions.load(Ordering::Relaxed),
        }
    }
}
