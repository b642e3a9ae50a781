//! Engine configuration.

use std::time::Duration;

use crate::{env_tunables, ring};

/// Largest accepted `sq_entries`, as for `io_uring_setup`.
pub const MAX_SQ_ENTRIES: u32 = 1 << 15;

/// What the poller does when the completion queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Keep producing; completions that don't fit wait in an ordered
    /// backlog and are flushed as the application frees space.
    #[default]
    Backlog,
    /// Stop consuming submissions and stepping operations until the
    /// application frees space.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Submission queue entries, rounded up to a power of two.
    pub sq_entries: u32,
    /// Completion queue entries, rounded up to a power of two.
    /// Defaults to twice the (rounded) submission queue size.
    pub cq_entries: Option<u32>,
    /// How long the poller keeps spinning without work before it sets
    /// `NEED_WAKEUP` and sleeps.
    pub sq_thread_idle: Duration,
    pub overflow: OverflowPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sq_entries: *env_tunables::SQ_ENTRIES,
            cq_entries: None,
            sq_thread_idle: Duration::from_millis(*env_tunables::SQ_THREAD_IDLE_MS),
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sq_entries must be between 1 and 32768, got {0}")]
    SqEntries(u32),
    #[error("cq_entries must be between sq_entries ({sq}) and 65536, got {cq}")]
    CqEntries { sq: u32, cq: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingSizes {
    pub(crate) sq: u32,
    pub(crate) cq: u32,
}

impl EngineConfig {
    pub fn sq_entries(mut self, entries: u32) -> Self {
        self.sq_entries = entries;
        self
    }

    pub fn cq_entries(mut self, entries: u32) -> Self {
        self.cq_entries = Some(entries);
        self
    }

    pub fn sq_thread_idle(mut self, idle: Duration) -> Self {
        self.sq_thread_idle = idle;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub(crate) fn ring_sizes(&self) -> Result<RingSizes, ConfigError> {
        if self.sq_entries == 0 || self.sq_entries > MAX_SQ_ENTRIES {
            return Err(ConfigError::SqEntries(self.sq_entries));
        }
        let sq = self.sq_entries.next_power_of_two();
        let cq = match self.cq_entries {
            None => sq * 2,
            Some(cq) if cq < sq || cq > ring::MAX_ENTRIES => {
                return Err(ConfigError::CqEntries { sq, cq })
            }
            Some(cq) => cq.next_power_of_two(),
        };
        Ok(RingSizes { sq, cq })
    }
}
