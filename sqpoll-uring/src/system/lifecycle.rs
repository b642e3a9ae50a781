use std::sync::{atomic::Ordering, Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buf_ring::{BufferGroups, BufferSelector, PoolError},
    config::{ConfigError, EngineConfig},
    metrics::{self, EngineMetrics},
    ring::{self, RingError},
    transport::Transport,
};

use super::{
    completion::{CompletionEntry, CompletionPoster, CompletionSide, CqeBatch},
    poller::{Poller, PollerHandle},
    sq_flags,
    submission::{SubmissionEntry, SubmitError, SubmitSide},
    Shared,
};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid engine config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("failed to start the poller thread: {0}")]
    Poller(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SystemError {
    #[error("poller thread exited")]
    PollerExited,
    #[error("waiting for {nr} completions on a queue of {capacity}")]
    WaitExceedsCapacity { nr: usize, capacity: usize },
}

static ENGINE_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// A running engine: a submission queue, a completion queue, and the poller
/// thread between them.
///
/// The application side is single-threaded by construction: everything
/// that touches a ring takes `&mut self`.
///
/// Dropping the engine shuts it down; use [`Engine::shutdown`] to get the
/// completions that were still undelivered.
pub struct Engine {
    id: usize,
    submit_side: SubmitSide,
    completion_side: CompletionSide,
    groups: Arc<Mutex<BufferGroups>>,
    shared: Arc<Shared>,
    poller: Option<PollerHandle>,
}

impl Engine {
    /// Set up the rings and start the poller thread.
    pub fn launch(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Engine, LaunchError> {
        let sizes = config.ring_sizes()?;
        let id = ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::new(id));
        let (sq_tx, sq_rx) = ring::new(sizes.sq)?;
        let (cq_tx, cq_rx) = ring::new(sizes.cq)?;
        let groups = Arc::new(Mutex::new(BufferGroups::default()));

        let poller = Poller {
            shared: Arc::clone(&shared),
            sq: sq_rx,
            completions: CompletionPoster::new(cq_tx, config.overflow, Arc::clone(&shared)),
            groups: Arc::clone(&groups),
            transport,
            sq_thread_idle: config.sq_thread_idle,
            shutdown: CancellationToken::new(),
        }
        .launch()
        .map_err(LaunchError::Poller)?;

        metrics::GLOBAL_STORAGE
            .engines_launched
            .fetch_add(1, Ordering::Relaxed);
        info!(
            engine = id,
            sq_entries = sizes.sq,
            cq_entries = sizes.cq,
            sq_thread_idle = ?config.sq_thread_idle,
            overflow = ?config.overflow,
            "engine launched"
        );
        Ok(Engine {
            id,
            submit_side: SubmitSide::new(sq_tx, Arc::clone(&shared)),
            completion_side: CompletionSide::new(cq_rx, Arc::clone(&shared)),
            groups,
            shared,
            poller: Some(poller),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a buffer group's selector to the engine. Receives naming the
    /// group select from it from now on.
    pub fn register_buffers(&self, selector: BufferSelector) -> Result<(), PoolError> {
        let group = selector.group();
        self.groups.lock().unwrap().register(selector)?;
        debug!(engine = self.id, group, "registered buffer group");
        Ok(())
    }

    /// Take a buffer group back. Receives armed on it fail with `-ENOBUFS`
    /// at their next attempt.
    pub fn unregister_buffers(&self, group: u16) -> Result<BufferSelector, PoolError> {
        self.groups
            .lock()
            .unwrap()
            .unregister(group)
            .ok_or(PoolError::UnknownGroup { group })
    }

    /// Queue one submission, waking the poller if it's idle.
    pub fn submit(&mut self, entry: SubmissionEntry) -> Result<(), SubmitError> {
        self.submit_side.submit(std::slice::from_ref(&entry))
    }

    /// Queue all of `entries` or, if they don't fit, none of them.
    pub fn submit_batch(&mut self, entries: &[SubmissionEntry]) -> Result<(), SubmitError> {
        self.submit_side.submit(entries)
    }

    /// Submissions not yet consumed by the poller.
    pub fn submission_queue_pending_count(&self) -> usize {
        self.submit_side.pending()
    }

    /// Entries that can be submitted before the queue reports `QueueFull`.
    pub fn submission_queue_space_left(&self) -> usize {
        self.submit_side.free_slots()
    }

    /// Ring the doorbell whether or not the poller is idle.
    pub fn wake_poller(&self) {
        self.submit_side.wake();
    }

    /// Whether the poller has gone idle and set `NEED_WAKEUP`.
    pub fn poller_is_idle(&self) -> bool {
        self.shared.has_flag(sq_flags::NEED_WAKEUP)
    }

    /// The raw flag word, see [`sq_flags`](crate::sq_flags).
    pub fn sq_flags(&self) -> u32 {
        self.shared.flags()
    }

    /// Completions ready to be read.
    pub fn completion_queue_pending_count(&self) -> usize {
        self.completion_side.ready()
    }

    /// Completions waiting in the overflow backlog.
    pub fn cq_overflow_pending(&self) -> usize {
        self.shared.overflow_pending.load(Ordering::Relaxed)
    }

    /// Pop the oldest ready completion.
    pub fn next_completion(&mut self) -> Option<CompletionEntry> {
        self.completion_side.next()
    }

    /// Look at up to `max` ready completions, see [`CqeBatch`].
    pub fn peek_completions(&mut self, max: usize) -> CqeBatch<'_> {
        self.completion_side.peek_batch(max)
    }

    /// Mark the oldest `n` ready completions as seen.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` completions are ready.
    pub fn advance_completions(&mut self, n: usize) {
        self.completion_side.advance(n)
    }

    /// Wait until at least `nr` completions are ready.
    pub async fn wait_completions(&mut self, nr: usize) -> Result<(), SystemError> {
        self.completion_side.wait_nr(nr).await
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.shared.metrics.make_pub()
    }

    /// Stop the poller and return every completion the application hasn't
    /// consumed yet, including the `-ECANCELED` completions of operations
    /// that were still armed or never consumed from the submission queue.
    pub fn shutdown(mut self) -> Vec<CompletionEntry> {
        self.shutdown_impl()
    }

    fn shutdown_impl(&mut self) -> Vec<CompletionEntry> {
        let Some(PollerHandle { join, shutdown }) = self.poller.take() else {
            return Vec::new();
        };
        info!(engine = self.id, "engine shutdown start");
        shutdown.cancel();
        let backlog = match join.join() {
            Ok(backlog) => backlog,
            Err(_) => {
                warn!(engine = self.id, "poller thread panicked, overflow backlog lost");
                Vec::new()
            }
        };
        let mut undelivered: Vec<_> = std::iter::from_fn(|| self.completion_side.next()).collect();
        undelivered.extend(backlog);
        self.shared.overflow_pending.store(0, Ordering::Relaxed);
        metrics::GLOBAL_STORAGE
            .engines_shut_down
            .fetch_add(1, Ordering::Relaxed);
        info!(
            engine = self.id,
            undelivered = undelivered.len(),
            "engine shutdown end"
        );
        undelivered
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let undelivered = self.shutdown_impl();
        if !undelivered.is_empty() {
            debug!(
                engine = self.id,
                count = undelivered.len(),
                "dropping undelivered completions"
            );
        }
    }
}
