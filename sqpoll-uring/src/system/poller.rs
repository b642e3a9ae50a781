//! The submission poller thread.
//!
//! While there is work, or for `sq_thread_idle` after the last of it, the
//! poller spins: it flushes the overflow backlog, consumes submissions and
//! fires armed operations whose handle is ready. Then it sets
//! `NEED_WAKEUP` and sleeps until the doorbell rings, an armed operation's
//! handle becomes ready, completion queue space is freed, or shutdown.
//!
//! Readiness serviced while idle does not clear `NEED_WAKEUP`: only the
//! doorbell puts the poller back into the spinning phase, and only a
//! spinning poller consumes submissions.
//!
//! Under `OverflowPolicy::Block` a submission whose completion can't be
//! posted holds the poller awake, without `NEED_WAKEUP`, parked on
//! completion queue space.

use std::{
    sync::{
        atomic::{self, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::{future::poll_fn, task::noop_waker_ref};
use nix::errno::Errno;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace};

use crate::{
    buf_ring::BufferGroups,
    ops::{self, ArmedOps, OpContext, Step},
    ring,
    system::submission::Opcode,
    transport::Transport,
};

use super::{
    completion::{CompletionEntry, CompletionPoster},
    sq_flags, Shared,
    submission::SubmissionEntry,
};

pub(crate) struct Poller {
    pub(crate) shared: Arc<Shared>,
    pub(crate) sq: ring::Consumer<SubmissionEntry>,
    pub(crate) completions: CompletionPoster,
    pub(crate) groups: Arc<Mutex<BufferGroups>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) sq_thread_idle: Duration,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct PollerHandle {
    pub(crate) join: std::thread::JoinHandle<Vec<CompletionEntry>>,
    pub(crate) shutdown: CancellationToken,
}

impl Poller {
    /// Start the poller thread. The thread's result is the overflow backlog
    /// left at shutdown.
    pub(crate) fn launch(self) -> std::io::Result<PollerHandle> {
        let id = self.shared.id;
        let shutdown = self.shutdown.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let join = std::thread::Builder::new()
            .name(format!("{id}-sqpoll"))
            .spawn(move || {
                let span = info_span!("sqpoll", engine = %id);
                let _entered = span.enter(); // safe to use here because we use new_current_thread
                let shared = Arc::clone(&self.shared);
                let _exited = scopeguard::guard((), move |()| {
                    shared.set_flag(sq_flags::POLLER_EXITED);
                    // wake an application blocked in wait_cqe_nr
                    shared.cq_ready.notify_one();
                });
                scopeguard::defer_on_success! {info!("poller thread exiting")};
                scopeguard::defer_on_unwind! {error!("poller thread panicked")};
                info!("poller thread running");
                runtime.block_on(self.run())
            })?;
        Ok(PollerHandle { join, shutdown })
    }

    async fn run(mut self) -> Vec<CompletionEntry> {
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let mut armed = ArmedOps::new();
        let mut last_work = Instant::now();
        let mut idle = false;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if self.work(&mut armed, idle) {
                last_work = Instant::now();
                if idle {
                    // keep servicing readiness, still without consuming the SQ
                    continue;
                }
            }
            // a pending submission that can't post keeps us awake, waiting for space
            let blocked_on = if idle {
                None
            } else {
                blocked_sq_head(&self.sq, &self.completions)
            };
            if !idle && blocked_on.is_none() {
                if last_work.elapsed() < self.sq_thread_idle {
                    tokio::task::yield_now().await;
                    continue;
                }
                if !self.enter_idle() {
                    last_work = Instant::now();
                    continue;
                }
                idle = true;
            }

            let needed = blocked_on.unwrap_or(1);
            let stalled = !self.completions.may_post(needed);
            if stalled {
                shared.set_flag(sq_flags::CQ_FULL);
                atomic::fence(Ordering::SeqCst);
                if self.completions.may_post(needed) {
                    shared.clear_flag(sq_flags::CQ_FULL);
                    continue;
                }
            } else {
                shared.clear_flag(sq_flags::CQ_FULL);
            }
            let wait_for_space = stalled || self.completions.is_backlogged();
            let transport = &*self.transport;
            let armed_ref = &armed;
            tokio::select! {
                _ = shared.doorbell.notified() => {
                    if idle {
                        debug!("doorbell, leaving idle");
                        shared.clear_flag(sq_flags::NEED_WAKEUP);
                        shared.metrics.poller_wakeups.fetch_add(1, Ordering::Relaxed);
                        idle = false;
                    }
                    last_work = Instant::now();
                }
                _ = shared.cq_space.notified(), if wait_for_space => {
                    trace!("completion queue space freed");
                }
                _ = poll_fn(|cx| poll_armed_ready(armed_ref, transport, cx)), if !stalled => {
                    trace!("armed operation ready");
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
        self.finish(armed)
    }

    /// One round of non-blocking work. Returns whether anything happened.
    fn work(&mut self, armed: &mut ArmedOps, idle: bool) -> bool {
        let posted_before = self.shared.metrics.cqes_posted.load(Ordering::Relaxed);
        let mut groups = self.groups.lock().unwrap();
        let mut cx = OpContext {
            transport: &*self.transport,
            groups: &mut groups,
            completions: &mut self.completions,
            metrics: &self.shared.metrics,
        };
        let flushed = cx.completions.flush_backlog();
        let consumed = if idle {
            0
        } else {
            drain_sq(&mut self.sq, &mut cx, armed)
        };
        fire_ready(armed, &mut cx);
        let posted = self.shared.metrics.cqes_posted.load(Ordering::Relaxed) - posted_before;
        flushed + consumed + posted as usize > 0
    }

    /// Set `NEED_WAKEUP`, then look at the SQ once more. Returns false, with
    /// the flag cleared again, if a submission raced in.
    fn enter_idle(&mut self) -> bool {
        self.shared.set_flag(sq_flags::NEED_WAKEUP);
        atomic::fence(Ordering::SeqCst);
        if !self.sq.is_empty() {
            self.shared.clear_flag(sq_flags::NEED_WAKEUP);
            return false;
        }
        debug!(idle_after = ?self.sq_thread_idle, "going idle");
        self.shared
            .metrics
            .idle_transitions
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Cancel armed operations and unconsumed submissions, in that order.
    fn finish(mut self, mut armed: ArmedOps) -> Vec<CompletionEntry> {
        info!(armed = armed.len(), pending = self.sq.len(), "poller shutting down");
        {
            let mut groups = self.groups.lock().unwrap();
            let mut cx = OpContext {
                transport: &*self.transport,
                groups: &mut groups,
                completions: &mut self.completions,
                metrics: &self.shared.metrics,
            };
            cx.completions.flush_backlog();
            for mut op in armed.drain(..) {
                op.cancel(&mut cx);
            }
            while let Some(sqe) = self.sq.pop() {
                cx.completions
                    .post(CompletionEntry::error(sqe.user_tag, Errno::ECANCELED));
            }
        }
        self.completions.into_backlog()
    }
}

/// Completion slots that must be free before `sqe` is consumed.
fn slots_needed(sqe: &SubmissionEntry, completions: &CompletionPoster) -> usize {
    // a cancel completes its target as well as itself
    match sqe.opcode {
        Opcode::AsyncCancel { .. } => 2.min(completions.capacity()),
        _ => 1,
    }
}

/// The slots the SQ head waits for, if there is a head and it can't be posted.
fn blocked_sq_head(
    sq: &ring::Consumer<SubmissionEntry>,
    completions: &CompletionPoster,
) -> Option<usize> {
    let needed = slots_needed(&sq.peek(0)?, completions);
    (!completions.may_post(needed)).then_some(needed)
}

fn drain_sq(
    sq: &mut ring::Consumer<SubmissionEntry>,
    cx: &mut OpContext<'_>,
    armed: &mut ArmedOps,
) -> usize {
    let mut consumed = 0;
    while let Some(sqe) = sq.peek(0) {
        let needed = slots_needed(&sqe, cx.completions);
        if !cx.completions.may_post(needed) {
            break;
        }
        sq.advance(1);
        ops::execute(sqe, cx, armed);
        consumed += 1;
    }
    consumed
}

/// Fire every armed operation whose handle is ready, retiring those that
/// reach a terminal state.
fn fire_ready(armed: &mut ArmedOps, cx: &mut OpContext<'_>) {
    let mut task_cx = Context::from_waker(noop_waker_ref());
    armed.retain_mut(|op| {
        match cx.transport.poll_receive_ready(op.handle(), &mut task_cx) {
            Poll::Pending => true,
            Poll::Ready(_) => op.fire(cx) == Step::Armed,
        }
    });
}

fn poll_armed_ready(armed: &ArmedOps, transport: &dyn Transport, cx: &mut Context<'_>) -> Poll<()> {
    if armed
        .iter()
        .any(|op| transport.poll_receive_ready(op.handle(), cx).is_ready())
    {
        Poll::Ready(())
    } else {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;

    fn sq_and_cq(
        cq_entries: u32,
        policy: OverflowPolicy,
    ) -> (
        ring::Producer<SubmissionEntry>,
        ring::Consumer<SubmissionEntry>,
        CompletionPoster,
    ) {
        let shared = Arc::new(Shared::new(0));
        let (sq_tx, sq_rx) = ring::new(4).unwrap();
        let (cq_tx, _cq_rx) = ring::new(cq_entries).unwrap();
        (sq_tx, sq_rx, CompletionPoster::new(cq_tx, policy, shared))
    }

    #[test]
    fn full_cq_blocks_sq_head_under_block() {
        let (mut sq_tx, sq, mut completions) = sq_and_cq(2, OverflowPolicy::Block);
        assert_eq!(blocked_sq_head(&sq, &completions), None);

        sq_tx.push(SubmissionEntry::async_cancel(9)).unwrap();
        assert_eq!(blocked_sq_head(&sq, &completions), None);
        completions.post(CompletionEntry::new(1, 0));
        // a cancel needs room for two
        assert_eq!(blocked_sq_head(&sq, &completions), Some(2));
        completions.post(CompletionEntry::new(2, 0));
        assert_eq!(blocked_sq_head(&sq, &completions), Some(2));
    }

    #[test]
    fn backlog_never_blocks_sq_head() {
        let (mut sq_tx, sq, mut completions) = sq_and_cq(2, OverflowPolicy::Backlog);
        sq_tx.push(SubmissionEntry::nop()).unwrap();
        for tag in 0..3 {
            completions.post(CompletionEntry::new(tag, 0));
        }
        assert_eq!(blocked_sq_head(&sq, &completions), None);
    }
}
