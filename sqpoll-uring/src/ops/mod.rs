//! The operations the poller executes.
//!
//! `Nop` and `AsyncCancel` complete as soon as they're consumed from the
//! submission queue. Receives are *armed*: they stay in the poller's table
//! and are fired whenever their transport handle becomes ready, until they
//! reach a terminal state and post a completion without `MORE`.

use std::sync::atomic::Ordering;

use nix::errno::Errno;
use tracing::trace;

use crate::{
    buf_ring::BufferGroups,
    metrics::EngineMetricsStorage,
    system::{
        completion::{CompletionEntry, CompletionPoster},
        submission::{Opcode, SqeFlags, SubmissionEntry},
    },
    transport::{Handle, RecvOutcome, Transport},
};

pub(crate) mod cancel;
pub(crate) mod multishot;
pub(crate) mod nop;
pub(crate) mod recv;

/// Everything an operation may touch while it runs on the poller.
pub(crate) struct OpContext<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) groups: &'a mut BufferGroups,
    pub(crate) completions: &'a mut CompletionPoster,
    pub(crate) metrics: &'a EngineMetricsStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Still armed, fire again on the next readiness.
    Armed,
    /// Terminal completion posted, retire the operation.
    Done,
}

pub(crate) trait ArmedOp: Send {
    fn user_tag(&self) -> u64;
    fn handle(&self) -> Handle;
    /// Receive until the handle would block or the op turns terminal.
    fn fire(&mut self, cx: &mut OpContext<'_>) -> Step;
    /// Post the `-ECANCELED` terminal completion.
    fn cancel(&mut self, cx: &mut OpContext<'_>);
    fn state_str(&self) -> &'static str;
}

pub(crate) type ArmedOps = Vec<Box<dyn ArmedOp>>;

/// Consume one submission.
pub(crate) fn execute(sqe: SubmissionEntry, cx: &mut OpContext<'_>, armed: &mut ArmedOps) {
    trace!(?sqe, "execute");
    cx.metrics.sqes_consumed.fetch_add(1, Ordering::Relaxed);
    let mut op: Box<dyn ArmedOp> = match sqe.opcode {
        Opcode::Nop => return nop::execute(&sqe, cx),
        Opcode::AsyncCancel { target_tag } => {
            return cancel::execute(&sqe, target_tag, armed, cx)
        }
        _ if !sqe.flags.contains(SqeFlags::BUFFER_SELECT) => {
            // receives only ever use provided buffers
            cx.completions
                .post(CompletionEntry::error(sqe.user_tag, Errno::EINVAL));
            return;
        }
        Opcode::Recv => Box::new(recv::RecvOnce::new(&sqe)),
        Opcode::RecvMultishot => Box::new(multishot::MultishotRecv::new(&sqe)),
    };
    // Arming is a first attempt, like the first issue of a request.
    if op.fire(cx) == Step::Armed {
        armed.push(op);
    }
}

/// Result of one receive attempt into a provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// `len` bytes landed in the buffer, which is now issued.
    Data { buffer_id: u16, len: usize },
    WouldBlock,
    /// The group has no available buffer (or doesn't exist).
    NoBuffer,
    Eof,
    Failed(Errno),
}

/// Peek the group's next buffer, receive into it, and commit the buffer
/// only if data arrived. On any other outcome the buffer stays available.
pub(crate) fn receive_into_provided(
    cx: &mut OpContext<'_>,
    handle: Handle,
    group: u16,
) -> Attempt {
    let Ok(selector) = cx.groups.get_mut(group) else {
        return Attempt::NoBuffer;
    };
    let Some(desc) = selector.peek() else {
        return Attempt::NoBuffer;
    };
    // SAFETY: the descriptor sits at the ring head: it is available, so
    // neither the application nor any other op uses its memory, and the
    // arena lives as long as the selector we borrow.
    let buf = unsafe { desc.as_mut_slice() };
    match cx.transport.try_receive(handle, buf) {
        Ok(RecvOutcome::Read(0)) => Attempt::Eof,
        Ok(RecvOutcome::Read(len)) => {
            selector.commit(desc);
            cx.metrics.buffers_selected.fetch_add(1, Ordering::Relaxed);
            Attempt::Data {
                buffer_id: desc.id,
                len,
            }
        }
        Ok(RecvOutcome::WouldBlock) => Attempt::WouldBlock,
        Err(e) => Attempt::Failed(e.errno()),
    }
}
