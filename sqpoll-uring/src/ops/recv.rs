//! Single-shot receive into a provided buffer.

use nix::errno::Errno;

use crate::{
    system::{completion::CompletionEntry, submission::SubmissionEntry},
    transport::Handle,
};

use super::{receive_into_provided, ArmedOp, Attempt, OpContext, Step};

pub(crate) struct RecvOnce {
    handle: Handle,
    buf_group: u16,
    user_tag: u64,
}

impl RecvOnce {
    pub(crate) fn new(sqe: &SubmissionEntry) -> Self {
        RecvOnce {
            handle: sqe.handle,
            buf_group: sqe.buf_group,
            user_tag: sqe.user_tag,
        }
    }
}

impl ArmedOp for RecvOnce {
    fn user_tag(&self) -> u64 {
        self.user_tag
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn fire(&mut self, cx: &mut OpContext<'_>) -> Step {
        if !cx.completions.may_post(1) {
            return Step::Armed;
        }
        let cqe = match receive_into_provided(cx, self.handle, self.buf_group) {
            Attempt::WouldBlock => return Step::Armed,
            Attempt::Data { buffer_id, len } => {
                CompletionEntry::with_buffer(self.user_tag, len, buffer_id, false)
            }
            Attempt::NoBuffer => CompletionEntry::error(self.user_tag, Errno::ENOBUFS),
            Attempt::Eof => CompletionEntry::new(self.user_tag, 0),
            Attempt::Failed(errno) => CompletionEntry::error(self.user_tag, errno),
        };
        cx.completions.post(cqe);
        Step::Done
    }

    fn cancel(&mut self, cx: &mut OpContext<'_>) {
        cx.completions
            .post(CompletionEntry::error(self.user_tag, Errno::ECANCELED));
    }

    fn state_str(&self) -> &'static str {
        "Armed"
    }
}
