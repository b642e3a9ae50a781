//! Multishot receive.
//!
//! ```text
//!            fire               data: post {n, MORE}, retry
//!   Armed ---------> Firing <--------------------------+
//!     ^                |  |                             |
//!     +-- would block -+  +-----------------------------+
//!                      |
//!                      +-- no buffer  -> Exhausted  (-ENOBUFS)
//!                      +-- peer closed -> Finished  (0)
//!                      +-- error      -> Errored    (-errno)
//!   Armed/Firing -- cancel -----------> Canceled   (-ECANCELED)
//! ```
//!
//! Every transition into a terminal state posts exactly one completion
//! without `MORE`, and every completion before it carries `MORE`.

use nix::errno::Errno;
use tracing::debug;

use crate::{
    system::{completion::CompletionEntry, submission::SubmissionEntry},
    transport::Handle,
};

use super::{receive_into_provided, ArmedOp, Attempt, OpContext, Step};

/// Messages taken per `fire` before yielding to other operations.
const MAX_SHOTS_PER_FIRE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    Armed,
    Firing,
    Exhausted,
    Canceled,
    Errored,
    Finished,
}

impl RecvState {
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, RecvState::Armed | RecvState::Firing)
    }
}

pub(crate) struct MultishotRecv {
    state: RecvState,
    handle: Handle,
    buf_group: u16,
    user_tag: u64,
}

impl MultishotRecv {
    pub(crate) fn new(sqe: &SubmissionEntry) -> Self {
        MultishotRecv {
            state: RecvState::Armed,
            handle: sqe.handle,
            buf_group: sqe.buf_group,
            user_tag: sqe.user_tag,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> RecvState {
        self.state
    }

    fn terminate(&mut self, cx: &mut OpContext<'_>, state: RecvState, result: i32) -> Step {
        debug!(user_tag = self.user_tag, ?state, result, "multishot receive terminated");
        self.state = state;
        cx.completions
            .post(CompletionEntry::new(self.user_tag, result));
        Step::Done
    }
}

impl ArmedOp for MultishotRecv {
    fn user_tag(&self) -> u64 {
        self.user_tag
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn fire(&mut self, cx: &mut OpContext<'_>) -> Step {
        assert_eq!(self.state, RecvState::Armed, "fired in state {:?}", self.state);
        self.state = RecvState::Firing;
        for _ in 0..MAX_SHOTS_PER_FIRE {
            if !cx.completions.may_post(1) {
                break;
            }
            match receive_into_provided(cx, self.handle, self.buf_group) {
                Attempt::Data { buffer_id, len } => {
                    cx.completions.post(CompletionEntry::with_buffer(
                        self.user_tag,
                        len,
                        buffer_id,
                        true,
                    ));
                }
                Attempt::WouldBlock => break,
                Attempt::NoBuffer => {
                    return self.terminate(cx, RecvState::Exhausted, -(Errno::ENOBUFS as i32))
                }
                Attempt::Eof => return self.terminate(cx, RecvState::Finished, 0),
                Attempt::Failed(errno) => {
                    return self.terminate(cx, RecvState::Errored, -(errno as i32))
                }
            }
        }
        self.state = RecvState::Armed;
        Step::Armed
    }

    fn cancel(&mut self, cx: &mut OpContext<'_>) {
        debug_assert!(!self.state.is_terminal());
        self.terminate(cx, RecvState::Canceled, -(Errno::ECANCELED as i32));
    }

    fn state_str(&self) -> &'static str {
        match self.state {
            RecvState::Armed => "Armed",
            RecvState::Firing => "Firing",
            RecvState::Exhausted => "Exhausted",
            RecvState::Canceled => "Canceled",
            RecvState::Errored => "Errored",
            RecvState::Finished => "Finished",
        }
    }
}
