use nix::errno::Errno;
use tracing::debug;

use crate::system::{completion::CompletionEntry, submission::SubmissionEntry};

use super::{ArmedOps, OpContext};

/// Cancel the oldest armed operation tagged `target_tag`.
///
/// The target's `-ECANCELED` completion is posted before the cancel
/// request's own completion, which is 0, or `-ENOENT` if nothing matched.
pub(crate) fn execute(
    sqe: &SubmissionEntry,
    target_tag: u64,
    armed: &mut ArmedOps,
    cx: &mut OpContext<'_>,
) {
    let Some(pos) = armed.iter().position(|op| op.user_tag() == target_tag) else {
        debug!(target_tag, "cancel found no armed operation");
        cx.completions
            .post(CompletionEntry::error(sqe.user_tag, Errno::ENOENT));
        return;
    };
    let mut target = armed.remove(pos);
    debug!(target_tag, state = target.state_str(), "canceling");
    target.cancel(cx);
    cx.completions.post(CompletionEntry::new(sqe.user_tag, 0));
}

#[cfg(test)]
mod tests {
    use crate::{
        config::OverflowPolicy,
        ops::{execute, test_util::Harness},
        system::{
            completion::{CompletionEntry, CompletionError},
            submission::SubmissionEntry,
        },
    };

    #[test]
    fn cancel_armed_then_unknown() {
        let mut h = Harness::new(8, OverflowPolicy::Backlog);
        h.pool(0, 2, 64);
        let handle = h.transport.open();
        let (mut cx, armed) = h.cx();
        execute(SubmissionEntry::recv_multishot(handle, 0).user_tag(1), &mut cx, armed);
        execute(SubmissionEntry::async_cancel(1).user_tag(2), &mut cx, armed);
        execute(SubmissionEntry::async_cancel(1).user_tag(3), &mut cx, armed);
        assert!(h.armed.is_empty());

        let cqes = h.drain();
        let outcomes: Vec<_> = cqes.iter().map(|c| (c.user_tag, c.outcome())).collect();
        assert_eq!(
            outcomes,
            vec![
                (1, Err(CompletionError::Canceled)),
                (2, Ok(0)),
                (3, Err(CompletionError::NotFound)),
            ]
        );
        assert!(cqes.iter().all(|c| !c.is_more()));
    }

    #[test]
    fn nop_completes() {
        let mut h = Harness::new(8, OverflowPolicy::Backlog);
        let (mut cx, armed) = h.cx();
        execute(SubmissionEntry::nop().user_tag(5), &mut cx, armed);
        assert_eq!(h.drain(), vec![CompletionEntry::new(5, 0)]);
    }
}
