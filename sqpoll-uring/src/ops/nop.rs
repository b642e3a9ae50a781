use crate::system::{completion::CompletionEntry, submission::SubmissionEntry};

use super::OpContext;

/// Completes immediately with result 0.
pub(crate) fn execute(sqe: &SubmissionEntry, cx: &mut OpContext<'_>) {
    cx.completions.post(CompletionEntry::new(sqe.user_tag, 0));
}
