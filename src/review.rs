//! Verdict aggregation: turning a set of reviewer verdicts into the outcome
//! of one solve attempt.
//!
//! The approval rule: an attempt is accepted iff the number of `approved`
//! verdicts reaches the configured threshold and no reviewer rejected. A
//! single rejection dominates any number of approvals. `needs_changes`
//! verdicts neither block nor count toward the threshold.

use crate::models::{ApprovalStatus, ReviewVerdict};

/// Outcome of one review round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Enough approvals and no rejection: proceed to merge.
    Accepted,
    /// Back to the solver with concatenated feedback (or to failure when
    /// the attempt budget is exhausted).
    ChangesRequested,
}

/// Apply the approval rule to the verdicts of one attempt.
pub fn decide_attempt(verdicts: &[ReviewVerdict], required_approvals: usize) -> AttemptDecision {
    let rejected = verdicts
        .iter()
        .any(|v| v.approval == ApprovalStatus::Rejected);
    if rejected {
        return AttemptDecision::ChangesRequested;
    }

    let approvals = verdicts
        .iter()
        .filter(|v| v.approval == ApprovalStatus::Approved)
        .count();
    if approvals >= required_approvals {
        AttemptDecision::Accepted
    } else {
        AttemptDecision::ChangesRequested
    }
}

/// Concatenate reviewer feedback, labeled by profile, for the next solve
/// prompt. Empty feedback entries are skipped.
pub fn combine_feedback(verdicts: &[ReviewVerdict]) -> String {
    verdicts
        .iter()
        .filter(|v| !v.feedback.trim().is_empty())
        .map(|v| format!("[{}] {}", v.reviewer_profile, v.feedback.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
