//! Attempt state machine with validated transitions.
//!
//! pending -> sent -> responded -> success | declined | deferred | escalated
//! deferred -> pending | declined, escalated -> success | declined

use outreach_core::attempt::AttemptStatus;

use crate::error::TransitionError;

/// Validate that a status transition is allowed.
///
/// Valid transitions:
/// - Pending -> Sent (confirmed dispatch)
/// - Pending -> Declined (attempts exhausted, or contact opted out)
/// - Sent -> Responded
/// - Sent -> Success / Declined / Deferred / Escalated (timeout)
/// - Responded -> Success / Declined / Deferred / Escalated
/// - Responded -> Pending (clarify)
/// - Deferred -> Pending / Declined
/// - Escalated -> Success / Declined (manual resolution)
pub fn validate_transition(from: AttemptStatus, to: AttemptStatus) -> Result<(), TransitionError> {
    use AttemptStatus::*;

    let valid = matches!(
        (from, to),
        (Pending, Sent)
            | (Pending, Declined)
            | (Sent, Responded)
            | (Sent, Success)
            | (Sent, Declined)
            | (Sent, Deferred)
            | (Sent, Escalated)
            | (Responded, Success)
            | (Responded, Declined)
            | (Responded, Deferred)
            | (Responded, Escalated)
            | (Responded, Pending)
            | (Deferred, Pending)
            | (Deferred, Declined)
            | (Escalated, Success)
            | (Escalated, Declined)
    );

    if valid {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(from, to))
    }
}
