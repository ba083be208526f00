//! Error types for the planner, classifier, and dispatcher.

use outreach_core::attempt::AttemptStatus;
use outreach_core::error::OutreachError;
use outreach_core::types::Timestamp;
use uuid::Uuid;

/// Errors from validating a goal catalog.
///
/// Raised when a catalog is saved or loaded, never while planning.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate goal key: {0}")]
    DuplicateGoal(String),
    #[error("Goal {0} has no default outcome")]
    MissingDefault(String),
    #[error("Goal {0} has more than one default outcome")]
    DuplicateDefault(String),
    #[error("Goal {goal} outcome {outcome} points at unknown goal {next}")]
    UnknownNextGoal {
        goal: String,
        outcome: String,
        next: String,
    },
    #[error("Goal {0} must allow at least one attempt")]
    ZeroMaxAttempts(String),
    #[error("Catalog is missing base goal {0}")]
    MissingBaseGoal(String),
    #[error("Catalog parse error: {0}")]
    Parse(String),
    #[error("Storage error: {0}")]
    Storage(#[from] OutreachError),
}

impl From<toml::de::Error> for RegistryError {
    fn from(err: toml::de::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

/// Errors from goal selection.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("Contact {0} has opted out")]
    OptedOut(Uuid),
    #[error("Contact {0} refused recently; cooling down until {1}")]
    CoolingDown(Uuid, Timestamp),
    #[error("Goal not in registry: {0}")]
    UnknownGoal(String),
    #[error("Goal arbiter failed: {0}")]
    Arbiter(String),
    #[error("Storage error: {0}")]
    Storage(#[from] OutreachError),
}

/// Errors from advancing an attempt through its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Attempt not found: {0}")]
    NotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(AttemptStatus, AttemptStatus),
    #[error("Attempt {0} changed concurrently")]
    Conflict(Uuid),
    #[error("Goal not in registry: {0}")]
    UnknownGoal(String),
    #[error("Storage error: {0}")]
    Storage(#[from] OutreachError),
}

/// Errors from the outbound message transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Network hiccup, rate limit, 5xx: worth retrying.
    #[error("Transient transport error: {0}")]
    Transient(String),
    #[error("Permanent transport error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Errors from dispatching a pending attempt.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Attempt {0} is not pending")]
    NotPending(Uuid),
    #[error("Attempt {0} is claimed by another dispatcher")]
    AlreadyClaimed(Uuid),
    #[error("Claim on attempt {0} was lost before the send was recorded")]
    ClaimLost(Uuid),
    #[error("Refusing to dispatch to opted-out contact {0}")]
    OptedOut(Uuid),
    #[error("Goal not in registry: {0}")]
    UnknownGoal(String),
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),
    #[error("Storage error: {0}")]
    Storage(#[from] OutreachError),
}

/// Errors from a response classifier backend.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier backend unavailable: {0}")]
    Unavailable(String),
    #[error("Classifier returned an unusable answer: {0}")]
    InvalidResponse(String),
}

/// Errors from a rehearsal run.
#[derive(Debug, thiserror::Error)]
pub enum RehearsalError {
    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),
}
