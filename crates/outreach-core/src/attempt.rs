//! The per-(contact, goal) attempt ledger.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::goal::{DecisionMethod, Intent, Sentiment};
use crate::types::Timestamp;

/// Lifecycle of one pursuit of a goal with a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Responded,
    Deferred,
    Escalated,
    Success,
    Declined,
}

impl AttemptStatus {
    /// Statuses that occupy the single open slot for a (contact, goal) pair.
    pub const OPEN: [AttemptStatus; 5] = [
        AttemptStatus::Pending,
        AttemptStatus::Sent,
        AttemptStatus::Responded,
        AttemptStatus::Deferred,
        AttemptStatus::Escalated,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Success | AttemptStatus::Declined)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Responded => "responded",
            AttemptStatus::Deferred => "deferred",
            AttemptStatus::Escalated => "escalated",
            AttemptStatus::Success => "success",
            AttemptStatus::Declined => "declined",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "sent" => Ok(AttemptStatus::Sent),
            "responded" => Ok(AttemptStatus::Responded),
            "deferred" => Ok(AttemptStatus::Deferred),
            "escalated" => Ok(AttemptStatus::Escalated),
            "success" => Ok(AttemptStatus::Success),
            "declined" => Ok(AttemptStatus::Declined),
            _ => Err(format!("Unknown attempt status: {}", s)),
        }
    }
}

/// One row per (contact, goal) pursuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptHistory {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub goal_key: String,
    pub status: AttemptStatus,
    /// Incremented only on a confirmed dispatch that was not a clarification
    /// re-ask.
    pub attempt_count: u32,
    /// Back in `pending` after a clarify outcome. The next send re-asks and
    /// does not count against `max_attempts`.
    #[serde(default)]
    pub clarify_pending: bool,
    pub last_attempt_at: Option<Timestamp>,
    pub next_attempt_at: Option<Timestamp>,
    pub outcome_name: Option<String>,
    pub response_text: Option<String>,
    pub response_sentiment: Option<Sentiment>,
    pub response_intent: Option<Intent>,
    pub planner_reasoning: String,
    pub planner_score: f32,
    pub decision_method: DecisionMethod,
    pub message_id: Option<String>,
    /// Set while a dispatcher holds the row between claim and send.
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl AttemptHistory {
    /// A new pending attempt carrying the planner's reasoning.
    pub fn pending(
        contact_id: Uuid,
        goal_key: &str,
        reasoning: &str,
        score: f32,
        method: DecisionMethod,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            goal_key: goal_key.to_string(),
            status: AttemptStatus::Pending,
            attempt_count: 0,
            clarify_pending: false,
            last_attempt_at: None,
            next_attempt_at: None,
            outcome_name: None,
            response_text: None,
            response_sentiment: None,
            response_intent: None,
            planner_reasoning: reasoning.to_string(),
            planner_score: score,
            decision_method: method,
            message_id: None,
            claim_token: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a pending row may be dispatched at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == AttemptStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
