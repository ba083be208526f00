//! Outbound dispatch of pending attempts.
//!
//! A pending row is claimed with a fresh token before anything is sent, so of
//! two concurrent dispatchers only one ever reaches the transport. The
//! do-not-contact guard is re-run against a fresh read of the contact after
//! the claim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use outreach_core::attempt::{AttemptHistory, AttemptStatus};
use outreach_core::config::DispatchConfig;
use outreach_core::types::{Contact, Timestamp};
use outreach_storage::{AttemptRepository, ContactRepository, Database};

use crate::error::{DispatchError, PlannerError, TransportError};
use crate::guard::DoNotContactGuard;
use crate::history::{close_pending, ATTEMPTS_EXHAUSTED, OPTED_OUT};
use crate::registry::GoalRegistry;

/// Proof that the transport accepted a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub message_id: String,
}

/// Outbound message channel (chat, email, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, contact: &Contact, body: &str) -> Result<DeliveryHandle, TransportError>;
}

/// What a dispatch call did with the attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent { attempt_id: Uuid, message_id: String },
    /// The pair had used all its attempts and was declined instead.
    Exhausted { attempt_id: Uuid },
    /// The contact is cooling down after a refusal; retried at `until`.
    Postponed { attempt_id: Uuid, until: Timestamp },
}

/// Replace `{name}` in a goal template.
pub fn render_template(template: &str, contact: &Contact) -> String {
    template.replace("{name}", contact.greeting_name())
}

pub struct Dispatcher {
    attempts: AttemptRepository,
    contacts: ContactRepository,
    registry: Arc<GoalRegistry>,
    guard: DoNotContactGuard,
    config: DispatchConfig,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<GoalRegistry>,
        guard: DoNotContactGuard,
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            attempts: AttemptRepository::new(db.clone()),
            contacts: ContactRepository::new(db),
            registry,
            guard,
            config,
            transport,
        }
    }

    /// Send the message for a pending attempt.
    ///
    /// The attempt count only moves when the transport confirms the send, and
    /// not at all when the send repeats a question the contact asked us to
    /// clarify.
    pub async fn dispatch(
        &self,
        attempt_id: Uuid,
        now: Timestamp,
    ) -> Result<DispatchOutcome, DispatchError> {
        let attempt = self.attempts.require(attempt_id)?;
        if attempt.status != AttemptStatus::Pending {
            return Err(DispatchError::NotPending(attempt_id));
        }
        let goal = self
            .registry
            .get(&attempt.goal_key)
            .ok_or_else(|| DispatchError::UnknownGoal(attempt.goal_key.clone()))?;

        if !attempt.clarify_pending && attempt.attempt_count >= goal.max_attempts {
            let closed = close_pending(&attempt, ATTEMPTS_EXHAUSTED, now)?;
            if !self.attempts.compare_and_set(&closed, AttemptStatus::Pending)? {
                return Err(DispatchError::NotPending(attempt_id));
            }
            info!(attempt_id = %attempt_id, goal = %goal.key, "Attempts exhausted; declined");
            return Ok(DispatchOutcome::Exhausted { attempt_id });
        }

        let token = Uuid::new_v4();
        if !self.attempts.claim(attempt_id, token, now)? {
            debug!(attempt_id = %attempt_id, "Attempt already claimed");
            return Err(DispatchError::AlreadyClaimed(attempt_id));
        }

        let contact = match self.contacts.require(attempt.contact_id) {
            Ok(contact) => contact,
            Err(e) => {
                self.attempts.release_claim(attempt_id, token)?;
                return Err(e.into());
            }
        };
        match self.guard.check_contact(&contact, now) {
            Ok(()) => {}
            Err(PlannerError::OptedOut(contact_id)) => {
                self.decline_opted_out(&attempt, now)?;
                return Err(DispatchError::OptedOut(contact_id));
            }
            Err(PlannerError::CoolingDown(_, until)) => {
                return self.postpone(&attempt, until, now);
            }
            Err(e) => {
                self.attempts.release_claim(attempt_id, token)?;
                return Err(e.into());
            }
        }

        let body = render_template(goal.template_for_attempt(attempt.attempt_count), &contact);
        let handle = match self.send_with_retry(&contact, &body).await {
            Ok(handle) => handle,
            Err(e) => {
                self.attempts.release_claim(attempt_id, token)?;
                warn!(attempt_id = %attempt_id, error = %e, "Dispatch failed; claim released");
                return Err(e.into());
            }
        };

        if !self
            .attempts
            .mark_sent(attempt_id, token, &handle.message_id, now)?
        {
            error!(
                attempt_id = %attempt_id,
                message_id = %handle.message_id,
                "Message sent but claim was lost; send not recorded"
            );
            return Err(DispatchError::ClaimLost(attempt_id));
        }

        info!(
            attempt_id = %attempt_id,
            contact_id = %contact.id,
            goal = %goal.key,
            attempt = attempt.attempt_count + u32::from(!attempt.clarify_pending),
            clarify = attempt.clarify_pending,
            "Outreach sent"
        );
        Ok(DispatchOutcome::Sent {
            attempt_id,
            message_id: handle.message_id,
        })
    }

    fn decline_opted_out(&self, attempt: &AttemptHistory, now: Timestamp) -> Result<(), DispatchError> {
        let closed = close_pending(attempt, OPTED_OUT, now)?;
        if !self
            .attempts
            .compare_and_set(&closed, AttemptStatus::Pending)?
        {
            warn!(attempt_id = %attempt.id, "Attempt moved before the opted-out close");
            return Err(DispatchError::ClaimLost(attempt.id));
        }
        error!(
            attempt_id = %attempt.id,
            contact_id = %attempt.contact_id,
            "Pending attempt found for opted-out contact; declined without sending"
        );
        Ok(())
    }

    fn postpone(
        &self,
        attempt: &AttemptHistory,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut rescheduled = attempt.clone();
        rescheduled.next_attempt_at = Some(until);
        rescheduled.claim_token = None;
        rescheduled.claimed_at = None;
        rescheduled.updated_at = now;
        if !self
            .attempts
            .compare_and_set(&rescheduled, AttemptStatus::Pending)?
        {
            return Err(DispatchError::ClaimLost(attempt.id));
        }
        info!(attempt_id = %attempt.id, until = %until, "Contact cooling down; dispatch postponed");
        Ok(DispatchOutcome::Postponed {
            attempt_id: attempt.id,
            until,
        })
    }

    async fn send_with_retry(
        &self,
        contact: &Contact,
        body: &str,
    ) -> Result<DeliveryHandle, TransportError> {
        let send_once = || async move { self.transport.send(contact, body).await };

        send_once
            .retry(
                ExponentialBuilder::default()
                    .with_max_times(self.config.max_retries as usize)
                    .with_min_delay(Duration::from_millis(self.config.initial_delay_ms))
                    .with_max_delay(Duration::from_millis(self.config.max_delay_ms)),
            )
            .when(|e| e.is_transient())
            .notify(|err, dur| {
                warn!(
                    contact_id = %contact.id,
                    error = %err,
                    "Send failed, retrying in {:?}",
                    dur
                );
            })
            .await
    }
}
