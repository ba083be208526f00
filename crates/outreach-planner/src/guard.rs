//! Do-not-contact guard.
//!
//! Runs before goal selection and again, against a fresh read, right before
//! every send.

use uuid::Uuid;

use outreach_core::types::{Contact, Timestamp};

use crate::error::PlannerError;
use crate::state::ContactState;

#[derive(Debug, Clone, Copy)]
pub struct DoNotContactGuard {
    refusal_cooldown_days: u32,
}

impl DoNotContactGuard {
    pub fn new(refusal_cooldown_days: u32) -> Self {
        Self {
            refusal_cooldown_days,
        }
    }

    pub fn check_contact(&self, contact: &Contact, now: Timestamp) -> Result<(), PlannerError> {
        self.check(contact.id, contact.opted_out, contact.last_refusal_at, now)
    }

    pub fn check_state(&self, state: &ContactState, now: Timestamp) -> Result<(), PlannerError> {
        self.check(state.contact_id, state.opted_out, state.last_refusal_at, now)
    }

    fn check(
        &self,
        contact_id: Uuid,
        opted_out: bool,
        last_refusal_at: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<(), PlannerError> {
        if opted_out {
            return Err(PlannerError::OptedOut(contact_id));
        }
        if let Some(refused) = last_refusal_at {
            let until = refused.plus_days(self.refusal_cooldown_days);
            if now < until {
                return Err(PlannerError::CoolingDown(contact_id, until));
            }
        }
        Ok(())
    }
}
