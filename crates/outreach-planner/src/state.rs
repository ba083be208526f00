//! The read-only projection of a contact that planning decisions run on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use outreach_core::attempt::{AttemptHistory, AttemptStatus};
use outreach_core::error::Result;
use outreach_core::types::{Contact, Insight, Organization, Timestamp};
use outreach_storage::{
    AttemptRepository, ContactRepository, Database, InsightRepository, OrganizationRepository,
};

/// Everything the selector and eligibility filter may look at.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactState {
    pub contact_id: Uuid,
    pub has_chat_identity: bool,
    pub has_linked_account: bool,
    pub engagement: u8,
    pub excitement: u8,
    pub is_paying: bool,
    pub last_conversation_at: Option<Timestamp>,
    pub opted_out: bool,
    pub last_refusal_at: Option<Timestamp>,
    pub persona: Option<String>,
    pub company_type: Option<String>,
    /// Current insights, `attribute -> value`.
    pub insights: BTreeMap<String, String>,
    /// Goals with an open attempt.
    pub open_goals: BTreeSet<String>,
    /// Goals already resolved as success or declined.
    pub closed_goals: BTreeSet<String>,
}

impl ContactState {
    pub fn from_parts(
        contact: &Contact,
        organization: Option<&Organization>,
        insights: &[Insight],
        attempts: &[AttemptHistory],
    ) -> Self {
        let mut open_goals = BTreeSet::new();
        let mut closed_goals = BTreeSet::new();
        for attempt in attempts {
            match attempt.status {
                AttemptStatus::Success | AttemptStatus::Declined => {
                    closed_goals.insert(attempt.goal_key.clone());
                }
                _ => {
                    open_goals.insert(attempt.goal_key.clone());
                }
            }
        }

        Self {
            contact_id: contact.id,
            has_chat_identity: contact.identity.has_chat_identity(),
            has_linked_account: contact.identity.has_linked_account(),
            engagement: contact.scores.engagement,
            excitement: contact.scores.excitement,
            is_paying: contact.is_paying,
            last_conversation_at: contact.last_conversation_at,
            opted_out: contact.opted_out,
            last_refusal_at: contact.last_refusal_at,
            persona: contact.persona.clone(),
            company_type: organization.and_then(|o| o.company_type.clone()),
            insights: insights
                .iter()
                .filter(|i| i.is_current)
                .map(|i| (i.attribute.clone(), i.value.clone()))
                .collect(),
            open_goals,
            closed_goals,
        }
    }

    /// Whether the contact has already been pursued for `goal_key`, either
    /// right now or to completion.
    pub fn has_history_for(&self, goal_key: &str) -> bool {
        self.open_goals.contains(goal_key) || self.closed_goals.contains(goal_key)
    }
}

/// Assembles [`ContactState`] from storage.
pub struct StateReader {
    contacts: ContactRepository,
    organizations: OrganizationRepository,
    insights: InsightRepository,
    attempts: AttemptRepository,
}

impl StateReader {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            contacts: ContactRepository::new(db.clone()),
            organizations: OrganizationRepository::new(db.clone()),
            insights: InsightRepository::new(db.clone()),
            attempts: AttemptRepository::new(db),
        }
    }

    pub fn load(&self, contact_id: Uuid) -> Result<ContactState> {
        let contact = self.contacts.require(contact_id)?;
        self.project(&contact)
    }

    pub fn project(&self, contact: &Contact) -> Result<ContactState> {
        let organization = match contact.organization_id {
            Some(org_id) => self.organizations.get(org_id)?,
            None => None,
        };
        let insights = self.insights.current_for_contact(contact.id)?;
        let attempts = self.attempts.list_for_contact(contact.id)?;
        Ok(ContactState::from_parts(
            contact,
            organization.as_ref(),
            &insights,
            &attempts,
        ))
    }
}
