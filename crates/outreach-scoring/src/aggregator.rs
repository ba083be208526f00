//! Windowed signal reads consumed by the score composer.

use std::sync::Arc;

use uuid::Uuid;

use outreach_core::error::Result;
use outreach_core::types::{ActivitySignals, Insight, OrgSignals, Timestamp};
use outreach_storage::{Database, InsightRepository, OrganizationRepository, SignalRepository};

/// Source of structured signal reads.
///
/// Scoring never touches raw tables directly; anything that can answer these
/// three questions can drive the composer.
pub trait SignalSource: Send + Sync {
    /// Activity counts for a contact since `since`.
    fn activity(&self, contact_id: Uuid, since: Timestamp) -> Result<ActivitySignals>;

    /// Current insights for a contact.
    fn current_insights(&self, contact_id: Uuid) -> Result<Vec<Insight>>;

    /// Member-derived counts for an organization since `since`.
    fn org_signals(&self, org_id: Uuid, since: Timestamp) -> Result<OrgSignals>;
}

/// SQLite-backed signal source.
pub struct SqliteSignalSource {
    signals: SignalRepository,
    insights: InsightRepository,
    organizations: OrganizationRepository,
}

impl SqliteSignalSource {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            signals: SignalRepository::new(db.clone()),
            insights: InsightRepository::new(db.clone()),
            organizations: OrganizationRepository::new(db),
        }
    }
}

impl SignalSource for SqliteSignalSource {
    fn activity(&self, contact_id: Uuid, since: Timestamp) -> Result<ActivitySignals> {
        self.signals.activity(contact_id, since)
    }

    fn current_insights(&self, contact_id: Uuid) -> Result<Vec<Insight>> {
        self.insights.current_for_contact(contact_id)
    }

    fn org_signals(&self, org_id: Uuid, since: Timestamp) -> Result<OrgSignals> {
        self.organizations.signals(org_id, since)
    }
}
