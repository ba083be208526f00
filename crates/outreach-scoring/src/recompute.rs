//! Staleness-driven recompute batches for contacts and organizations.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use outreach_core::error::{OutreachError, Result};
use outreach_core::types::{ScoreSnapshot, Timestamp};
use outreach_storage::{ContactRepository, Database, OrganizationRepository};

use crate::composer::ScoreComposer;
use crate::organization::{select_champion, OrgEngagement};

/// Outcome of one bounded recompute run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Recomputes stale scores and persists them.
pub struct RecomputeService {
    composer: ScoreComposer,
    contacts: ContactRepository,
    organizations: OrganizationRepository,
}

impl RecomputeService {
    pub fn new(db: Arc<Database>, composer: ScoreComposer) -> Self {
        Self {
            composer,
            contacts: ContactRepository::new(db.clone()),
            organizations: OrganizationRepository::new(db),
        }
    }

    /// Recompute and persist one contact's scores now.
    pub fn recompute_contact(&self, contact_id: Uuid, now: Timestamp) -> Result<ScoreSnapshot> {
        let contact = self.contacts.require(contact_id)?;
        let snapshot = self.composer.compose(&contact, now)?;
        self.contacts.update_scores(contact.id, &snapshot)?;
        Ok(snapshot)
    }

    /// Recompute up to `batch_size` contacts whose scores are missing or
    /// older than the freshness window, never-computed first.
    pub fn recompute_stale_contacts(&self, now: Timestamp) -> Result<RecomputeSummary> {
        let config = self.composer.config();
        let cutoff = now.minus_hours(config.freshness_hours);
        let stale = self.contacts.list_stale(cutoff, config.batch_size)?;

        let mut summary = RecomputeSummary::default();
        for contact in stale {
            let result = self
                .composer
                .compose(&contact, now)
                .and_then(|snapshot| self.contacts.update_scores(contact.id, &snapshot));
            match result {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    warn!(contact_id = %contact.id, error = %e, "Score recompute failed");
                    summary.failed += 1;
                }
            }
        }

        if summary.processed > 0 || summary.failed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Contact score recompute complete"
            );
        }
        Ok(summary)
    }

    /// Recompute and persist one organization's engagement, tier, and
    /// champion from a single snapshot.
    pub fn recompute_organization(&self, org_id: Uuid, now: Timestamp) -> Result<OrgEngagement> {
        let org = self
            .organizations
            .get(org_id)?
            .ok_or_else(|| OutreachError::NotFound(format!("organization {}", org_id)))?;
        let engagement = self.composer.compose_org(&org, now)?;
        let members = self.contacts.list_by_organization(org.id)?;
        let champion = select_champion(&members);
        self.organizations.update_engagement(
            org.id,
            engagement.score,
            &engagement.reasons,
            engagement.level,
            champion,
            now,
        )?;
        Ok(engagement)
    }

    /// Recompute up to `batch_size` stale organizations.
    pub fn recompute_stale_organizations(&self, now: Timestamp) -> Result<RecomputeSummary> {
        let config = self.composer.config();
        let cutoff = now.minus_hours(config.freshness_hours);
        let stale = self.organizations.list_stale(cutoff, config.batch_size)?;

        let mut summary = RecomputeSummary::default();
        for org in stale {
            match self.recompute_organization(org.id, now) {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    warn!(org_id = %org.id, error = %e, "Organization recompute failed");
                    summary.failed += 1;
                }
            }
        }

        if summary.processed > 0 || summary.failed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Organization recompute complete"
            );
        }
        Ok(summary)
    }
}
