//! Score composition for a single contact or organization.

use std::sync::Arc;

use tracing::debug;

use outreach_core::config::ScoringConfig;
use outreach_core::error::Result;
use outreach_core::types::{Contact, Organization, ScoreSnapshot, Timestamp};

use crate::aggregator::SignalSource;
use crate::engagement::{compute_engagement, compute_excitement};
use crate::lifecycle::determine_lifecycle_stage;
use crate::organization::{compute_org_engagement, OrgEngagement};

/// Reads windowed signals and produces score snapshots. Holds no state
/// beyond its configuration; the caller decides when to persist.
pub struct ScoreComposer {
    source: Arc<dyn SignalSource>,
    config: ScoringConfig,
}

impl ScoreComposer {
    pub fn new(source: Arc<dyn SignalSource>, config: ScoringConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Compute a fresh snapshot for `contact` as of `now`.
    ///
    /// The previously stored engagement feeds the at-risk rule only when a
    /// snapshot was actually computed before.
    pub fn compose(&self, contact: &Contact, now: Timestamp) -> Result<ScoreSnapshot> {
        let since = now.minus_days(self.config.window_days);
        let activity = self.source.activity(contact.id, since)?;
        let insights = self.source.current_insights(contact.id)?;

        let engagement = compute_engagement(&activity);
        let excitement = compute_excitement(&insights, &self.config.positive_signal_attributes);
        let previous = contact
            .scores
            .computed_at
            .map(|_| contact.scores.engagement);
        let stage = determine_lifecycle_stage(engagement.score, excitement, previous);

        debug!(
            contact_id = %contact.id,
            engagement = engagement.score,
            excitement,
            stage = %stage,
            "Composed scores"
        );

        Ok(ScoreSnapshot {
            engagement: engagement.score,
            excitement,
            lifecycle_stage: stage,
            components: engagement.components,
            computed_at: Some(now),
        })
    }

    /// Compute organization engagement as of `now`.
    pub fn compose_org(&self, org: &Organization, now: Timestamp) -> Result<OrgEngagement> {
        let since = now.minus_days(self.config.window_days);
        let signals = self.source.org_signals(org.id, since)?;
        Ok(compute_org_engagement(&signals))
    }
}
