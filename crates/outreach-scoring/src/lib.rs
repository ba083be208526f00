//! Outreach scoring crate - turns raw activity signals and insights into
//! bounded engagement/excitement scores, a lifecycle stage, and organization
//! engagement tiers.
//!
//! Composition is pure; the [`recompute`] module drives it over stale rows in
//! storage. Lost updates between concurrent recomputes are tolerated since the
//! next run converges.

pub mod aggregator;
pub mod composer;
pub mod engagement;
pub mod lifecycle;
pub mod organization;
pub mod recompute;

pub use aggregator::{SignalSource, SqliteSignalSource};
pub use composer::ScoreComposer;
pub use engagement::{compute_engagement, compute_excitement, EngagementScore};
pub use lifecycle::determine_lifecycle_stage;
pub use organization::{
    compute_org_engagement, compute_org_engagement_level, select_champion, OrgEngagement,
};
pub use recompute::{RecomputeService, RecomputeSummary};
