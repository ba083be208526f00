//! Organization engagement aggregation.
//!
//! The additive score is canonical. The 1-5 tier is derived from the same
//! snapshot in the same call, so the two can never disagree.

use serde::Serialize;
use uuid::Uuid;

use outreach_core::types::{Contact, InterestLevel, OrgLifecycleStage, OrgSignals};

const LOW_INTEREST_CAP: u32 = 20;

/// Additive organization engagement with its explanation and tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrgEngagement {
    pub score: u8,
    pub reasons: Vec<String>,
    pub level: u8,
}

struct Bucket {
    label: &'static str,
    count: u32,
    points_each: u32,
    max: u32,
}

/// Score an organization from member-derived signals.
pub fn compute_org_engagement(signals: &OrgSignals) -> OrgEngagement {
    let buckets = [
        Bucket { label: "chat users", count: signals.chat_users, points_each: 5, max: 20 },
        Bucket { label: "team members", count: signals.team_members, points_each: 5, max: 15 },
        Bucket {
            label: "group memberships",
            count: signals.group_memberships,
            points_each: 5,
            max: 15,
        },
        Bucket {
            label: "recent activities",
            count: signals.recent_activities,
            points_each: 2,
            max: 20,
        },
        Bucket {
            label: "message engagements",
            count: signals.message_engagement,
            points_each: 1,
            max: 10,
        },
        Bucket {
            label: "event interest signals",
            count: signals.event_interest,
            points_each: 5,
            max: 10,
        },
    ];

    let mut total = 0u32;
    let mut reasons = Vec::new();
    for bucket in &buckets {
        let points = bucket.count.saturating_mul(bucket.points_each).min(bucket.max);
        if points > 0 {
            reasons.push(format!("{} {} (+{})", bucket.count, bucket.label, points));
            total += points;
        }
    }

    match signals.interest_level {
        Some(InterestLevel::Medium) => {
            total += 5;
            reasons.push("medium interest (+5)".to_string());
        }
        Some(InterestLevel::High) => {
            total += 10;
            reasons.push("high interest (+10)".to_string());
        }
        Some(InterestLevel::VeryHigh) => {
            total += 20;
            reasons.push("very high interest (+20)".to_string());
        }
        Some(InterestLevel::Low) => {
            if total > LOW_INTEREST_CAP {
                total = LOW_INTEREST_CAP;
            }
            reasons.push(format!("low interest (capped at {})", LOW_INTEREST_CAP));
        }
        None => {}
    }

    let score = total.min(100) as u8;
    OrgEngagement {
        score,
        level: compute_org_engagement_level(score, signals),
        reasons,
    }
}

/// Priority tier 1-5 by first-match over the same snapshot.
pub fn compute_org_engagement_level(score: u8, signals: &OrgSignals) -> u8 {
    let stage = signals.lifecycle_stage;
    let very_high = signals.interest_level == Some(InterestLevel::VeryHigh);

    if (stage == OrgLifecycleStage::Paying && score >= 60) || very_high {
        5
    } else if score >= 60 || stage == OrgLifecycleStage::Trial {
        4
    } else if score >= 35 || stage == OrgLifecycleStage::Evaluating {
        3
    } else if score >= 10 {
        2
    } else {
        1
    }
}

/// The member with the highest engagement + excitement; ties go to the
/// earliest created contact.
pub fn select_champion(members: &[Contact]) -> Option<Uuid> {
    members
        .iter()
        .max_by(|a, b| {
            a.combined_score()
                .cmp(&b.combined_score())
                .then_with(|| b.created_at.cmp(&a.created_at))
        })
        .map(|c| c.id)
}
