//! Engagement and excitement scoring.
//!
//! Each engagement sub-score is ceilinged on its own before summation so a
//! flood of one kind of activity cannot dominate the total.

use outreach_core::types::{ActivitySignals, EngagementComponents, Insight};

pub const CHAT_ACTIVITY_MAX: u32 = 30;
pub const MESSAGE_ENGAGEMENT_MAX: u32 = 25;
pub const CONVERSATION_ACTIVITY_MAX: u32 = 25;
pub const COMMUNITY_PARTICIPATION_MAX: u32 = 20;

pub const EXCITEMENT_COUNT_MAX: u32 = 50;
pub const EXCITEMENT_CONFIDENCE_MAX: u32 = 50;

const POINTS_PER_CHAT_MESSAGE: u32 = 1;
const POINTS_PER_ACTIVE_DAY: u32 = 2;
const POINTS_PER_OPEN: u32 = 2;
const POINTS_PER_CLICK: u32 = 5;
const POINTS_PER_CONVERSATION: u32 = 5;
const POINTS_PER_COMMUNITY_ACTIVITY: u32 = 4;
const POINTS_PER_POSITIVE_INSIGHT: u32 = 10;

/// Engagement total with its bounded parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementScore {
    pub score: u8,
    pub components: EngagementComponents,
}

fn capped(points: u32, max: u32) -> u8 {
    points.min(max) as u8
}

/// Compute engagement (0-100) from windowed activity counts.
pub fn compute_engagement(signals: &ActivitySignals) -> EngagementScore {
    let chat = signals
        .chat_messages
        .saturating_mul(POINTS_PER_CHAT_MESSAGE)
        .saturating_add(signals.chat_active_days.saturating_mul(POINTS_PER_ACTIVE_DAY));
    let messages = signals
        .messages_opened
        .saturating_mul(POINTS_PER_OPEN)
        .saturating_add(signals.messages_clicked.saturating_mul(POINTS_PER_CLICK));
    let conversations = signals.conversations.saturating_mul(POINTS_PER_CONVERSATION);
    let community = signals
        .community_activities
        .saturating_mul(POINTS_PER_COMMUNITY_ACTIVITY);

    let components = EngagementComponents {
        chat_activity: capped(chat, CHAT_ACTIVITY_MAX),
        message_engagement: capped(messages, MESSAGE_ENGAGEMENT_MAX),
        conversation_activity: capped(conversations, CONVERSATION_ACTIVITY_MAX),
        community_participation: capped(community, COMMUNITY_PARTICIPATION_MAX),
    };

    EngagementScore {
        score: capped(components.total(), 100),
        components,
    }
}

/// Compute excitement (0-100) from current positive-signal insights only.
///
/// Count points reward breadth of positive signals; confidence points reward
/// how sure we are about them.
pub fn compute_excitement(insights: &[Insight], positive_attributes: &[String]) -> u8 {
    let positive: Vec<&Insight> = insights
        .iter()
        .filter(|i| i.is_current && positive_attributes.iter().any(|a| a == &i.attribute))
        .collect();

    if positive.is_empty() {
        return 0;
    }

    let count_points = (positive.len() as u32)
        .saturating_mul(POINTS_PER_POSITIVE_INSIGHT)
        .min(EXCITEMENT_COUNT_MAX);

    let mean_confidence =
        positive.iter().map(|i| i.confidence.clamp(0.0, 1.0)).sum::<f32>() / positive.len() as f32;
    let confidence_points =
        ((mean_confidence * EXCITEMENT_CONFIDENCE_MAX as f32).round() as u32)
            .min(EXCITEMENT_CONFIDENCE_MAX);

    capped(count_points + confidence_points, 100)
}
