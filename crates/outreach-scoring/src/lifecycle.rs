use outreach_core::types::LifecycleStage;

/// Classify a contact's relationship maturity. Pure and total.
///
/// Rules are checked in order: champion, engaged, at-risk (a previously
/// engaged contact whose activity collapsed), active, new.
pub fn determine_lifecycle_stage(
    engagement: u8,
    excitement: u8,
    previous_engagement: Option<u8>,
) -> LifecycleStage {
    if engagement >= 70 && excitement >= 70 {
        LifecycleStage::Champion
    } else if engagement >= 50 || excitement >= 50 {
        LifecycleStage::Engaged
    } else if previous_engagement.is_some_and(|prev| prev >= 40) && engagement < 20 {
        LifecycleStage::AtRisk
    } else if engagement >= 20 {
        LifecycleStage::Active
    } else {
        LifecycleStage::New
    }
}
