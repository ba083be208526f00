use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SECONDS_PER_DAY: i64 = 86_400;

// =============================================================================
// Timestamp
// =============================================================================

/// Unix timestamp in whole seconds (UTC).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    pub fn plus_days(&self, days: u32) -> Self {
        Self(self.0 + days as i64 * SECONDS_PER_DAY)
    }

    pub fn minus_days(&self, days: u32) -> Self {
        Self(self.0 - days as i64 * SECONDS_PER_DAY)
    }

    pub fn minus_hours(&self, hours: u32) -> Self {
        Self(self.0 - hours as i64 * 3600)
    }

    pub fn minus_minutes(&self, minutes: u32) -> Self {
        Self(self.0 - minutes as i64 * 60)
    }

    /// Whole days elapsed from `self` until `now`. Negative spans count as 0.
    pub fn days_until(&self, now: Timestamp) -> u32 {
        ((now.0 - self.0).max(0) / SECONDS_PER_DAY) as u32
    }

    /// Day index since the epoch, used to count distinct active days.
    pub fn day_index(&self) -> i64 {
        self.0.div_euclid(SECONDS_PER_DAY)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// =============================================================================
// Contact identity
// =============================================================================

/// How a contact is reachable.
///
/// A chat-only contact can later link an account; an email-only contact has
/// never been seen in chat. Every variant resolves to one canonical key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    ChatOnly {
        chat_user_id: String,
    },
    AccountLinked {
        account_id: String,
        chat_user_id: Option<String>,
        email: Option<String>,
    },
    EmailOnly {
        email: String,
    },
}

impl Identity {
    pub fn has_chat_identity(&self) -> bool {
        match self {
            Identity::ChatOnly { .. } => true,
            Identity::AccountLinked { chat_user_id, .. } => chat_user_id.is_some(),
            Identity::EmailOnly { .. } => false,
        }
    }

    pub fn has_linked_account(&self) -> bool {
        matches!(self, Identity::AccountLinked { .. })
    }

    pub fn chat_user_id(&self) -> Option<&str> {
        match self {
            Identity::ChatOnly { chat_user_id } => Some(chat_user_id),
            Identity::AccountLinked { chat_user_id, .. } => chat_user_id.as_deref(),
            Identity::EmailOnly { .. } => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Identity::ChatOnly { .. } => None,
            Identity::AccountLinked { email, .. } => email.as_deref(),
            Identity::EmailOnly { email } => Some(email),
        }
    }

    /// The key used to resolve any observation of this person to a single
    /// contact row. Linked accounts take precedence over chat and email.
    pub fn canonical_key(&self) -> String {
        match self {
            Identity::AccountLinked { account_id, .. } => format!("account:{}", account_id),
            Identity::ChatOnly { chat_user_id } => format!("chat:{}", chat_user_id),
            Identity::EmailOnly { email } => format!("email:{}", email.trim().to_lowercase()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Identity::ChatOnly { .. } => "chat_only",
            Identity::AccountLinked { .. } => "account_linked",
            Identity::EmailOnly { .. } => "email_only",
        }
    }

    /// Attach an account to this identity, keeping known chat/email handles.
    pub fn link_account(&self, account_id: &str) -> Identity {
        Identity::AccountLinked {
            account_id: account_id.to_string(),
            chat_user_id: self.chat_user_id().map(str::to_string),
            email: self.email().map(str::to_string),
        }
    }
}

// =============================================================================
// Scores
// =============================================================================

/// Coarse relationship maturity of a contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    New,
    Active,
    Engaged,
    Champion,
    AtRisk,
}

impl LifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Engaged => "engaged",
            Self::Champion => "champion",
            Self::AtRisk => "at_risk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "active" => Some(Self::Active),
            "engaged" => Some(Self::Engaged),
            "champion" => Some(Self::Champion),
            "at_risk" => Some(Self::AtRisk),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded engagement sub-scores. Each field is at most its ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementComponents {
    pub chat_activity: u8,
    pub message_engagement: u8,
    pub conversation_activity: u8,
    pub community_participation: u8,
}

impl EngagementComponents {
    pub fn total(&self) -> u32 {
        self.chat_activity as u32
            + self.message_engagement as u32
            + self.conversation_activity as u32
            + self.community_participation as u32
    }
}

/// The last computed score snapshot for a contact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub engagement: u8,
    pub excitement: u8,
    pub lifecycle_stage: LifecycleStage,
    pub components: EngagementComponents,
    pub computed_at: Option<Timestamp>,
}

// =============================================================================
// Contact
// =============================================================================

/// Any identifiable person the system might communicate with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub identity: Identity,
    pub display_name: Option<String>,
    pub organization_id: Option<Uuid>,
    pub opted_out: bool,
    pub is_paying: bool,
    pub persona: Option<String>,
    pub scores: ScoreSnapshot,
    pub last_conversation_at: Option<Timestamp>,
    pub last_refusal_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Contact {
    /// A fresh contact first observed through `identity`.
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            display_name: None,
            organization_id: None,
            opted_out: false,
            is_paying: false,
            persona: None,
            scores: ScoreSnapshot::default(),
            last_conversation_at: None,
            last_refusal_at: None,
            created_at: Timestamp::now(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    /// Name used when rendering templates.
    pub fn greeting_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("there")
    }

    /// Combined score used to pick an organization's champion.
    pub fn combined_score(&self) -> u32 {
        self.scores.engagement as u32 + self.scores.excitement as u32
    }
}

// =============================================================================
// Organization
// =============================================================================

/// Commercial lifecycle of an organization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgLifecycleStage {
    #[default]
    Prospect,
    Evaluating,
    Trial,
    Paying,
    Churned,
    AtRisk,
}

impl OrgLifecycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prospect => "prospect",
            Self::Evaluating => "evaluating",
            Self::Trial => "trial",
            Self::Paying => "paying",
            Self::Churned => "churned",
            Self::AtRisk => "at_risk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prospect" => Some(Self::Prospect),
            "evaluating" => Some(Self::Evaluating),
            "trial" => Some(Self::Trial),
            "paying" => Some(Self::Paying),
            "churned" => Some(Self::Churned),
            "at_risk" => Some(Self::AtRisk),
            _ => None,
        }
    }
}

/// Manually set interest level for an organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl InterestLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "very_high" => Some(Self::VeryHigh),
            _ => None,
        }
    }
}

/// Aggregate of member contacts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub company_type: Option<String>,
    pub lifecycle_stage: OrgLifecycleStage,
    pub interest_level: Option<InterestLevel>,
    /// Canonical additive score, 0-100.
    pub engagement_score: u8,
    pub engagement_reasons: Vec<String>,
    /// Priority tier 1-5, always derived from the same snapshot as the score.
    pub engagement_level: u8,
    pub champion_contact_id: Option<Uuid>,
    pub scores_computed_at: Option<Timestamp>,
}

impl Organization {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            company_type: None,
            lifecycle_stage: OrgLifecycleStage::Prospect,
            interest_level: None,
            engagement_score: 0,
            engagement_reasons: Vec::new(),
            engagement_level: 1,
            champion_contact_id: None,
            scores_computed_at: None,
        }
    }
}

// =============================================================================
// Activity signals
// =============================================================================

/// Kinds of raw activity recorded against a contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ChatMessage,
    MessageOpened,
    MessageClicked,
    Conversation,
    CommunityActivity,
    GroupMembership,
    EventInterest,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::MessageOpened => "message_opened",
            Self::MessageClicked => "message_clicked",
            Self::Conversation => "conversation",
            Self::CommunityActivity => "community_activity",
            Self::GroupMembership => "group_membership",
            Self::EventInterest => "event_interest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat_message" => Some(Self::ChatMessage),
            "message_opened" => Some(Self::MessageOpened),
            "message_clicked" => Some(Self::MessageClicked),
            "conversation" => Some(Self::Conversation),
            "community_activity" => Some(Self::CommunityActivity),
            "group_membership" => Some(Self::GroupMembership),
            "event_interest" => Some(Self::EventInterest),
            _ => None,
        }
    }
}

/// Windowed activity counts for one contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySignals {
    pub chat_messages: u32,
    pub chat_active_days: u32,
    pub messages_opened: u32,
    pub messages_clicked: u32,
    pub conversations: u32,
    pub community_activities: u32,
}

/// Windowed activity counts for an organization's members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgSignals {
    pub chat_users: u32,
    pub team_members: u32,
    pub group_memberships: u32,
    pub recent_activities: u32,
    pub message_engagement: u32,
    pub event_interest: u32,
    pub interest_level: Option<InterestLevel>,
    pub lifecycle_stage: OrgLifecycleStage,
}

// =============================================================================
// Insights
// =============================================================================

/// Where an insight came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Outcome,
    Classifier,
    Manual,
    Import,
}

impl InsightSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outcome => "outcome",
            Self::Classifier => "classifier",
            Self::Manual => "manual",
            Self::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outcome" => Some(Self::Outcome),
            "classifier" => Some(Self::Classifier),
            "manual" => Some(Self::Manual),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

/// A versioned, sourced fact about a contact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub attribute: String,
    pub value: String,
    pub confidence: f32,
    pub source: InsightSource,
    pub is_current: bool,
    /// The insight this one replaced, if any.
    pub supersedes: Option<Uuid>,
    pub created_at: Timestamp,
}

impl Insight {
    pub fn new(
        contact_id: Uuid,
        attribute: &str,
        value: &str,
        confidence: f32,
        source: InsightSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            attribute: attribute.to_string(),
            value: value.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
            is_current: true,
            supersedes: None,
            created_at: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp(1_700_000_000);
        assert_eq!(ts.plus_days(1).0, 1_700_086_400);
        assert_eq!(ts.minus_days(1).0, 1_699_913_600);
        assert_eq!(ts.minus_hours(2).0, 1_699_992_800);
        assert_eq!(ts.minus_days(8).days_until(ts), 8);
        assert_eq!(ts.plus_days(3).days_until(ts), 0);
    }

    #[test]
    fn test_timestamp_serde_round_trip() {
        let ts = Timestamp::now();
        let json = serde_json::to_string(&ts).unwrap();
        let rt: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(ts, rt);
    }

    #[test]
    fn test_identity_capabilities() {
        let chat = Identity::ChatOnly {
            chat_user_id: "u1".to_string(),
        };
        assert!(chat.has_chat_identity());
        assert!(!chat.has_linked_account());

        let email = Identity::EmailOnly {
            email: "a@b.org".to_string(),
        };
        assert!(!email.has_chat_identity());
        assert!(!email.has_linked_account());

        let linked = chat.link_account("acct-9");
        assert!(linked.has_chat_identity());
        assert!(linked.has_linked_account());
        assert_eq!(linked.chat_user_id(), Some("u1"));
    }

    #[test]
    fn test_canonical_key_prefers_account() {
        let linked = Identity::AccountLinked {
            account_id: "acct-1".to_string(),
            chat_user_id: Some("u1".to_string()),
            email: Some("x@y.z".to_string()),
        };
        assert_eq!(linked.canonical_key(), "account:acct-1");
    }

    #[test]
    fn test_canonical_key_normalizes_email() {
        let email = Identity::EmailOnly {
            email: "  Pat@Example.ORG ".to_string(),
        };
        assert_eq!(email.canonical_key(), "email:pat@example.org");
    }

    #[test]
    fn test_identity_serde_is_tagged() {
        let chat = Identity::ChatOnly {
            chat_user_id: "u1".to_string(),
        };
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["kind"], "chat_only");
        let rt: Identity = serde_json::from_value(json).unwrap();
        assert_eq!(rt, chat);
    }

    #[test]
    fn test_lifecycle_stage_parse() {
        for stage in [
            LifecycleStage::New,
            LifecycleStage::Active,
            LifecycleStage::Engaged,
            LifecycleStage::Champion,
            LifecycleStage::AtRisk,
        ] {
            assert_eq!(LifecycleStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(LifecycleStage::parse("dormant"), None);
    }

    #[test]
    fn test_signal_kind_parse() {
        assert_eq!(SignalKind::parse("chat_message"), Some(SignalKind::ChatMessage));
        assert_eq!(SignalKind::parse("event_interest"), Some(SignalKind::EventInterest));
        assert_eq!(SignalKind::parse("bogus"), None);
    }

    #[test]
    fn test_insight_confidence_clamped() {
        let insight = Insight::new(Uuid::new_v4(), "x", "y", 1.7, InsightSource::Manual);
        assert_eq!(insight.confidence, 1.0);
        assert!(insight.is_current);
        assert!(insight.supersedes.is_none());
    }

    #[test]
    fn test_contact_greeting_name() {
        let contact = Contact::new(Identity::EmailOnly {
            email: "a@b.c".to_string(),
        });
        assert_eq!(contact.greeting_name(), "there");
        assert_eq!(contact.with_name("Robin").greeting_name(), "Robin");
    }
}
