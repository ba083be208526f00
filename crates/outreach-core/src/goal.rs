//! Goal catalog types: goals, their eligibility predicates, and the outcome
//! rules that map a classified reply to an action.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Classification vocabulary
// =============================================================================

/// Coarse sentiment of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Refusal,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Neutral => write!(f, "neutral"),
            Sentiment::Negative => write!(f, "negative"),
            Sentiment::Refusal => write!(f, "refusal"),
        }
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            "refusal" => Ok(Sentiment::Refusal),
            _ => Err(format!("Unknown sentiment: {}", s)),
        }
    }
}

/// What the reply says the contact wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Converted,
    Interested,
    Deferred,
    Question,
    Objection,
    Refusal,
    Ignored,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Converted => write!(f, "converted"),
            Intent::Interested => write!(f, "interested"),
            Intent::Deferred => write!(f, "deferred"),
            Intent::Question => write!(f, "question"),
            Intent::Objection => write!(f, "objection"),
            Intent::Refusal => write!(f, "refusal"),
            Intent::Ignored => write!(f, "ignored"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "converted" => Ok(Intent::Converted),
            "interested" => Ok(Intent::Interested),
            "deferred" => Ok(Intent::Deferred),
            "question" => Ok(Intent::Question),
            "objection" => Ok(Intent::Objection),
            "refusal" => Ok(Intent::Refusal),
            "ignored" => Ok(Intent::Ignored),
            _ => Err(format!("Unknown intent: {}", s)),
        }
    }
}

/// Which path produced a decision or a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    /// A declared rule or pattern matched.
    RuleMatch,
    /// No rule matched; a deterministic fallback decided.
    Heuristic,
    /// An LLM-assisted collaborator decided.
    Llm,
}

impl fmt::Display for DecisionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionMethod::RuleMatch => write!(f, "rule_match"),
            DecisionMethod::Heuristic => write!(f, "heuristic"),
            DecisionMethod::Llm => write!(f, "llm"),
        }
    }
}

impl std::str::FromStr for DecisionMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule_match" => Ok(DecisionMethod::RuleMatch),
            "heuristic" => Ok(DecisionMethod::Heuristic),
            "llm" => Ok(DecisionMethod::Llm),
            _ => Err(format!("Unknown decision method: {}", s)),
        }
    }
}

// =============================================================================
// Goals
// =============================================================================

/// Eligibility predicates over a contact's current state.
///
/// Insight maps are `attribute -> value`; a value of `"*"` matches any value
/// of that attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Eligibility {
    pub requires_linked_account: bool,
    pub requires_company_types: Vec<String>,
    pub min_engagement: Option<u8>,
    pub requires_insights: BTreeMap<String, String>,
    pub excludes_insights: BTreeMap<String, String>,
    pub requires_persona: Option<String>,
}

/// A named outreach objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub eligibility: Eligibility,
    #[serde(default)]
    pub priority: i32,
    pub message_template: String,
    #[serde(default)]
    pub follow_up_template: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_days_between_attempts")]
    pub days_between_attempts: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_days_between_attempts() -> u32 {
    7
}

fn default_enabled() -> bool {
    true
}

impl Goal {
    /// The single `default`-trigger outcome, if present.
    pub fn default_outcome(&self) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| matches!(o.trigger, Trigger::Default))
    }

    /// Template for the given attempt number (0-based).
    pub fn template_for_attempt(&self, attempt_count: u32) -> &str {
        match (&self.follow_up_template, attempt_count) {
            (Some(follow_up), n) if n > 0 => follow_up,
            _ => &self.message_template,
        }
    }
}

/// What fires an outcome rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Trigger {
    Sentiment(Sentiment),
    Intent(Intent),
    /// Case-insensitive substring of the raw reply.
    Keyword(String),
    /// No reply arrived within the goal's attempt interval.
    Timeout,
    /// Applies when nothing else matches.
    Default,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Sentiment(s) => write!(f, "sentiment={}", s),
            Trigger::Intent(i) => write!(f, "intent={}", i),
            Trigger::Keyword(k) => write!(f, "keyword={}", k),
            Trigger::Timeout => write!(f, "timeout"),
            Trigger::Default => write!(f, "default"),
        }
    }
}

/// The kind of action an outcome applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Decline,
    Defer,
    /// Ask again: the pair returns to pending with its attempt count
    /// unchanged; only the next send counts.
    Clarify,
    /// Hand the pair to a human; automation halts until resolved.
    Escalate,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::Decline => write!(f, "decline"),
            OutcomeKind::Defer => write!(f, "defer"),
            OutcomeKind::Clarify => write!(f, "clarify"),
            OutcomeKind::Escalate => write!(f, "escalate"),
        }
    }
}

/// An insight to record when an outcome applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSpec {
    pub attribute: String,
    pub value: String,
    #[serde(default = "default_insight_confidence")]
    pub confidence: f32,
}

fn default_insight_confidence() -> f32 {
    0.8
}

/// The action half of an outcome rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeAction {
    pub kind: OutcomeKind,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub next_goal: Option<String>,
    #[serde(default)]
    pub defer_days: Option<u32>,
    #[serde(default)]
    pub insight: Option<InsightSpec>,
}

impl OutcomeAction {
    pub fn of(kind: OutcomeKind) -> Self {
        Self {
            kind,
            response_text: None,
            next_goal: None,
            defer_days: None,
            insight: None,
        }
    }
}

/// A rule mapping a classified response to an action for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub priority: i32,
    pub action: OutcomeAction,
}

/// Serialized form of the whole goal catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalCatalog {
    #[serde(default)]
    pub goals: Vec<Goal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentiment_from_str() {
        assert_eq!("refusal".parse::<Sentiment>().unwrap(), Sentiment::Refusal);
        assert!("angry".parse::<Sentiment>().is_err());
    }

    #[test]
    fn test_intent_display_round_trip() {
        for intent in [
            Intent::Converted,
            Intent::Interested,
            Intent::Deferred,
            Intent::Question,
            Intent::Objection,
            Intent::Refusal,
            Intent::Ignored,
        ] {
            assert_eq!(intent.to_string().parse::<Intent>().unwrap(), intent);
        }
    }

    #[test]
    fn test_decision_method_display() {
        assert_eq!(DecisionMethod::RuleMatch.to_string(), "rule_match");
        assert_eq!(DecisionMethod::Llm.to_string(), "llm");
        assert_eq!(
            "heuristic".parse::<DecisionMethod>().unwrap(),
            DecisionMethod::Heuristic
        );
    }

    #[test]
    fn test_catalog_parses_from_toml() {
        let content = r#"
[[goals]]
key = "initial_contact"
name = "Say hello"
priority = 10
message_template = "Hi {name}!"

[goals.eligibility]
excludes_insights = { opted_for_digest = "*" }

[[goals.outcomes]]
name = "refused"
priority = 100
trigger = { type = "sentiment", value = "refusal" }
action = { kind = "decline" }

[[goals.outcomes]]
name = "silence"
trigger = { type = "timeout" }
action = { kind = "defer", defer_days = 10 }

[[goals.outcomes]]
name = "fallback"
trigger = { type = "default" }
action = { kind = "escalate" }
"#;
        let catalog: GoalCatalog = toml::from_str(content).unwrap();
        let goal = &catalog.goals[0];
        assert_eq!(goal.max_attempts, 2);
        assert_eq!(goal.days_between_attempts, 7);
        assert!(goal.enabled);
        assert_eq!(goal.outcomes.len(), 3);
        assert_eq!(goal.outcomes[0].trigger, Trigger::Sentiment(Sentiment::Refusal));
        assert_eq!(goal.outcomes[1].trigger, Trigger::Timeout);
        assert_eq!(goal.outcomes[1].action.defer_days, Some(10));
        assert_eq!(goal.default_outcome().unwrap().name, "fallback");
        assert_eq!(
            goal.eligibility.excludes_insights.get("opted_for_digest"),
            Some(&"*".to_string())
        );
    }

    #[test]
    fn test_template_for_attempt() {
        let mut goal: Goal = toml::from_str(
            r#"
key = "k"
name = "n"
message_template = "first"
"#,
        )
        .unwrap();
        assert_eq!(goal.template_for_attempt(0), "first");
        assert_eq!(goal.template_for_attempt(1), "first");

        goal.follow_up_template = Some("again".to_string());
        assert_eq!(goal.template_for_attempt(0), "first");
        assert_eq!(goal.template_for_attempt(1), "again");
    }

    #[test]
    fn test_trigger_json_shape() {
        let json = serde_json::to_value(Trigger::Keyword("pricing".to_string())).unwrap();
        assert_eq!(json["type"], "keyword");
        assert_eq!(json["value"], "pricing");
    }
}
