//! Goal selection.
//!
//! The base decision table is an ordered list of rules evaluated by a single
//! first-match combinator. In registry mode the table's pick competes with
//! every other eligible registry goal on declared priority; ties go to an
//! optional [`GoalArbiter`] and otherwise break deterministically.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use outreach_core::goal::{DecisionMethod, Goal};
use outreach_core::types::Timestamp;

use crate::eligibility::is_eligible;
use crate::error::PlannerError;
use crate::guard::DoNotContactGuard;
use crate::registry::GoalRegistry;
use crate::state::ContactState;

/// Goal keys the base table can produce. Every catalog must define them.
pub const BASE_GOAL_KEYS: [&str; 7] = [
    "link_account",
    "membership_pitch",
    "drive_value",
    "drive_engagement",
    "initial_contact",
    "learn_interests",
    "deepen_relationship",
];

/// One row of the base decision table.
pub struct Rule {
    pub goal_key: &'static str,
    pub reasoning: &'static str,
    pub applies: fn(&ContactState) -> bool,
}

fn chat_without_account(s: &ContactState) -> bool {
    s.has_chat_identity && !s.has_linked_account
}

fn engaged_non_member(s: &ContactState) -> bool {
    !s.is_paying && (s.engagement >= 50 || s.excitement >= 50)
}

fn quiet_paying_member(s: &ContactState) -> bool {
    s.is_paying && s.engagement < 30
}

fn low_activity(s: &ContactState) -> bool {
    s.engagement < 30 && s.excitement < 30
}

fn never_talked(s: &ContactState) -> bool {
    s.last_conversation_at.is_none()
}

fn moderate_engagement(s: &ContactState) -> bool {
    s.engagement < 50
}

fn always(_: &ContactState) -> bool {
    true
}

pub static BASE_RULES: [Rule; 7] = [
    Rule {
        goal_key: "link_account",
        reasoning: "chat identity without a linked account",
        applies: chat_without_account,
    },
    Rule {
        goal_key: "membership_pitch",
        reasoning: "engaged or excited but not a paying member",
        applies: engaged_non_member,
    },
    Rule {
        goal_key: "drive_value",
        reasoning: "paying member with low engagement",
        applies: quiet_paying_member,
    },
    Rule {
        goal_key: "drive_engagement",
        reasoning: "low engagement and low excitement",
        applies: low_activity,
    },
    Rule {
        goal_key: "initial_contact",
        reasoning: "no prior conversation",
        applies: never_talked,
    },
    Rule {
        goal_key: "learn_interests",
        reasoning: "moderate engagement; learn more about interests",
        applies: moderate_engagement,
    },
    Rule {
        goal_key: "deepen_relationship",
        reasoning: "well engaged; deepen the relationship",
        applies: always,
    },
];

/// The first item satisfying `pred`, in order.
pub fn first_match<'a, T>(items: &'a [T], pred: impl Fn(&T) -> bool) -> Option<&'a T> {
    items.iter().find(|item| pred(item))
}

fn is_base_goal(key: &str) -> bool {
    BASE_GOAL_KEYS.contains(&key)
}

/// A planner decision, persisted on the attempt it creates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalSelection {
    pub goal_key: String,
    pub reasoning: String,
    pub score: f32,
    pub method: DecisionMethod,
}

fn describe(rule: &Rule, state: &ContactState) -> String {
    format!(
        "{} (engagement {}, excitement {})",
        rule.reasoning, state.engagement, state.excitement
    )
}

fn base_rule(state: &ContactState) -> &'static Rule {
    first_match(&BASE_RULES, |r| (r.applies)(state)).unwrap_or(&BASE_RULES[BASE_RULES.len() - 1])
}

/// Evaluate only the base decision table. Pure and total.
pub fn select_base_goal(state: &ContactState) -> GoalSelection {
    let rule = base_rule(state);
    GoalSelection {
        goal_key: rule.goal_key.to_string(),
        reasoning: describe(rule, state),
        score: 0.0,
        method: DecisionMethod::RuleMatch,
    }
}

/// An arbiter's pick among equally ranked goals.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterChoice {
    pub goal_key: String,
    pub reasoning: String,
}

/// Breaks priority ties between eligible goals, typically with an LLM.
#[async_trait]
pub trait GoalArbiter: Send + Sync {
    async fn choose(
        &self,
        state: &ContactState,
        candidates: &[&Goal],
    ) -> Result<ArbiterChoice, PlannerError>;
}

/// Picks the next goal for a contact.
pub struct GoalSelector {
    registry: Arc<GoalRegistry>,
    guard: DoNotContactGuard,
    registry_mode: bool,
    arbiter: Option<Arc<dyn GoalArbiter>>,
}

impl GoalSelector {
    pub fn new(registry: Arc<GoalRegistry>, guard: DoNotContactGuard, registry_mode: bool) -> Self {
        Self {
            registry,
            guard,
            registry_mode,
            arbiter: None,
        }
    }

    pub fn with_arbiter(mut self, arbiter: Arc<dyn GoalArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn registry(&self) -> &Arc<GoalRegistry> {
        &self.registry
    }

    /// Select a goal for `state`.
    ///
    /// Fails only when the do-not-contact guard rejects the contact; every
    /// other path terminates with a selection.
    pub async fn select_goal(
        &self,
        state: &ContactState,
        now: Timestamp,
    ) -> Result<GoalSelection, PlannerError> {
        self.guard.check_state(state, now)?;

        let mut selection = if self.registry_mode {
            self.select_from_registry(state).await
        } else {
            select_base_goal(state)
        };
        if let Some(goal) = self.registry.get(&selection.goal_key) {
            selection.score = goal.priority as f32;
        }

        debug!(
            contact_id = %state.contact_id,
            goal = %selection.goal_key,
            method = %selection.method,
            reasoning = %selection.reasoning,
            "Goal selected"
        );
        Ok(selection)
    }

    async fn select_from_registry(&self, state: &ContactState) -> GoalSelection {
        let eligible = |key: &str| {
            self.registry
                .get(key)
                .is_some_and(|goal| is_eligible(goal, state))
        };
        let base_pick = first_match(&BASE_RULES, |r| (r.applies)(state) && eligible(r.goal_key));

        let mut candidates: Vec<&Goal> = self
            .registry
            .goals()
            .iter()
            .filter(|g| !is_base_goal(&g.key) && is_eligible(g, state))
            .collect();
        if let Some(goal) = base_pick.and_then(|r| self.registry.get(r.goal_key)) {
            candidates.push(goal);
        }

        let Some(top) = candidates.iter().map(|g| g.priority).max() else {
            let mut fallback = select_base_goal(state);
            fallback.reasoning = format!("no eligible registry goal; {}", fallback.reasoning);
            return fallback;
        };
        let tied: Vec<&Goal> = candidates.into_iter().filter(|g| g.priority == top).collect();

        if let [winner] = tied.as_slice() {
            let reasoning = match base_pick {
                Some(rule) if rule.goal_key == winner.key => describe(rule, state),
                _ => format!("registry goal {} eligible at priority {}", winner.key, top),
            };
            return GoalSelection {
                goal_key: winner.key.clone(),
                reasoning,
                score: 0.0,
                method: DecisionMethod::RuleMatch,
            };
        }

        if let Some(arbiter) = &self.arbiter {
            match arbiter.choose(state, &tied).await {
                Ok(choice) if tied.iter().any(|g| g.key == choice.goal_key) => {
                    return GoalSelection {
                        goal_key: choice.goal_key,
                        reasoning: choice.reasoning,
                        score: 0.0,
                        method: DecisionMethod::Llm,
                    };
                }
                Ok(choice) => warn!(
                    contact_id = %state.contact_id,
                    goal = %choice.goal_key,
                    "Arbiter chose a goal outside the tie; breaking it deterministically"
                ),
                Err(e) => warn!(
                    contact_id = %state.contact_id,
                    error = %e,
                    "Arbiter failed; breaking tie deterministically"
                ),
            }
        }

        let winner = base_pick
            .and_then(|r| tied.iter().find(|g| g.key == r.goal_key))
            .or_else(|| tied.iter().min_by(|a, b| a.key.cmp(&b.key)))
            .map(|g| g.key.clone())
            .unwrap_or_default();
        GoalSelection {
            reasoning: format!(
                "{} goals tied at priority {}; chose {} deterministically",
                tied.len(),
                top,
                winner
            ),
            goal_key: winner,
            score: 0.0,
            method: DecisionMethod::Heuristic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> ContactState {
        ContactState {
            has_linked_account: true,
            last_conversation_at: Some(Timestamp(1_600_000_000)),
            ..ContactState::default()
        }
    }

    fn selector(registry_mode: bool) -> GoalSelector {
        GoalSelector::new(
            Arc::new(GoalRegistry::builtin().unwrap()),
            DoNotContactGuard::new(90),
            registry_mode,
        )
    }

    fn registry_with_priority(key: &str, priority: i32) -> Arc<GoalRegistry> {
        let mut goals = GoalRegistry::builtin().unwrap().goals().to_vec();
        for g in goals.iter_mut().filter(|g| g.key == key) {
            g.priority = priority;
        }
        Arc::new(GoalRegistry::new(goals).unwrap())
    }

    // =====================================================================
    // Base table
    // =====================================================================

    #[test]
    fn test_base_table_order() {
        let chat_only = ContactState {
            has_chat_identity: true,
            engagement: 90,
            ..state()
        };
        let chat_only = ContactState {
            has_linked_account: false,
            ..chat_only
        };
        assert_eq!(select_base_goal(&chat_only).goal_key, "link_account");

        let engaged = ContactState { engagement: 55, ..state() };
        assert_eq!(select_base_goal(&engaged).goal_key, "membership_pitch");

        let excited = ContactState { excitement: 50, ..state() };
        assert_eq!(select_base_goal(&excited).goal_key, "membership_pitch");

        let quiet_payer = ContactState {
            is_paying: true,
            engagement: 10,
            excitement: 80,
            ..state()
        };
        assert_eq!(select_base_goal(&quiet_payer).goal_key, "drive_value");

        let low = ContactState { engagement: 10, excitement: 10, ..state() };
        assert_eq!(select_base_goal(&low).goal_key, "drive_engagement");

        let stranger = ContactState {
            is_paying: true,
            engagement: 35,
            last_conversation_at: None,
            ..state()
        };
        assert_eq!(select_base_goal(&stranger).goal_key, "initial_contact");

        let moderate = ContactState { is_paying: true, engagement: 40, ..state() };
        assert_eq!(select_base_goal(&moderate).goal_key, "learn_interests");

        let strong = ContactState { is_paying: true, engagement: 80, ..state() };
        assert_eq!(select_base_goal(&strong).goal_key, "deepen_relationship");
    }

    #[test]
    fn test_base_table_always_records_reasoning() {
        for engagement in [0u8, 29, 30, 49, 50, 100] {
            for excitement in [0u8, 29, 50, 100] {
                for is_paying in [false, true] {
                    let s = ContactState {
                        engagement,
                        excitement,
                        is_paying,
                        ..state()
                    };
                    let selection = select_base_goal(&s);
                    assert!(!selection.reasoning.is_empty());
                    assert_eq!(selection.method, DecisionMethod::RuleMatch);
                    assert!(BASE_GOAL_KEYS.contains(&selection.goal_key.as_str()));
                }
            }
        }
    }

    #[test]
    fn test_base_keys_match_rules() {
        let rule_keys: Vec<&str> = BASE_RULES.iter().map(|r| r.goal_key).collect();
        assert_eq!(rule_keys, BASE_GOAL_KEYS.to_vec());
    }

    #[test]
    fn test_first_match_combinator() {
        let items = [1, 4, 6, 8];
        assert_eq!(first_match(&items, |n| n % 2 == 0), Some(&4));
        assert_eq!(first_match(&items, |n| *n > 10), None);
    }

    // =====================================================================
    // Guard
    // =====================================================================

    #[tokio::test]
    async fn test_opted_out_is_error_not_selection() {
        let s = ContactState { opted_out: true, ..state() };
        for mode in [false, true] {
            let result = selector(mode).select_goal(&s, Timestamp::now()).await;
            assert!(matches!(result, Err(PlannerError::OptedOut(_))));
        }
    }

    // =====================================================================
    // Registry mode
    // =====================================================================

    #[tokio::test]
    async fn test_registry_mode_matches_base_table_by_default() {
        let s = ContactState { engagement: 10, excitement: 10, ..state() };
        let selection = selector(true).select_goal(&s, Timestamp::now()).await.unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
        assert_eq!(selection.method, DecisionMethod::RuleMatch);
        assert_eq!(selection.score, 40.0);
    }

    #[tokio::test]
    async fn test_registry_goal_outranks_base_pick() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        s.insights.insert("event_interest".to_string(), "yes".to_string());
        let selection = selector(true).select_goal(&s, Timestamp::now()).await.unwrap();
        assert_eq!(selection.goal_key, "event_invite");
        assert_eq!(selection.method, DecisionMethod::RuleMatch);

        // Not in registry mode: the table alone decides.
        let selection = selector(false).select_goal(&s, Timestamp::now()).await.unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
    }

    #[tokio::test]
    async fn test_history_moves_to_next_matching_rule() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        s.closed_goals.insert("drive_engagement".to_string());
        let selection = selector(true).select_goal(&s, Timestamp::now()).await.unwrap();
        assert_eq!(selection.goal_key, "learn_interests");
    }

    #[tokio::test]
    async fn test_nothing_eligible_falls_back_to_base_table() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        for key in BASE_GOAL_KEYS {
            s.closed_goals.insert(key.to_string());
        }
        let selection = selector(true).select_goal(&s, Timestamp::now()).await.unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
        assert_eq!(selection.method, DecisionMethod::RuleMatch);
        assert!(selection.reasoning.starts_with("no eligible registry goal"));
    }

    #[tokio::test]
    async fn test_tie_without_arbiter_prefers_base_pick() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        s.insights.insert("event_interest".to_string(), "yes".to_string());
        let registry = registry_with_priority("event_invite", 40);
        let selection = GoalSelector::new(registry, DoNotContactGuard::new(90), true)
            .select_goal(&s, Timestamp::now())
            .await
            .unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
        assert_eq!(selection.method, DecisionMethod::Heuristic);
    }

    struct FixedArbiter {
        pick: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GoalArbiter for FixedArbiter {
        async fn choose(
            &self,
            _state: &ContactState,
            candidates: &[&Goal],
        ) -> Result<ArbiterChoice, PlannerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(candidates.len() > 1);
            Ok(ArbiterChoice {
                goal_key: self.pick.to_string(),
                reasoning: "likes events".to_string(),
            })
        }
    }

    struct FailingArbiter;

    #[async_trait]
    impl GoalArbiter for FailingArbiter {
        async fn choose(
            &self,
            _state: &ContactState,
            _candidates: &[&Goal],
        ) -> Result<ArbiterChoice, PlannerError> {
            Err(PlannerError::Arbiter("model offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_tie_goes_to_arbiter() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        s.insights.insert("event_interest".to_string(), "yes".to_string());
        let arbiter = Arc::new(FixedArbiter {
            pick: "event_invite",
            calls: AtomicUsize::new(0),
        });
        let selection = GoalSelector::new(
            registry_with_priority("event_invite", 40),
            DoNotContactGuard::new(90),
            true,
        )
        .with_arbiter(arbiter.clone())
        .select_goal(&s, Timestamp::now())
        .await
        .unwrap();
        assert_eq!(selection.goal_key, "event_invite");
        assert_eq!(selection.method, DecisionMethod::Llm);
        assert_eq!(selection.reasoning, "likes events");
        assert_eq!(arbiter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_arbiter_not_consulted_without_tie() {
        let s = ContactState { engagement: 10, excitement: 10, ..state() };
        let arbiter = Arc::new(FixedArbiter {
            pick: "event_invite",
            calls: AtomicUsize::new(0),
        });
        let selection = selector(true)
            .with_arbiter(arbiter.clone())
            .select_goal(&s, Timestamp::now())
            .await
            .unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
        assert_eq!(arbiter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_arbiter_failure_is_heuristic() {
        let mut s = ContactState { engagement: 10, excitement: 10, ..state() };
        s.insights.insert("event_interest".to_string(), "yes".to_string());
        let selection = GoalSelector::new(
            registry_with_priority("event_invite", 40),
            DoNotContactGuard::new(90),
            true,
        )
        .with_arbiter(Arc::new(FailingArbiter))
        .select_goal(&s, Timestamp::now())
        .await
        .unwrap();
        assert_eq!(selection.goal_key, "drive_engagement");
        assert_eq!(selection.method, DecisionMethod::Heuristic);
    }
}
