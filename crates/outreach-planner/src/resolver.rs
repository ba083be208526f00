//! Outcome resolution: which of a goal's outcome rules a reply or timeout
//! fires.

use serde::Serialize;

use outreach_core::goal::{Goal, Outcome, OutcomeAction, OutcomeKind, Trigger};

use crate::classifier::Classification;

/// What happened since the goal's message went out.
#[derive(Debug, Clone, Copy)]
pub enum ResolutionInput<'a> {
    Reply {
        classification: &'a Classification,
        text: &'a str,
    },
    /// No reply within the goal's attempt interval.
    Timeout,
}

/// The outcome that applies, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub outcome_name: String,
    pub trigger: Trigger,
    pub action: OutcomeAction,
}

const UNRESOLVED: &str = "unresolved";

fn fires(trigger: &Trigger, input: &ResolutionInput<'_>) -> bool {
    match (trigger, input) {
        (Trigger::Timeout, ResolutionInput::Timeout) => true,
        (
            Trigger::Sentiment(s),
            ResolutionInput::Reply {
                classification, ..
            },
        ) => classification.sentiment == *s,
        (
            Trigger::Intent(i),
            ResolutionInput::Reply {
                classification, ..
            },
        ) => classification.intent == *i,
        (Trigger::Keyword(keyword), ResolutionInput::Reply { text, .. }) => {
            !keyword.is_empty() && text.to_lowercase().contains(&keyword.to_lowercase())
        }
        _ => false,
    }
}

/// Resolve `input` against `goal`'s outcomes.
///
/// Matching outcomes compete by priority; equal priorities go to the one
/// declared first. When nothing matches the `default` outcome applies. Total:
/// a goal without a default (which a validated registry never contains)
/// escalates.
pub fn resolve(goal: &Goal, input: &ResolutionInput<'_>) -> Resolution {
    let mut best: Option<&Outcome> = None;
    for outcome in goal.outcomes.iter().filter(|o| fires(&o.trigger, input)) {
        if best.map_or(true, |b| outcome.priority > b.priority) {
            best = Some(outcome);
        }
    }

    match best.or_else(|| goal.default_outcome()) {
        Some(outcome) => Resolution {
            outcome_name: outcome.name.clone(),
            trigger: outcome.trigger.clone(),
            action: outcome.action.clone(),
        },
        None => Resolution {
            outcome_name: UNRESOLVED.to_string(),
            trigger: Trigger::Default,
            action: OutcomeAction::of(OutcomeKind::Escalate),
        },
    }
}
