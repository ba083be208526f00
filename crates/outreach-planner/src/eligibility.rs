//! Goal eligibility predicates.

use std::collections::BTreeMap;

use outreach_core::goal::Goal;

use crate::registry::GoalRegistry;
use crate::state::ContactState;

const ANY_VALUE: &str = "*";

/// Why a goal was filtered out for a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    Disabled,
    NeedsLinkedAccount,
    CompanyType,
    BelowMinimumEngagement(u8),
    Persona,
    ExcludedInsight(String),
    MissingInsight(String),
    AlreadyPursued,
}

/// Check one goal against a contact. Excluded insights are checked before
/// required ones and always win.
pub fn check_eligibility(goal: &Goal, state: &ContactState) -> Result<(), Ineligible> {
    let rules = &goal.eligibility;

    if !goal.enabled {
        return Err(Ineligible::Disabled);
    }
    if rules.requires_linked_account && !state.has_linked_account {
        return Err(Ineligible::NeedsLinkedAccount);
    }
    if !rules.requires_company_types.is_empty() {
        let matches = state.company_type.as_deref().is_some_and(|ct| {
            rules
                .requires_company_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(ct))
        });
        if !matches {
            return Err(Ineligible::CompanyType);
        }
    }
    if let Some(min) = rules.min_engagement {
        if state.engagement < min {
            return Err(Ineligible::BelowMinimumEngagement(min));
        }
    }
    if let Some(persona) = &rules.requires_persona {
        if !state
            .persona
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(persona))
        {
            return Err(Ineligible::Persona);
        }
    }
    if let Some(attr) = first_matching(&rules.excludes_insights, &state.insights) {
        return Err(Ineligible::ExcludedInsight(attr.to_string()));
    }
    if let Some(attr) = rules
        .requires_insights
        .iter()
        .find(|(attr, want)| !insight_matches(&state.insights, attr, want))
        .map(|(attr, _)| attr)
    {
        return Err(Ineligible::MissingInsight(attr.clone()));
    }
    if state.has_history_for(&goal.key) {
        return Err(Ineligible::AlreadyPursued);
    }
    Ok(())
}

pub fn is_eligible(goal: &Goal, state: &ContactState) -> bool {
    check_eligibility(goal, state).is_ok()
}

/// All eligible goals in registry declaration order.
pub fn eligible_goals<'a>(registry: &'a GoalRegistry, state: &ContactState) -> Vec<&'a Goal> {
    registry
        .goals()
        .iter()
        .filter(|g| is_eligible(g, state))
        .collect()
}

fn insight_matches(insights: &BTreeMap<String, String>, attr: &str, want: &str) -> bool {
    insights
        .get(attr)
        .is_some_and(|have| want == ANY_VALUE || have.eq_ignore_ascii_case(want))
}

fn first_matching<'a>(
    rules: &'a BTreeMap<String, String>,
    insights: &BTreeMap<String, String>,
) -> Option<&'a str> {
    rules
        .iter()
        .find(|(attr, want)| insight_matches(insights, attr, want))
        .map(|(attr, _)| attr.as_str())
}
