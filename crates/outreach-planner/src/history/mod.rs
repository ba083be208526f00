//! Attempt history: pure transition functions and the service that persists
//! them with compare-and-set writes.

pub mod state_machine;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use outreach_core::attempt::{AttemptHistory, AttemptStatus};
use outreach_core::error::OutreachError;
use outreach_core::goal::{DecisionMethod, Goal, InsightSpec, OutcomeAction, OutcomeKind};
use outreach_core::types::{Insight, InsightSource, Timestamp};
use outreach_storage::{AttemptRepository, ContactRepository, Database, InsightRepository};

use crate::classifier::Classification;
use crate::error::TransitionError;
use crate::registry::GoalRegistry;
use crate::resolver::{resolve, Resolution, ResolutionInput};
use state_machine::validate_transition;

/// Outcome name recorded when a pair runs out of attempts.
pub const ATTEMPTS_EXHAUSTED: &str = "attempts_exhausted";
/// Outcome name recorded when a pending row is closed for an opted-out
/// contact.
pub const OPTED_OUT: &str = "opted_out";
/// Outcome name recorded when a refusal arrives outside any conversation and
/// closes the contact's queued attempts.
pub const REFUSED: &str = "refused";

// =============================================================================
// Pure transitions
// =============================================================================

/// Side effects an applied outcome asks for beyond the attempt row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Effects {
    pub insight: Option<InsightSpec>,
    pub next_goal: Option<String>,
    pub refusal: bool,
    pub opt_out: bool,
    pub response_text: Option<String>,
}

/// An attempt after an outcome was applied, plus what else must happen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied {
    pub attempt: AttemptHistory,
    pub resolution: Resolution,
    pub effects: Effects,
}

fn advance(
    attempt: &mut AttemptHistory,
    to: AttemptStatus,
    now: Timestamp,
) -> Result<(), TransitionError> {
    validate_transition(attempt.status, to)?;
    attempt.status = to;
    attempt.updated_at = now;
    Ok(())
}

/// `sent -> responded`, recording what the contact said.
pub fn record_reply(
    attempt: &AttemptHistory,
    classification: &Classification,
    text: &str,
    now: Timestamp,
) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    advance(&mut next, AttemptStatus::Responded, now)?;
    next.response_text = Some(text.to_string());
    next.response_sentiment = Some(classification.sentiment);
    next.response_intent = Some(classification.intent);
    Ok(next)
}

/// Days to wait before a deferred attempt is retried: the outcome's own
/// value, else what the reply asked for, else the goal's interval.
pub fn defer_days(
    goal: &Goal,
    action: &OutcomeAction,
    classification: Option<&Classification>,
) -> u32 {
    action
        .defer_days
        .or_else(|| classification.and_then(|c| c.defer_days))
        .unwrap_or(goal.days_between_attempts)
}

/// Apply a resolved outcome to a `sent` (timeout) or `responded` attempt.
///
/// A `clarify` outcome on a timeout has nobody to clarify with, so it is
/// applied as a deferral on the goal's interval.
pub fn apply_resolution(
    attempt: &AttemptHistory,
    goal: &Goal,
    resolution: &Resolution,
    classification: Option<&Classification>,
    now: Timestamp,
) -> Result<Applied, TransitionError> {
    let kind = match (resolution.action.kind, attempt.status) {
        (OutcomeKind::Clarify, AttemptStatus::Sent) => OutcomeKind::Defer,
        (kind, _) => kind,
    };
    let target = match kind {
        OutcomeKind::Success => AttemptStatus::Success,
        OutcomeKind::Decline => AttemptStatus::Declined,
        OutcomeKind::Defer => AttemptStatus::Deferred,
        OutcomeKind::Clarify => AttemptStatus::Pending,
        OutcomeKind::Escalate => AttemptStatus::Escalated,
    };

    let mut next = attempt.clone();
    advance(&mut next, target, now)?;
    next.outcome_name = Some(resolution.outcome_name.clone());
    next.next_attempt_at = match target {
        AttemptStatus::Deferred => Some(now.plus_days(defer_days(
            goal,
            &resolution.action,
            classification,
        ))),
        _ => None,
    };
    next.clarify_pending = target == AttemptStatus::Pending;

    let effects = Effects {
        insight: resolution.action.insight.clone(),
        next_goal: resolution.action.next_goal.clone(),
        refusal: classification.is_some_and(Classification::is_refusal),
        opt_out: classification.is_some_and(|c| c.opt_out),
        response_text: resolution.action.response_text.clone(),
    };

    Ok(Applied {
        attempt: next,
        resolution: resolution.clone(),
        effects,
    })
}

/// Put a clarified attempt straight back to `sent`: the clarifying question
/// went out with the reply, so the pair waits for the answer without spending
/// another attempt.
pub fn resume_clarified(
    attempt: &AttemptHistory,
    now: Timestamp,
) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    advance(&mut next, AttemptStatus::Sent, now)?;
    next.clarify_pending = false;
    next.last_attempt_at = Some(now);
    next.claim_token = None;
    next.claimed_at = None;
    Ok(next)
}

/// `deferred -> pending` while attempts remain, otherwise `-> declined`.
pub fn release_deferred(
    attempt: &AttemptHistory,
    goal: &Goal,
    now: Timestamp,
) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    if attempt.attempt_count < goal.max_attempts {
        advance(&mut next, AttemptStatus::Pending, now)?;
        next.next_attempt_at = None;
    } else {
        advance(&mut next, AttemptStatus::Declined, now)?;
        next.outcome_name = Some(ATTEMPTS_EXHAUSTED.to_string());
    }
    Ok(next)
}

/// Close a queued attempt without sending: `pending -> declined` or
/// `deferred -> declined`.
pub fn close_pending(
    attempt: &AttemptHistory,
    reason: &str,
    now: Timestamp,
) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    advance(&mut next, AttemptStatus::Declined, now)?;
    next.outcome_name = Some(reason.to_string());
    next.next_attempt_at = None;
    next.clarify_pending = false;
    next.claim_token = None;
    next.claimed_at = None;
    Ok(next)
}

/// Manual resolution of an escalated attempt.
pub fn resolve_escalation(
    attempt: &AttemptHistory,
    succeeded: bool,
    note: &str,
    now: Timestamp,
) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    let to = if succeeded {
        AttemptStatus::Success
    } else {
        AttemptStatus::Declined
    };
    advance(&mut next, to, now)?;
    next.outcome_name = Some(note.to_string());
    Ok(next)
}

// =============================================================================
// Persistence
// =============================================================================

/// The result of handling a reply or a timeout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Handled {
    pub applied: Applied,
    /// Follow-on attempt created for the outcome's `next_goal`.
    pub enqueued: Option<AttemptHistory>,
}

/// Advances attempts in storage and applies outcome side effects.
pub struct HistoryService {
    attempts: AttemptRepository,
    contacts: ContactRepository,
    insights: InsightRepository,
    registry: Arc<GoalRegistry>,
}

impl HistoryService {
    pub fn new(db: Arc<Database>, registry: Arc<GoalRegistry>) -> Self {
        Self {
            attempts: AttemptRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            insights: InsightRepository::new(db),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<GoalRegistry> {
        &self.registry
    }

    fn load(&self, attempt_id: Uuid) -> Result<AttemptHistory, TransitionError> {
        self.attempts
            .get(attempt_id)?
            .ok_or(TransitionError::NotFound(attempt_id))
    }

    fn goal(&self, key: &str) -> Result<&Goal, TransitionError> {
        self.registry
            .get(key)
            .ok_or_else(|| TransitionError::UnknownGoal(key.to_string()))
    }

    fn commit(&self, attempt: &AttemptHistory, expected: AttemptStatus) -> Result<(), TransitionError> {
        if self.attempts.compare_and_set(attempt, expected)? {
            debug!(
                attempt_id = %attempt.id,
                from = %expected,
                to = %attempt.status,
                "Attempt advanced"
            );
            Ok(())
        } else {
            Err(TransitionError::Conflict(attempt.id))
        }
    }

    /// Create a pending attempt. Returns `None` when the pair already has
    /// one open.
    pub fn enqueue(
        &self,
        contact_id: Uuid,
        goal_key: &str,
        reasoning: &str,
        score: f32,
        method: DecisionMethod,
        now: Timestamp,
    ) -> Result<Option<AttemptHistory>, TransitionError> {
        self.goal(goal_key)?;
        let attempt = AttemptHistory::pending(contact_id, goal_key, reasoning, score, method, now);
        match self.attempts.insert_open(&attempt) {
            Ok(()) => {
                info!(contact_id = %contact_id, goal = %goal_key, "Attempt enqueued");
                Ok(Some(attempt))
            }
            Err(OutreachError::Conflict(_)) => {
                debug!(contact_id = %contact_id, goal = %goal_key, "Attempt already open; skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a reply to a `sent` attempt and apply the outcome it resolves
    /// to, as one conditional write.
    ///
    /// Opt-out and refusal land on the contact before the attempt row moves,
    /// so a failed attempt write leaves the row `sent` and the reply can be
    /// replayed without losing them.
    pub fn handle_reply(
        &self,
        attempt_id: Uuid,
        classification: &Classification,
        text: &str,
        now: Timestamp,
    ) -> Result<Handled, TransitionError> {
        let attempt = self.load(attempt_id)?;
        let goal = self.goal(&attempt.goal_key)?;

        let responded = record_reply(&attempt, classification, text, now)?;
        let resolution = resolve(
            goal,
            &ResolutionInput::Reply {
                classification,
                text,
            },
        );
        let mut applied = apply_resolution(&responded, goal, &resolution, Some(classification), now)?;
        if applied.attempt.clarify_pending && applied.effects.response_text.is_some() {
            applied.attempt = resume_clarified(&applied.attempt, now)?;
        }

        self.apply_contact_effects(&applied, now)?;
        self.contacts.record_conversation(attempt.contact_id, now)?;
        self.commit(&applied.attempt, AttemptStatus::Sent)?;

        info!(
            attempt_id = %attempt.id,
            goal = %goal.key,
            outcome = %resolution.outcome_name,
            status = %applied.attempt.status,
            "Reply resolved"
        );
        let enqueued = self.apply_outcome_effects(&applied, now)?;
        Ok(Handled { applied, enqueued })
    }

    /// Resolve a `sent` attempt whose reply window elapsed.
    pub fn handle_timeout(
        &self,
        attempt: &AttemptHistory,
        now: Timestamp,
    ) -> Result<Handled, TransitionError> {
        let goal = self.goal(&attempt.goal_key)?;
        let resolution = resolve(goal, &ResolutionInput::Timeout);
        let applied = apply_resolution(attempt, goal, &resolution, None, now)?;
        self.apply_contact_effects(&applied, now)?;
        self.commit(&applied.attempt, AttemptStatus::Sent)?;

        debug!(
            attempt_id = %attempt.id,
            outcome = %resolution.outcome_name,
            status = %applied.attempt.status,
            "Timeout resolved"
        );
        let enqueued = self.apply_outcome_effects(&applied, now)?;
        Ok(Handled { applied, enqueued })
    }

    /// Move a due `deferred` attempt back to `pending`, or decline it when
    /// its attempts are used up.
    pub fn release_deferred(
        &self,
        attempt: &AttemptHistory,
        now: Timestamp,
    ) -> Result<AttemptHistory, TransitionError> {
        let goal = self.goal(&attempt.goal_key)?;
        let next = release_deferred(attempt, goal, now)?;
        self.commit(&next, AttemptStatus::Deferred)?;
        Ok(next)
    }

    /// Decline a pending attempt without sending it.
    pub fn close_pending(
        &self,
        attempt: &AttemptHistory,
        reason: &str,
        now: Timestamp,
    ) -> Result<AttemptHistory, TransitionError> {
        let next = close_pending(attempt, reason, now)?;
        self.commit(&next, AttemptStatus::Pending)?;
        Ok(next)
    }

    /// Decline every queued (`pending` or `deferred`) attempt of a contact.
    /// Rows that move concurrently are left to whoever moved them.
    pub fn decline_open(
        &self,
        contact_id: Uuid,
        reason: &str,
        now: Timestamp,
    ) -> Result<Vec<AttemptHistory>, TransitionError> {
        let mut closed = Vec::new();
        for attempt in self.attempts.list_for_contact(contact_id)? {
            if !matches!(attempt.status, AttemptStatus::Pending | AttemptStatus::Deferred) {
                continue;
            }
            let next = close_pending(&attempt, reason, now)?;
            match self.commit(&next, attempt.status) {
                Ok(()) => closed.push(next),
                Err(TransitionError::Conflict(_)) => {
                    debug!(attempt_id = %attempt.id, "Queued attempt moved before it could be closed")
                }
                Err(e) => return Err(e),
            }
        }
        if !closed.is_empty() {
            info!(contact_id = %contact_id, closed = closed.len(), reason = %reason, "Queued attempts declined");
        }
        Ok(closed)
    }

    /// Close an escalated attempt after a human handled it.
    pub fn resolve_escalation(
        &self,
        attempt_id: Uuid,
        succeeded: bool,
        note: &str,
        now: Timestamp,
    ) -> Result<AttemptHistory, TransitionError> {
        let attempt = self.load(attempt_id)?;
        let next = resolve_escalation(&attempt, succeeded, note, now)?;
        self.commit(&next, AttemptStatus::Escalated)?;
        info!(attempt_id = %attempt_id, status = %next.status, "Escalation resolved");
        Ok(next)
    }

    /// Contact-level effects of a reply. Idempotent, so they are safe to
    /// write before the attempt row is committed.
    fn apply_contact_effects(&self, applied: &Applied, now: Timestamp) -> Result<(), TransitionError> {
        let contact_id = applied.attempt.contact_id;
        if applied.effects.opt_out {
            self.contacts.set_opted_out(contact_id, true)?;
            warn!(contact_id = %contact_id, "Contact opted out");
        }
        if applied.effects.refusal {
            self.contacts.record_refusal(contact_id, now)?;
        }
        Ok(())
    }

    /// Effects that only make sense once the attempt row has moved: the
    /// outcome's insight and its follow-on goal.
    fn apply_outcome_effects(
        &self,
        applied: &Applied,
        now: Timestamp,
    ) -> Result<Option<AttemptHistory>, TransitionError> {
        let attempt = &applied.attempt;
        let effects = &applied.effects;

        if let Some(spec) = &effects.insight {
            let mut insight = Insight::new(
                attempt.contact_id,
                &spec.attribute,
                &spec.value,
                spec.confidence,
                InsightSource::Outcome,
            );
            insight.created_at = now;
            self.insights.record(&insight)?;
        }

        if attempt.status == AttemptStatus::Escalated {
            info!(
                attempt_id = %attempt.id,
                goal = %attempt.goal_key,
                "Attempt escalated; automation halted for this pair"
            );
        }

        let Some(next_goal) = &effects.next_goal else {
            return Ok(None);
        };
        if effects.opt_out || effects.refusal {
            debug!(goal = %next_goal, "Skipping follow-on goal after refusal");
            return Ok(None);
        }
        let reasoning = format!(
            "follow-on from {}:{}",
            attempt.goal_key, applied.resolution.outcome_name
        );
        let score = self.goal(next_goal)?.priority as f32;
        match self.enqueue(
            attempt.contact_id,
            next_goal,
            &reasoning,
            score,
            DecisionMethod::RuleMatch,
            now,
        ) {
            Ok(enqueued) => Ok(enqueued),
            Err(e) => {
                error!(goal = %next_goal, error = %e, "Failed to enqueue follow-on goal");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use outreach_core::goal::{Intent, Sentiment, Trigger};
    use outreach_core::types::{Contact, Identity};

    use crate::classifier::PatternClassifier;

    fn registry() -> Arc<GoalRegistry> {
        Arc::new(GoalRegistry::builtin().unwrap())
    }

    fn sent_attempt(goal: &str, now: Timestamp) -> AttemptHistory {
        let mut a =
            AttemptHistory::pending(Uuid::new_v4(), goal, "r", 1.0, DecisionMethod::RuleMatch, now);
        a.status = AttemptStatus::Sent;
        a.attempt_count = 1;
        a.last_attempt_at = Some(now);
        a
    }

    // =====================================================================
    // Pure transitions
    // =====================================================================

    #[test]
    fn test_defer_days_precedence() {
        let registry = registry();
        let goal = registry.get("membership_pitch").unwrap();
        let mut action = OutcomeAction::of(OutcomeKind::Defer);
        let mut c = PatternClassifier::new().classify_text("next week");

        assert_eq!(defer_days(goal, &action, None), goal.days_between_attempts);
        assert_eq!(defer_days(goal, &action, Some(&c)), 7);
        action.defer_days = Some(21);
        assert_eq!(defer_days(goal, &action, Some(&c)), 21);
        c.defer_days = None;
        action.defer_days = None;
        assert_eq!(defer_days(goal, &action, Some(&c)), 10);
    }

    #[test]
    fn test_timeout_defers_on_goal_interval() {
        let registry = registry();
        let goal = registry.get("link_account").unwrap();
        let now = Timestamp(1_700_000_000);
        let attempt = sent_attempt("link_account", now);

        let resolution = resolve(goal, &ResolutionInput::Timeout);
        let applied = apply_resolution(&attempt, goal, &resolution, None, now).unwrap();
        assert_eq!(applied.attempt.status, AttemptStatus::Deferred);
        assert_eq!(applied.attempt.outcome_name.as_deref(), Some("no_reply"));
        assert_eq!(applied.attempt.next_attempt_at, Some(now.plus_days(7)));
        assert_eq!(applied.attempt.attempt_count, 1);
    }

    #[test]
    fn test_clarify_on_timeout_becomes_defer() {
        let registry = registry();
        let goal = registry.get("link_account").unwrap();
        let now = Timestamp(1_700_000_000);
        let attempt = sent_attempt("link_account", now);
        let resolution = Resolution {
            outcome_name: "fallback".to_string(),
            trigger: Trigger::Default,
            action: OutcomeAction::of(OutcomeKind::Clarify),
        };
        let applied = apply_resolution(&attempt, goal, &resolution, None, now).unwrap();
        assert_eq!(applied.attempt.status, AttemptStatus::Deferred);
    }

    #[test]
    fn test_clarify_after_reply_returns_to_pending() {
        let registry = registry();
        let goal = registry.get("link_account").unwrap();
        let now = Timestamp(1_700_000_000);
        let c = PatternClassifier::new().classify_text("hmm I see");
        let responded = record_reply(&sent_attempt("link_account", now), &c, "hmm I see", now).unwrap();

        let resolution = resolve(goal, &ResolutionInput::Reply { classification: &c, text: "hmm I see" });
        assert_eq!(resolution.action.kind, OutcomeKind::Clarify);
        let applied = apply_resolution(&responded, goal, &resolution, Some(&c), now).unwrap();
        assert_eq!(applied.attempt.status, AttemptStatus::Pending);
        assert!(applied.attempt.clarify_pending);
        assert_eq!(applied.attempt.attempt_count, 1);
        assert_eq!(applied.attempt.response_intent, Some(Intent::Interested));

        let resumed = resume_clarified(&applied.attempt, now.plus_days(1)).unwrap();
        assert_eq!(resumed.status, AttemptStatus::Sent);
        assert!(!resumed.clarify_pending);
        assert_eq!(resumed.attempt_count, 1);
        assert_eq!(resumed.last_attempt_at, Some(now.plus_days(1)));
    }

    #[test]
    fn test_close_pending_accepts_deferred() {
        let now = Timestamp(1_700_000_000);
        let mut attempt = sent_attempt("link_account", now);
        attempt.status = AttemptStatus::Deferred;
        attempt.next_attempt_at = Some(now.plus_days(7));

        let closed = close_pending(&attempt, REFUSED, now).unwrap();
        assert_eq!(closed.status, AttemptStatus::Declined);
        assert_eq!(closed.outcome_name.as_deref(), Some(REFUSED));
        assert_eq!(closed.next_attempt_at, None);

        attempt.status = AttemptStatus::Sent;
        assert!(close_pending(&attempt, REFUSED, now).is_err());
    }

    #[test]
    fn test_hard_refusal_effects() {
        let registry = registry();
        let goal = registry.get("drive_value").unwrap();
        let now = Timestamp(1_700_000_000);
        let c = PatternClassifier::new().classify_text("unsubscribe");
        let responded = record_reply(&sent_attempt("drive_value", now), &c, "unsubscribe", now).unwrap();
        let resolution = resolve(goal, &ResolutionInput::Reply { classification: &c, text: "unsubscribe" });
        let applied = apply_resolution(&responded, goal, &resolution, Some(&c), now).unwrap();

        assert_eq!(applied.attempt.status, AttemptStatus::Declined);
        assert_eq!(applied.attempt.response_sentiment, Some(Sentiment::Refusal));
        assert!(applied.effects.refusal);
        assert!(applied.effects.opt_out);
    }

    #[test]
    fn test_release_deferred_respects_max_attempts() {
        let registry = registry();
        let goal = registry.get("link_account").unwrap();
        let now = Timestamp(1_700_000_000);
        let mut attempt = sent_attempt("link_account", now);
        attempt.status = AttemptStatus::Deferred;

        let next = release_deferred(&attempt, goal, now).unwrap();
        assert_eq!(next.status, AttemptStatus::Pending);

        attempt.attempt_count = goal.max_attempts;
        let next = release_deferred(&attempt, goal, now).unwrap();
        assert_eq!(next.status, AttemptStatus::Declined);
        assert_eq!(next.outcome_name.as_deref(), Some(ATTEMPTS_EXHAUSTED));
    }

    #[test]
    fn test_terminal_attempt_cannot_take_a_reply() {
        let now = Timestamp(1_700_000_000);
        let mut attempt = sent_attempt("link_account", now);
        attempt.status = AttemptStatus::Success;
        let c = PatternClassifier::new().classify_text("yes");
        assert!(matches!(
            record_reply(&attempt, &c, "yes", now),
            Err(TransitionError::InvalidTransition(AttemptStatus::Success, AttemptStatus::Responded))
        ));
    }

    // =====================================================================
    // Service
    // =====================================================================

    struct Fixture {
        db: Arc<Database>,
        service: HistoryService,
        contact: Contact,
    }

    fn fixture() -> Fixture {
        fixture_with(registry())
    }

    fn fixture_with(registry: Arc<GoalRegistry>) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let contact = Contact::new(Identity::ChatOnly {
            chat_user_id: "u1".to_string(),
        });
        ContactRepository::new(db.clone()).insert(&contact).unwrap();
        Fixture {
            service: HistoryService::new(db.clone(), registry),
            db,
            contact,
        }
    }

    fn sent_in_storage(f: &Fixture, goal: &str, now: Timestamp) -> AttemptHistory {
        let attempt = f
            .service
            .enqueue(f.contact.id, goal, "r", 1.0, DecisionMethod::RuleMatch, now)
            .unwrap()
            .unwrap();
        let repo = AttemptRepository::new(f.db.clone());
        let token = Uuid::new_v4();
        assert!(repo.claim(attempt.id, token, now).unwrap());
        assert!(repo.mark_sent(attempt.id, token, "msg-1", now).unwrap());
        repo.require(attempt.id).unwrap()
    }

    #[test]
    fn test_enqueue_skips_when_open() {
        let f = fixture();
        let now = Timestamp::now();
        assert!(f
            .service
            .enqueue(f.contact.id, "link_account", "r", 1.0, DecisionMethod::RuleMatch, now)
            .unwrap()
            .is_some());
        assert!(f
            .service
            .enqueue(f.contact.id, "link_account", "r", 1.0, DecisionMethod::RuleMatch, now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_enqueue_unknown_goal() {
        let f = fixture();
        let err = f
            .service
            .enqueue(f.contact.id, "nope", "r", 1.0, DecisionMethod::RuleMatch, Timestamp::now())
            .unwrap_err();
        assert!(matches!(err, TransitionError::UnknownGoal(_)));
    }

    #[test]
    fn test_reply_records_insight_and_enqueues_next_goal() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "drive_engagement", now);
        let c = PatternClassifier::new().classify_text("yes, sounds fun");

        let handled = f.service.handle_reply(attempt.id, &c, "yes, sounds fun", now).unwrap();
        assert_eq!(handled.applied.attempt.status, AttemptStatus::Success);
        assert_eq!(handled.applied.resolution.outcome_name, "interested");
        let enqueued = handled.enqueued.unwrap();
        assert_eq!(enqueued.goal_key, "learn_interests");
        assert_eq!(enqueued.planner_reasoning, "follow-on from drive_engagement:interested");

        let insights = InsightRepository::new(f.db.clone())
            .current_for_contact(f.contact.id)
            .unwrap();
        assert!(insights.iter().any(|i| i.attribute == "expressed_interest"
            && i.source == InsightSource::Outcome));

        let contact = ContactRepository::new(f.db.clone()).require(f.contact.id).unwrap();
        assert_eq!(contact.last_conversation_at, Some(now));
    }

    #[test]
    fn test_hard_refusal_opts_out_and_skips_follow_on() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "drive_engagement", now);
        let c = PatternClassifier::new().classify_text("stop messaging me");

        let handled = f.service.handle_reply(attempt.id, &c, "stop messaging me", now).unwrap();
        assert_eq!(handled.applied.attempt.status, AttemptStatus::Declined);
        assert!(handled.enqueued.is_none());

        let contact = ContactRepository::new(f.db.clone()).require(f.contact.id).unwrap();
        assert!(contact.opted_out);
        assert_eq!(contact.last_refusal_at, Some(now));
    }

    #[test]
    fn test_opt_out_survives_failed_insight_write() {
        let mut goals = registry().goals().to_vec();
        let goal = goals.iter_mut().find(|g| g.key == "drive_engagement").unwrap();
        let refused = goal.outcomes.iter_mut().find(|o| o.name == "refused").unwrap();
        refused.action.insight = Some(InsightSpec {
            attribute: "engagement_refusal".to_string(),
            value: "hard".to_string(),
            confidence: 0.9,
        });
        let f = fixture_with(Arc::new(GoalRegistry::new(goals).unwrap()));
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "drive_engagement", now);

        f.db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE insights")
                    .map_err(|e| OutreachError::Storage(e.to_string()))
            })
            .unwrap();

        let c = PatternClassifier::new().classify_text("stop messaging me");
        assert!(f.service.handle_reply(attempt.id, &c, "stop messaging me", now).is_err());

        let contact = ContactRepository::new(f.db.clone()).require(f.contact.id).unwrap();
        assert!(contact.opted_out);
        assert_eq!(contact.last_refusal_at, Some(now));
    }

    #[test]
    fn test_clarify_reply_keeps_attempt_budget() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "link_account", now);
        let c = PatternClassifier::new().classify_text("hmm I see");

        for round in 1..=3u32 {
            let at = Timestamp(now.0 + round as i64 * 3600);
            let handled = f.service.handle_reply(attempt.id, &c, "hmm I see", at).unwrap();
            assert_eq!(handled.applied.resolution.action.kind, OutcomeKind::Clarify);
            assert!(handled.applied.effects.response_text.is_some());

            let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
            assert_eq!(stored.status, AttemptStatus::Sent);
            assert_eq!(stored.attempt_count, 1);
            assert!(!stored.clarify_pending);
            assert_eq!(stored.last_attempt_at, Some(at));
        }
    }

    #[test]
    fn test_decline_open_closes_queued_attempts_only() {
        let f = fixture();
        let now = Timestamp::now();
        let sent = sent_in_storage(&f, "initial_contact", now);
        let pending = f
            .service
            .enqueue(f.contact.id, "link_account", "r", 1.0, DecisionMethod::RuleMatch, now)
            .unwrap()
            .unwrap();
        let deferred = sent_in_storage(&f, "membership_pitch", now);
        f.service.handle_timeout(&deferred, now.plus_days(10)).unwrap();

        let closed = f.service.decline_open(f.contact.id, REFUSED, now).unwrap();
        assert_eq!(closed.len(), 2);

        let repo = AttemptRepository::new(f.db.clone());
        for id in [pending.id, deferred.id] {
            let stored = repo.require(id).unwrap();
            assert_eq!(stored.status, AttemptStatus::Declined);
            assert_eq!(stored.outcome_name.as_deref(), Some(REFUSED));
        }
        assert_eq!(repo.require(sent.id).unwrap().status, AttemptStatus::Sent);
    }

    #[test]
    fn test_second_reply_conflicts() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "initial_contact", now);
        let c = PatternClassifier::new().classify_text("hello!");

        f.service.handle_reply(attempt.id, &c, "hello!", now).unwrap();
        let err = f.service.handle_reply(attempt.id, &c, "hello!", now).unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition(_, _)));
    }

    #[test]
    fn test_timeout_then_release_then_exhaust() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "link_account", now);

        let later = now.plus_days(8);
        let handled = f.service.handle_timeout(&attempt, later).unwrap();
        let deferred = handled.applied.attempt;
        assert_eq!(deferred.status, AttemptStatus::Deferred);

        let released = f.service.release_deferred(&deferred, later.plus_days(7)).unwrap();
        assert_eq!(released.status, AttemptStatus::Pending);

        // A stale copy of the deferred row can no longer be released.
        let err = f.service.release_deferred(&deferred, later.plus_days(7)).unwrap_err();
        assert!(matches!(err, TransitionError::Conflict(_)));
    }

    #[test]
    fn test_escalation_resolution() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent_in_storage(&f, "initial_contact", now);
        let c = PatternClassifier::new().classify_text("who runs this?");

        let handled = f.service.handle_reply(attempt.id, &c, "who runs this?", now).unwrap();
        assert_eq!(handled.applied.attempt.status, AttemptStatus::Escalated);

        // Escalated keeps the slot.
        assert!(f
            .service
            .enqueue(f.contact.id, "initial_contact", "r", 1.0, DecisionMethod::RuleMatch, now)
            .unwrap()
            .is_none());

        let resolved = f
            .service
            .resolve_escalation(attempt.id, true, "answered by staff", now)
            .unwrap();
        assert_eq!(resolved.status, AttemptStatus::Success);
        assert_eq!(resolved.outcome_name.as_deref(), Some("answered by staff"));
    }
}
