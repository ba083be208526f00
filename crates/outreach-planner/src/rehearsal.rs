//! Rehearsal sandbox.
//!
//! Runs select, send, classify, resolve and transition for one contact over
//! an in-memory attempt history. Nothing is read from or written to storage
//! and no transport is involved, so a scripted conversation can be replayed
//! against a catalog before it goes live.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use outreach_core::attempt::{AttemptHistory, AttemptStatus};
use outreach_core::goal::DecisionMethod;
use outreach_core::types::{Contact, Timestamp};

use crate::classifier::{Classification, LayeredClassifier};
use crate::dispatcher::render_template;
use crate::error::{PlannerError, RehearsalError, TransitionError};
use crate::history::{self, Applied, ATTEMPTS_EXHAUSTED};
use crate::registry::GoalRegistry;
use crate::resolver::{resolve, ResolutionInput};
use crate::selector::{GoalSelection, GoalSelector};
use crate::state::ContactState;

/// One scripted turn: what we sent, what came back, and where it left the
/// attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RehearsalStep {
    pub goal_key: String,
    pub attempt_number: u32,
    pub sent_at: Timestamp,
    pub message: String,
    /// `None` means the contact stayed silent until the timeout.
    pub reply: Option<String>,
    pub classification: Option<Classification>,
    pub outcome_name: String,
    pub status: AttemptStatus,
    pub response: Option<String>,
    pub next_attempt_at: Option<Timestamp>,
}

/// Why a rehearsal stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ScriptFinished,
    OptedOut,
    CoolingDown,
    Escalated,
    Exhausted,
    /// The selector picked a goal the contact was already pursued for.
    NothingToPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RehearsalReport {
    pub selections: Vec<GoalSelection>,
    pub steps: Vec<RehearsalStep>,
    pub attempts: Vec<AttemptHistory>,
    pub final_state: ContactState,
    pub stopped: StopReason,
}

/// Replays a scripted conversation.
pub struct Rehearsal {
    registry: Arc<GoalRegistry>,
    selector: Arc<GoalSelector>,
    classifier: Arc<LayeredClassifier>,
}

impl Rehearsal {
    pub fn new(selector: Arc<GoalSelector>, classifier: Arc<LayeredClassifier>) -> Self {
        Self {
            registry: selector.registry().clone(),
            selector,
            classifier,
        }
    }

    /// Play `replies` in order. Each entry answers the most recent message;
    /// `None` lets the reply window lapse.
    ///
    /// When an attempt closes the next goal comes from the outcome's
    /// `next_goal`, else from a fresh selection over the updated state.
    pub async fn rehearse(
        &self,
        contact: &Contact,
        mut state: ContactState,
        replies: &[Option<String>],
        start: Timestamp,
    ) -> Result<RehearsalReport, RehearsalError> {
        let mut clock = start;
        let mut selections = Vec::new();
        let mut steps = Vec::new();
        let mut attempts: Vec<AttemptHistory> = Vec::new();
        let mut script = replies.iter();

        let mut current = match self.plan(&state, clock, &mut selections).await? {
            Ok(attempt) => attempt,
            Err(stopped) => return Ok(report(selections, steps, attempts, state, stopped)),
        };
        state.open_goals.insert(current.goal_key.clone());

        let mut clarifying: Option<String> = None;
        let stopped = loop {
            let Some(reply) = script.next() else {
                break StopReason::ScriptFinished;
            };
            let goal = self
                .registry
                .get(&current.goal_key)
                .ok_or_else(|| PlannerError::UnknownGoal(current.goal_key.clone()))?;

            let (message, sent_at) = match clarifying.take() {
                // The clarifying question already went out with the last
                // response; this reply answers it.
                Some(question) if current.status == AttemptStatus::Sent => {
                    (question, current.last_attempt_at.unwrap_or(clock))
                }
                _ => {
                    if !current.clarify_pending && current.attempt_count >= goal.max_attempts {
                        current = history::close_pending(&current, ATTEMPTS_EXHAUSTED, clock)?;
                        close(&mut state, &current);
                        attempts.push(current.clone());
                        break StopReason::Exhausted;
                    }
                    let message =
                        render_template(goal.template_for_attempt(current.attempt_count), contact);
                    current = send(&current, clock)?;
                    (message, clock)
                }
            };

            // Reply or timeout.
            let (mut applied, classification) = match reply {
                Some(text) => {
                    let classification = self.classifier.classify_reply(text).await;
                    let responded = history::record_reply(&current, &classification, text, clock)?;
                    let resolution = resolve(
                        goal,
                        &ResolutionInput::Reply {
                            classification: &classification,
                            text,
                        },
                    );
                    let applied = history::apply_resolution(
                        &responded,
                        goal,
                        &resolution,
                        Some(&classification),
                        clock,
                    )?;
                    state.last_conversation_at = Some(clock);
                    (applied, Some(classification))
                }
                None => {
                    clock = clock.plus_days(goal.days_between_attempts);
                    let resolution = resolve(goal, &ResolutionInput::Timeout);
                    (
                        history::apply_resolution(&current, goal, &resolution, None, clock)?,
                        None,
                    )
                }
            };
            if applied.attempt.clarify_pending && applied.effects.response_text.is_some() {
                applied.attempt = history::resume_clarified(&applied.attempt, clock)?;
            }
            apply_to_state(&mut state, &applied, clock);
            let response = applied
                .effects
                .response_text
                .as_deref()
                .map(|t| render_template(t, contact));

            steps.push(RehearsalStep {
                goal_key: current.goal_key.clone(),
                attempt_number: current.attempt_count,
                sent_at,
                message,
                reply: reply.clone(),
                classification,
                outcome_name: applied.resolution.outcome_name.clone(),
                status: applied.attempt.status,
                response: response.clone(),
                next_attempt_at: applied.attempt.next_attempt_at,
            });
            current = applied.attempt.clone();

            match current.status {
                AttemptStatus::Sent => {
                    clarifying = response;
                    continue;
                }
                AttemptStatus::Pending => continue,
                AttemptStatus::Deferred => {
                    clock = current.next_attempt_at.unwrap_or(clock);
                    current = history::release_deferred(&current, goal, clock)?;
                    if current.status == AttemptStatus::Declined {
                        close(&mut state, &current);
                        attempts.push(current.clone());
                        break StopReason::Exhausted;
                    }
                }
                AttemptStatus::Escalated => {
                    attempts.push(current.clone());
                    break StopReason::Escalated;
                }
                _ => {
                    close(&mut state, &current);
                    attempts.push(current.clone());
                    if state.opted_out {
                        break StopReason::OptedOut;
                    }

                    let follow_on = applied
                        .effects
                        .next_goal
                        .as_deref()
                        .filter(|_| !applied.effects.refusal)
                        .filter(|key| !state.has_history_for(key));
                    let next = match follow_on {
                        Some(key) => {
                            let priority = self.registry.get(key).map_or(0, |g| g.priority);
                            Ok(AttemptHistory::pending(
                                contact.id,
                                key,
                                &format!("follow-on from {}:{}", current.goal_key, applied.resolution.outcome_name),
                                priority as f32,
                                DecisionMethod::RuleMatch,
                                clock,
                            ))
                        }
                        None => self.plan(&state, clock, &mut selections).await?,
                    };
                    match next {
                        Ok(attempt) => {
                            state.open_goals.insert(attempt.goal_key.clone());
                            current = attempt;
                        }
                        Err(stopped) => break stopped,
                    }
                }
            }
        };

        if stopped == StopReason::ScriptFinished && !attempts.iter().any(|a| a.id == current.id) {
            attempts.push(current);
        }
        debug!(
            contact_id = %contact.id,
            steps = steps.len(),
            stopped = ?stopped,
            "Rehearsal finished"
        );
        Ok(report(selections, steps, attempts, state, stopped))
    }

    /// Select a goal and open an attempt for it, or say why not.
    async fn plan(
        &self,
        state: &ContactState,
        now: Timestamp,
        selections: &mut Vec<GoalSelection>,
    ) -> Result<Result<AttemptHistory, StopReason>, PlannerError> {
        let selection = match self.selector.select_goal(state, now).await {
            Ok(selection) => selection,
            Err(PlannerError::OptedOut(_)) => return Ok(Err(StopReason::OptedOut)),
            Err(PlannerError::CoolingDown(..)) => return Ok(Err(StopReason::CoolingDown)),
            Err(e) => return Err(e),
        };
        selections.push(selection.clone());
        if state.has_history_for(&selection.goal_key) {
            return Ok(Err(StopReason::NothingToPlan));
        }
        Ok(Ok(AttemptHistory::pending(
            state.contact_id,
            &selection.goal_key,
            &selection.reasoning,
            selection.score,
            selection.method,
            now,
        )))
    }
}

fn send(attempt: &AttemptHistory, now: Timestamp) -> Result<AttemptHistory, TransitionError> {
    let mut next = attempt.clone();
    history::state_machine::validate_transition(next.status, AttemptStatus::Sent)?;
    next.status = AttemptStatus::Sent;
    if !next.clarify_pending {
        next.attempt_count += 1;
    }
    next.clarify_pending = false;
    next.last_attempt_at = Some(now);
    next.updated_at = now;
    Ok(next)
}

fn close(state: &mut ContactState, attempt: &AttemptHistory) {
    state.open_goals.remove(&attempt.goal_key);
    state.closed_goals.insert(attempt.goal_key.clone());
}

fn apply_to_state(state: &mut ContactState, applied: &Applied, now: Timestamp) {
    if let Some(spec) = &applied.effects.insight {
        state
            .insights
            .insert(spec.attribute.clone(), spec.value.clone());
    }
    if applied.effects.opt_out {
        state.opted_out = true;
    }
    if applied.effects.refusal {
        state.last_refusal_at = Some(now);
    }
}

fn report(
    selections: Vec<GoalSelection>,
    steps: Vec<RehearsalStep>,
    attempts: Vec<AttemptHistory>,
    final_state: ContactState,
    stopped: StopReason,
) -> RehearsalReport {
    RehearsalReport {
        selections,
        steps,
        attempts,
        final_state,
        stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use outreach_core::goal::Intent;
    use outreach_core::types::Identity;

    use crate::guard::DoNotContactGuard;

    fn rehearsal() -> Rehearsal {
        let registry = Arc::new(GoalRegistry::builtin().unwrap());
        let selector = Arc::new(GoalSelector::new(registry, DoNotContactGuard::new(90), true));
        Rehearsal::new(selector, Arc::new(LayeredClassifier::patterns_only()))
    }

    fn chat_contact() -> (Contact, ContactState) {
        let contact = Contact::new(Identity::ChatOnly {
            chat_user_id: "u1".to_string(),
        })
        .with_name("Lin");
        let state = ContactState::from_parts(&contact, None, &[], &[]);
        (contact, state)
    }

    fn script(replies: &[Option<&str>]) -> Vec<Option<String>> {
        replies.iter().map(|r| r.map(str::to_string)).collect()
    }

    #[tokio::test]
    async fn test_link_account_conversation() {
        let (contact, state) = chat_contact();
        let report = rehearsal()
            .rehearse(&contact, state, &script(&[Some("I linked my account")]), Timestamp(1_700_000_000))
            .await
            .unwrap();

        assert_eq!(report.selections[0].goal_key, "link_account");
        let step = &report.steps[0];
        assert!(step.message.starts_with("Hi Lin!"));
        assert_eq!(step.classification.as_ref().unwrap().intent, Intent::Converted);
        assert_eq!(step.outcome_name, "linked");
        assert_eq!(step.status, AttemptStatus::Success);
        assert_eq!(step.response.as_deref(), Some("Thanks Lin, you're all linked up!"));
        assert_eq!(
            report.final_state.insights.get("account_link_intent").map(String::as_str),
            Some("completed")
        );
        assert!(report.final_state.closed_goals.contains("link_account"));
    }

    #[tokio::test]
    async fn test_silence_defers_then_exhausts() {
        let (contact, state) = chat_contact();
        let start = Timestamp(1_700_000_000);
        let report = rehearsal()
            .rehearse(&contact, state, &script(&[None, None]), start)
            .await
            .unwrap();

        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].status, AttemptStatus::Deferred);
        assert_eq!(report.steps[0].next_attempt_at, Some(start.plus_days(14)));
        assert!(report.steps[1].message.contains("circling back"));
        assert_eq!(report.steps[1].attempt_number, 2);
        assert_eq!(report.stopped, StopReason::Exhausted);
        assert_eq!(
            report.attempts[0].outcome_name.as_deref(),
            Some(ATTEMPTS_EXHAUSTED)
        );
    }

    #[tokio::test]
    async fn test_hard_refusal_stops_rehearsal() {
        let (contact, state) = chat_contact();
        let report = rehearsal()
            .rehearse(
                &contact,
                state,
                &script(&[Some("stop messaging me"), Some("hello?")]),
                Timestamp(1_700_000_000),
            )
            .await
            .unwrap();

        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].status, AttemptStatus::Declined);
        assert!(report.final_state.opted_out);
        assert_eq!(report.stopped, StopReason::OptedOut);
    }

    #[tokio::test]
    async fn test_soft_refusal_cools_down() {
        let (contact, state) = chat_contact();
        let report = rehearsal()
            .rehearse(
                &contact,
                state,
                &script(&[Some("no thanks"), Some("ok")]),
                Timestamp(1_700_000_000),
            )
            .await
            .unwrap();
        assert_eq!(report.steps.len(), 1);
        assert!(!report.final_state.opted_out);
        assert_eq!(report.stopped, StopReason::CoolingDown);
    }

    #[tokio::test]
    async fn test_clarify_keeps_the_same_attempt() {
        let (contact, state) = chat_contact();
        let report = rehearsal()
            .rehearse(
                &contact,
                state,
                &script(&[Some("hmm I see"), Some("yes please")]),
                Timestamp(1_700_000_000),
            )
            .await
            .unwrap();

        // The clarifying question is the response; the answer is read
        // against the same attempt without spending another one.
        assert_eq!(report.steps[0].status, AttemptStatus::Sent);
        let question = report.steps[0].response.clone().unwrap();
        assert_eq!(report.steps[1].goal_key, "link_account");
        assert_eq!(report.steps[1].message, question);
        assert_eq!(report.steps[1].attempt_number, 1);
        assert_eq!(report.steps[1].outcome_name, "wants_link");
    }

    #[tokio::test]
    async fn test_repeated_clarify_never_exhausts() {
        let (contact, state) = chat_contact();
        let report = rehearsal()
            .rehearse(
                &contact,
                state,
                &script(&[Some("hmm I see"), Some("hmm I see"), Some("hmm I see")]),
                Timestamp(1_700_000_000),
            )
            .await
            .unwrap();

        assert_eq!(report.steps.len(), 3);
        assert!(report.steps.iter().all(|s| s.attempt_number == 1));
        assert!(report.steps.iter().all(|s| s.status == AttemptStatus::Sent));
        assert_eq!(report.stopped, StopReason::ScriptFinished);
    }

    #[tokio::test]
    async fn test_follow_on_goal_is_played_next() {
        let contact = Contact::new(Identity::AccountLinked {
            account_id: "acct".to_string(),
            chat_user_id: None,
            email: Some("x@example.com".to_string()),
        });
        let state = ContactState::from_parts(&contact, None, &[], &[]);
        let report = rehearsal()
            .rehearse(
                &contact,
                state,
                &script(&[Some("yes, sounds fun"), Some("mostly the events")]),
                Timestamp(1_700_000_000),
            )
            .await
            .unwrap();

        assert_eq!(report.steps[0].goal_key, "drive_engagement");
        assert_eq!(report.steps[1].goal_key, "learn_interests");
        assert_eq!(report.steps[1].outcome_name, "events");
        assert_eq!(
            report.final_state.insights.get("event_interest").map(String::as_str),
            Some("events")
        );
    }
}
