//! Live handling of inbound replies.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use outreach_core::types::{Contact, Timestamp};
use outreach_storage::{AttemptRepository, ContactRepository, Database};

use crate::classifier::{Classification, LayeredClassifier};
use crate::dispatcher::render_template;
use crate::error::TransitionError;
use crate::history::{Handled, HistoryService, OPTED_OUT, REFUSED};

/// Sent back when anything inside the reply path fails.
pub const FALLBACK_RESPONSE: &str = "Thanks for your message! Someone from the team will get back to you soon.";

/// Acknowledgement for an opt-out that arrived outside any outreach thread.
pub const OPT_OUT_ACK: &str = "Understood. You won't hear from us again.";

/// Acknowledgement for a softer refusal that arrived outside any outreach
/// thread.
pub const REFUSAL_ACK: &str = "No problem, we'll leave it there.";

/// What the caller should say back, and what was recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyResult {
    /// Text to send back to the contact, if any.
    pub response: Option<String>,
    pub classification: Option<Classification>,
    pub attempt_id: Option<Uuid>,
    pub outcome_name: Option<String>,
}

impl ReplyResult {
    fn fallback() -> Self {
        Self {
            response: Some(FALLBACK_RESPONSE.to_string()),
            classification: None,
            attempt_id: None,
            outcome_name: None,
        }
    }
}

/// Routes a reply to the attempt awaiting it, classifies it, and advances
/// the attempt.
pub struct ReplyHandler {
    attempts: AttemptRepository,
    contacts: ContactRepository,
    history: Arc<HistoryService>,
    classifier: Arc<LayeredClassifier>,
}

impl ReplyHandler {
    pub fn new(
        db: Arc<Database>,
        history: Arc<HistoryService>,
        classifier: Arc<LayeredClassifier>,
    ) -> Self {
        Self {
            attempts: AttemptRepository::new(db.clone()),
            contacts: ContactRepository::new(db),
            history,
            classifier,
        }
    }

    /// Handle a reply from `contact_id`. Never fails: internal errors are
    /// logged and answered with [`FALLBACK_RESPONSE`].
    pub async fn handle(&self, contact_id: Uuid, text: &str, now: Timestamp) -> ReplyResult {
        match self.try_handle(contact_id, text, now).await {
            Ok(result) => result,
            Err(e) => {
                error!(contact_id = %contact_id, error = %e, "Reply handling failed");
                ReplyResult::fallback()
            }
        }
    }

    async fn try_handle(
        &self,
        contact_id: Uuid,
        text: &str,
        now: Timestamp,
    ) -> Result<ReplyResult, TransitionError> {
        let contact = self.contacts.require(contact_id)?;
        let classification = self.classifier.classify_reply(text).await;

        let Some(attempt) = self.attempts.latest_awaiting_reply(contact_id)? else {
            return self.unsolicited(&contact, classification, now);
        };

        let Handled { applied, enqueued } =
            self.history
                .handle_reply(attempt.id, &classification, text, now)?;
        if let Some(next) = &enqueued {
            debug!(attempt_id = %next.id, goal = %next.goal_key, "Follow-on attempt queued");
        }

        let response = applied
            .effects
            .response_text
            .as_deref()
            .map(|t| render_template(t, &contact));
        Ok(ReplyResult {
            response,
            classification: Some(classification),
            attempt_id: Some(applied.attempt.id),
            outcome_name: Some(applied.resolution.outcome_name),
        })
    }

    /// A message with no attempt waiting on it. A refusal still lands on the
    /// contact and closes their queued attempts.
    fn unsolicited(
        &self,
        contact: &Contact,
        classification: Classification,
        now: Timestamp,
    ) -> Result<ReplyResult, TransitionError> {
        if !classification.is_refusal() {
            debug!(contact_id = %contact.id, "No attempt awaiting this reply");
            return Ok(ReplyResult {
                response: None,
                classification: Some(classification),
                attempt_id: None,
                outcome_name: None,
            });
        }

        if classification.opt_out {
            self.contacts.set_opted_out(contact.id, true)?;
        }
        self.contacts.record_refusal(contact.id, now)?;

        let (reason, ack) = if classification.opt_out {
            (OPTED_OUT, OPT_OUT_ACK)
        } else {
            (REFUSED, REFUSAL_ACK)
        };
        let closed = self.history.decline_open(contact.id, reason, now)?;
        info!(
            contact_id = %contact.id,
            opt_out = classification.opt_out,
            closed = closed.len(),
            "Refusal received outside an outreach thread"
        );

        Ok(ReplyResult {
            response: Some(ack.to_string()),
            classification: Some(classification),
            attempt_id: closed.first().map(|a| a.id),
            outcome_name: Some(reason.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use outreach_core::attempt::{AttemptHistory, AttemptStatus};
    use outreach_core::goal::DecisionMethod;
    use outreach_core::types::Identity;

    use crate::registry::GoalRegistry;

    struct Fixture {
        db: Arc<Database>,
        handler: ReplyHandler,
        contact: Contact,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let contact = Contact::new(Identity::ChatOnly {
            chat_user_id: "u1".to_string(),
        })
        .with_name("Grace");
        ContactRepository::new(db.clone()).insert(&contact).unwrap();
        let history = Arc::new(HistoryService::new(
            db.clone(),
            Arc::new(GoalRegistry::builtin().unwrap()),
        ));
        Fixture {
            handler: ReplyHandler::new(db.clone(), history, Arc::new(LayeredClassifier::patterns_only())),
            db,
            contact,
        }
    }

    fn sent(f: &Fixture, goal: &str, now: Timestamp) -> AttemptHistory {
        let repo = AttemptRepository::new(f.db.clone());
        let attempt =
            AttemptHistory::pending(f.contact.id, goal, "r", 1.0, DecisionMethod::RuleMatch, now);
        repo.insert_open(&attempt).unwrap();
        let token = Uuid::new_v4();
        repo.claim(attempt.id, token, now).unwrap();
        repo.mark_sent(attempt.id, token, "m", now).unwrap();
        repo.require(attempt.id).unwrap()
    }

    #[tokio::test]
    async fn test_reply_resolves_and_renders_response() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent(&f, "membership_pitch", now);

        let result = f.handler.handle(f.contact.id, "I just signed up!", now).await;
        assert_eq!(result.attempt_id, Some(attempt.id));
        assert_eq!(result.outcome_name.as_deref(), Some("joined"));
        assert_eq!(result.response.as_deref(), Some("Welcome aboard, Grace!"));

        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        assert_eq!(stored.response_text.as_deref(), Some("I just signed up!"));
    }

    #[tokio::test]
    async fn test_defer_reply_uses_phrase_days() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent(&f, "link_account", now);

        let result = f.handler.handle(f.contact.id, "ask me next month", now).await;
        assert_eq!(result.outcome_name.as_deref(), Some("later"));
        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Deferred);
        assert_eq!(stored.next_attempt_at, Some(now.plus_days(30)));
    }

    #[tokio::test]
    async fn test_unsolicited_opt_out_is_honored() {
        let f = fixture();
        let result = f.handler.handle(f.contact.id, "unsubscribe", Timestamp::now()).await;
        assert_eq!(result.response.as_deref(), Some(OPT_OUT_ACK));
        assert!(ContactRepository::new(f.db.clone())
            .require(f.contact.id)
            .unwrap()
            .opted_out);
    }

    #[tokio::test]
    async fn test_refusal_while_deferred_closes_the_attempt() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent(&f, "link_account", now);

        f.handler.handle(f.contact.id, "ask me next week", now).await;
        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Deferred);

        let later = now.plus_days(1);
        let result = f
            .handler
            .handle(f.contact.id, "actually no thanks, not interested", later)
            .await;
        assert_eq!(result.response.as_deref(), Some(REFUSAL_ACK));
        assert_eq!(result.attempt_id, Some(attempt.id));
        assert_eq!(result.outcome_name.as_deref(), Some(REFUSED));

        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Declined);
        assert_eq!(stored.outcome_name.as_deref(), Some(REFUSED));

        let contact = ContactRepository::new(f.db.clone()).require(f.contact.id).unwrap();
        assert_eq!(contact.last_refusal_at, Some(later));
        assert!(!contact.opted_out);
    }

    #[tokio::test]
    async fn test_clarify_reply_stays_in_thread() {
        let f = fixture();
        let now = Timestamp::now();
        let attempt = sent(&f, "link_account", now);

        let result = f.handler.handle(f.contact.id, "hmm I see", now).await;
        assert_eq!(result.outcome_name.as_deref(), Some("fallback"));
        assert!(result.response.is_some());

        // The clarifying question went out with the reply, so the next
        // message is routed to the same attempt.
        let result = f.handler.handle(f.contact.id, "no thanks", now).await;
        assert_eq!(result.attempt_id, Some(attempt.id));
        assert_eq!(result.outcome_name.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn test_unsolicited_chatter_is_ignored() {
        let f = fixture();
        let result = f.handler.handle(f.contact.id, "hello there", Timestamp::now()).await;
        assert_eq!(result.response, None);
        assert_eq!(result.attempt_id, None);
    }

    #[tokio::test]
    async fn test_unknown_contact_gets_fallback() {
        let f = fixture();
        let result = f.handler.handle(Uuid::new_v4(), "yes", Timestamp::now()).await;
        assert_eq!(result, ReplyResult::fallback());
    }
}
