//! Periodic sweeps: stale claims, score recompute, reply timeouts, deferred
//! releases, dispatch of due attempts, and planning for idle contacts.
//!
//! Every sweep is bounded per run by [`SweepConfig`]. A failure on one row is
//! logged and counted; it never stops the rest of the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use outreach_core::attempt::AttemptStatus;
use outreach_core::config::{OutreachConfig, SweepConfig};
use outreach_core::error::Result;
use outreach_core::types::Timestamp;
use outreach_scoring::RecomputeService;
use outreach_storage::{AttemptRepository, ContactRepository, Database};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{DispatchError, PlannerError, TransitionError};
use crate::history::HistoryService;
use crate::selector::GoalSelector;
use crate::state::StateReader;

/// Counts from one pass over every sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub stale_claims: usize,
    pub recomputed: usize,
    pub timed_out: usize,
    pub released: usize,
    pub exhausted: usize,
    pub planned: usize,
    pub dispatched: usize,
    pub postponed: usize,
    pub failed: usize,
}

impl SweepSummary {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives the sweeps on an interval until shut down.
pub struct SweepScheduler {
    attempts: AttemptRepository,
    contacts: ContactRepository,
    states: StateReader,
    history: Arc<HistoryService>,
    selector: Arc<GoalSelector>,
    dispatcher: Arc<Dispatcher>,
    recompute: Option<Arc<RecomputeService>>,
    sweeps: SweepConfig,
    claim_ttl_minutes: u32,
    refusal_cooldown_days: u32,
    shutdown: Arc<Notify>,
}

impl SweepScheduler {
    pub fn new(
        db: Arc<Database>,
        config: &OutreachConfig,
        history: Arc<HistoryService>,
        selector: Arc<GoalSelector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            attempts: AttemptRepository::new(db.clone()),
            contacts: ContactRepository::new(db.clone()),
            states: StateReader::new(db),
            history,
            selector,
            dispatcher,
            recompute: None,
            sweeps: config.sweeps.clone(),
            claim_ttl_minutes: config.dispatch.claim_ttl_minutes,
            refusal_cooldown_days: config.planner.refusal_cooldown_days,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Also recompute stale contact and organization scores each pass.
    pub fn with_recompute(mut self, recompute: Arc<RecomputeService>) -> Self {
        self.recompute = Some(recompute);
        self
    }

    /// Run sweeps every `interval_secs` until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.sweeps.interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "Sweep scheduler started");
        loop {
            match self.run_once(Timestamp::now()).await {
                Ok(summary) if summary.is_idle() => debug!("Sweep pass idle"),
                Ok(summary) => info!(
                    stale_claims = summary.stale_claims,
                    recomputed = summary.recomputed,
                    timed_out = summary.timed_out,
                    released = summary.released,
                    exhausted = summary.exhausted,
                    planned = summary.planned,
                    dispatched = summary.dispatched,
                    postponed = summary.postponed,
                    failed = summary.failed,
                    "Sweep pass complete"
                ),
                Err(e) => warn!(error = %e, "Sweep pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => {
                    info!("Sweep scheduler stopped");
                    return;
                }
            }
        }
    }

    /// Signal the scheduler to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// One pass of every sweep, in dependency order.
    pub async fn run_once(&self, now: Timestamp) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        self.release_stale_claims(now, &mut summary)?;
        self.recompute_scores(now, &mut summary)?;
        self.sweep_timeouts(now, &mut summary)?;
        self.sweep_deferred(now, &mut summary)?;
        self.sweep_pending(now, &mut summary).await?;
        self.sweep_planning(now, &mut summary).await?;
        Ok(summary)
    }

    fn release_stale_claims(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        let cutoff = now.minus_minutes(self.claim_ttl_minutes);
        summary.stale_claims += self.attempts.release_stale_claims(cutoff)?;
        Ok(())
    }

    fn recompute_scores(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        let Some(recompute) = &self.recompute else {
            return Ok(());
        };
        for result in [
            recompute.recompute_stale_contacts(now)?,
            recompute.recompute_stale_organizations(now)?,
        ] {
            summary.recomputed += result.processed;
            summary.failed += result.failed;
        }
        Ok(())
    }

    /// Resolve `sent` attempts whose goal interval passed without a reply.
    ///
    /// Goals are grouped by interval and each group gets its own cutoff, so
    /// rows that are not yet due never take batch slots from due ones.
    fn sweep_timeouts(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        let registry = self.history.registry();
        let mut by_interval: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
        for goal in registry.goals() {
            by_interval
                .entry(goal.days_between_attempts)
                .or_default()
                .push(goal.key.as_str());
        }

        let mut remaining = self.sweeps.timeout_batch;
        for (days, goal_keys) in by_interval {
            if remaining == 0 {
                break;
            }
            let due = self
                .attempts
                .list_sent_before_for_goals(&goal_keys, now.minus_days(days), remaining)?;
            remaining = remaining.saturating_sub(due.len() as u32);

            for attempt in due {
                match self.history.handle_timeout(&attempt, now) {
                    Ok(_) => summary.timed_out += 1,
                    Err(TransitionError::Conflict(_)) => {
                        debug!(attempt_id = %attempt.id, "Reply arrived before timeout; skipped")
                    }
                    Err(e) => {
                        warn!(attempt_id = %attempt.id, error = %e, "Timeout resolution failed");
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Return due `deferred` attempts to `pending`, declining exhausted ones.
    fn sweep_deferred(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        for attempt in self
            .attempts
            .list_deferred_due(now, self.sweeps.deferred_batch)?
        {
            match self.history.release_deferred(&attempt, now) {
                Ok(next) if next.status == AttemptStatus::Pending => summary.released += 1,
                Ok(_) => summary.exhausted += 1,
                Err(TransitionError::Conflict(_)) => {}
                Err(e) => {
                    warn!(attempt_id = %attempt.id, error = %e, "Deferred release failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Dispatch `pending` attempts that are due.
    async fn sweep_pending(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        for attempt in self
            .attempts
            .list_pending_due(now, self.sweeps.dispatch_batch)?
        {
            self.dispatch(attempt.id, now, summary).await;
        }
        Ok(())
    }

    /// Select and dispatch a goal for contacts with nothing open.
    async fn sweep_planning(&self, now: Timestamp, summary: &mut SweepSummary) -> Result<()> {
        let refused_before = now.minus_days(self.refusal_cooldown_days);
        let contacts = self
            .contacts
            .list_plannable(refused_before, self.sweeps.planning_batch)?;

        for contact in contacts {
            let state = match self.states.project(&contact) {
                Ok(state) => state,
                Err(e) => {
                    warn!(contact_id = %contact.id, error = %e, "Failed to load contact state");
                    summary.failed += 1;
                    continue;
                }
            };
            let selection = match self.selector.select_goal(&state, now).await {
                Ok(selection) => selection,
                Err(PlannerError::OptedOut(_) | PlannerError::CoolingDown(..)) => continue,
                Err(e) => {
                    warn!(contact_id = %contact.id, error = %e, "Goal selection failed");
                    summary.failed += 1;
                    continue;
                }
            };
            if state.has_history_for(&selection.goal_key) {
                debug!(
                    contact_id = %contact.id,
                    goal = %selection.goal_key,
                    "Selected goal already pursued; nothing to plan"
                );
                continue;
            }

            let enqueued = self.history.enqueue(
                contact.id,
                &selection.goal_key,
                &selection.reasoning,
                selection.score,
                selection.method,
                now,
            );
            match enqueued {
                Ok(Some(attempt)) => {
                    summary.planned += 1;
                    self.dispatch(attempt.id, now, summary).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(contact_id = %contact.id, error = %e, "Failed to enqueue attempt");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, attempt_id: uuid::Uuid, now: Timestamp, summary: &mut SweepSummary) {
        match self.dispatcher.dispatch(attempt_id, now).await {
            Ok(DispatchOutcome::Sent { .. }) => summary.dispatched += 1,
            Ok(DispatchOutcome::Exhausted { .. }) => summary.exhausted += 1,
            Ok(DispatchOutcome::Postponed { .. }) => summary.postponed += 1,
            Err(DispatchError::AlreadyClaimed(_) | DispatchError::NotPending(_)) => {}
            Err(e) => {
                warn!(attempt_id = %attempt_id, error = %e, "Dispatch failed");
                summary.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use outreach_core::attempt::AttemptHistory;
    use outreach_core::goal::DecisionMethod;
    use outreach_core::types::{Contact, Identity};

    use crate::dispatcher::{DeliveryHandle, Transport};
    use crate::error::TransportError;
    use crate::guard::DoNotContactGuard;
    use crate::registry::GoalRegistry;

    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _contact: &Contact, _body: &str) -> std::result::Result<DeliveryHandle, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryHandle {
                message_id: format!("m{}", n),
            })
        }
    }

    struct Fixture {
        db: Arc<Database>,
        scheduler: SweepScheduler,
        transport: Arc<CountingTransport>,
    }

    fn fixture() -> Fixture {
        fixture_with(OutreachConfig::default())
    }

    fn fixture_with(config: OutreachConfig) -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let registry = Arc::new(GoalRegistry::builtin().unwrap());
        let guard = DoNotContactGuard::new(config.planner.refusal_cooldown_days);
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let history = Arc::new(HistoryService::new(db.clone(), registry.clone()));
        let selector = Arc::new(GoalSelector::new(registry.clone(), guard, true));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            registry,
            guard,
            config.dispatch.clone(),
            transport.clone(),
        ));
        Fixture {
            scheduler: SweepScheduler::new(db.clone(), &config, history, selector, dispatcher),
            db,
            transport,
        }
    }

    fn add_contact(f: &Fixture) -> Contact {
        let contact = Contact::new(Identity::ChatOnly {
            chat_user_id: uuid::Uuid::new_v4().to_string(),
        });
        ContactRepository::new(f.db.clone()).insert(&contact).unwrap();
        contact
    }

    // =====================================================================
    // Loop control
    // =====================================================================

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let f = fixture();
        f.scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(2), f.scheduler.run())
            .await
            .expect("Scheduler should shut down within timeout");
    }

    #[tokio::test]
    async fn test_empty_pass_is_idle() {
        let f = fixture();
        let summary = f.scheduler.run_once(Timestamp::now()).await.unwrap();
        assert!(summary.is_idle());
    }

    // =====================================================================
    // Sweeps
    // =====================================================================

    #[tokio::test]
    async fn test_planning_enqueues_and_dispatches() {
        let f = fixture();
        let contact = add_contact(&f);

        let summary = f.scheduler.run_once(Timestamp::now()).await.unwrap();
        assert_eq!(summary.planned, 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 1);

        let attempts = AttemptRepository::new(f.db.clone())
            .list_for_contact(contact.id)
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Sent);

        // A second pass finds nothing new to plan for this contact.
        let summary = f.scheduler.run_once(Timestamp::now()).await.unwrap();
        assert_eq!(summary.planned, 0);
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_opted_out_contacts_are_not_planned() {
        let f = fixture();
        let contact = add_contact(&f);
        ContactRepository::new(f.db.clone())
            .set_opted_out(contact.id, true)
            .unwrap();

        let summary = f.scheduler.run_once(Timestamp::now()).await.unwrap();
        assert_eq!(summary.planned, 0);
        assert_eq!(f.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_deferred_release_then_redispatch() {
        let f = fixture();
        let contact = add_contact(&f);
        let start = Timestamp::now();
        f.scheduler.run_once(start).await.unwrap();
        let attempt = AttemptRepository::new(f.db.clone())
            .list_for_contact(contact.id)
            .unwrap()
            .remove(0);
        let interval = f
            .scheduler
            .history
            .registry()
            .get(&attempt.goal_key)
            .unwrap()
            .days_between_attempts;

        // Not yet due.
        let summary = f.scheduler.run_once(start.plus_days(interval - 1)).await.unwrap();
        assert_eq!(summary.timed_out, 0);

        let timed_out_at = start.plus_days(interval);
        let summary = f.scheduler.run_once(timed_out_at).await.unwrap();
        assert_eq!(summary.timed_out, 1);
        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Deferred);

        let summary = f
            .scheduler
            .run_once(timed_out_at.plus_days(interval))
            .await
            .unwrap();
        assert_eq!(summary.released, 1);
        assert_eq!(summary.dispatched, 1);
        let stored = AttemptRepository::new(f.db.clone()).require(attempt.id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Sent);
        assert_eq!(stored.attempt_count, 2);
    }

    fn insert_sent(f: &Fixture, contact: &Contact, goal: &str, sent_at: Timestamp) -> AttemptHistory {
        let repo = AttemptRepository::new(f.db.clone());
        let attempt = AttemptHistory::pending(
            contact.id,
            goal,
            "r",
            1.0,
            DecisionMethod::RuleMatch,
            sent_at,
        );
        repo.insert_open(&attempt).unwrap();
        let token = uuid::Uuid::new_v4();
        assert!(repo.claim(attempt.id, token, sent_at).unwrap());
        assert!(repo.mark_sent(attempt.id, token, "m", sent_at).unwrap());
        repo.require(attempt.id).unwrap()
    }

    #[tokio::test]
    async fn test_long_interval_rows_do_not_starve_due_timeouts() {
        let mut config = OutreachConfig::default();
        config.sweeps.timeout_batch = 1;
        let f = fixture_with(config);
        let now = Timestamp::now();

        // Older, but its 14 day interval has not passed.
        let waiting = insert_sent(&f, &add_contact(&f), "deepen_relationship", now.minus_days(10));
        // Newer, and past its 7 day interval.
        let due = insert_sent(&f, &add_contact(&f), "initial_contact", now.minus_days(8));

        let summary = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(summary.timed_out, 1);

        let repo = AttemptRepository::new(f.db.clone());
        assert_eq!(repo.require(due.id).unwrap().status, AttemptStatus::Deferred);
        assert_eq!(repo.require(waiting.id).unwrap().status, AttemptStatus::Sent);
    }

    #[tokio::test]
    async fn test_stale_claims_are_released() {
        let f = fixture();
        let contact = add_contact(&f);
        let now = Timestamp::now();
        let attempt = AttemptHistory::pending(
            contact.id,
            "initial_contact",
            "r",
            1.0,
            DecisionMethod::RuleMatch,
            now,
        );
        let repo = AttemptRepository::new(f.db.clone());
        repo.insert_open(&attempt).unwrap();
        assert!(repo
            .claim(attempt.id, uuid::Uuid::new_v4(), now.minus_hours(1))
            .unwrap());

        let summary = f.scheduler.run_once(now).await.unwrap();
        assert_eq!(summary.stale_claims, 1);
        assert_eq!(summary.dispatched, 1);
    }
}
