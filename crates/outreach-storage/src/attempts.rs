//! Attempt ledger persistence.
//!
//! Every write is a single conditional statement: creation relies on the
//! partial unique index over open statuses, and every advance is a
//! compare-and-set on the row's current status (plus the claim token for
//! dispatch). A `false` return means another worker got there first.

use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tracing::{debug, warn};
use uuid::Uuid;

use outreach_core::attempt::{AttemptHistory, AttemptStatus};
use outreach_core::error::OutreachError;
use outreach_core::types::Timestamp;

use crate::db::{map_write_err, Database};
use crate::repository::{parse_uuid, OPEN_STATUS_SQL};

const ATTEMPT_COLUMNS: &str = "id, contact_id, goal_key, status, attempt_count, last_attempt_at,
     next_attempt_at, outcome_name, response_text, response_sentiment, response_intent,
     planner_reasoning, planner_score, decision_method, message_id, claim_token, claimed_at,
     created_at, updated_at, clarify_pending";

/// Repository for the per-(contact, goal) attempt ledger.
pub struct AttemptRepository {
    db: Arc<Database>,
}

impl AttemptRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new open attempt.
    ///
    /// Returns `Conflict` when the pair already has an open attempt.
    pub fn insert_open(&self, attempt: &AttemptHistory) -> Result<(), OutreachError> {
        if attempt.status.is_terminal() {
            return Err(OutreachError::InvariantViolation(format!(
                "attempt {} inserted in terminal status {}",
                attempt.id, attempt.status
            )));
        }
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO attempt_history (id, contact_id, goal_key, status, attempt_count,
                                              last_attempt_at, next_attempt_at, outcome_name,
                                              response_text, response_sentiment, response_intent,
                                              planner_reasoning, planner_score, decision_method,
                                              message_id, claim_token, claimed_at, created_at,
                                              updated_at, clarify_pending)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20)",
                rusqlite::params![
                    attempt.id.to_string(),
                    attempt.contact_id.to_string(),
                    attempt.goal_key,
                    attempt.status.as_str(),
                    attempt.attempt_count,
                    attempt.last_attempt_at.map(|t| t.0),
                    attempt.next_attempt_at.map(|t| t.0),
                    attempt.outcome_name,
                    attempt.response_text,
                    attempt.response_sentiment.map(|s| s.to_string()),
                    attempt.response_intent.map(|i| i.to_string()),
                    attempt.planner_reasoning,
                    attempt.planner_score as f64,
                    attempt.decision_method.to_string(),
                    attempt.message_id,
                    attempt.claim_token.map(|t| t.to_string()),
                    attempt.claimed_at.map(|t| t.0),
                    attempt.created_at.0,
                    attempt.updated_at.0,
                    attempt.clarify_pending,
                ],
            )
            .map_err(|e| map_write_err("Failed to insert attempt", e))?;
            Ok(())
        })?;
        debug!(
            attempt_id = %attempt.id,
            contact_id = %attempt.contact_id,
            goal = %attempt.goal_key,
            "Opened attempt"
        );
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AttemptHistory>, OutreachError> {
        let sql = format!("SELECT {} FROM attempt_history WHERE id = ?1", ATTEMPT_COLUMNS);
        self.query_one(&sql, rusqlite::params![id.to_string()])
    }

    pub fn require(&self, id: Uuid) -> Result<AttemptHistory, OutreachError> {
        self.get(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("attempt {}", id)))
    }

    /// The open attempt for a (contact, goal) pair, if any.
    pub fn find_open(
        &self,
        contact_id: Uuid,
        goal_key: &str,
    ) -> Result<Option<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE contact_id = ?1 AND goal_key = ?2 AND status IN {}",
            ATTEMPT_COLUMNS, OPEN_STATUS_SQL
        );
        self.query_one(&sql, rusqlite::params![contact_id.to_string(), goal_key])
    }

    /// Every attempt for a contact, newest first.
    pub fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE contact_id = ?1
             ORDER BY created_at DESC, rowid DESC",
            ATTEMPT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![contact_id.to_string()])
    }

    /// `sent` rows for any of `goal_keys` dispatched at or before `cutoff`,
    /// oldest first.
    pub fn list_sent_before_for_goals(
        &self,
        goal_keys: &[&str],
        cutoff: Timestamp,
        limit: u32,
    ) -> Result<Vec<AttemptHistory>, OutreachError> {
        if goal_keys.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..goal_keys.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE status = 'sent' AND last_attempt_at <= ?1 AND goal_key IN ({})
             ORDER BY last_attempt_at ASC
             LIMIT ?2",
            ATTEMPT_COLUMNS, placeholders
        );
        let mut params: Vec<Value> = vec![Value::Integer(cutoff.0), Value::Integer(limit as i64)];
        params.extend(goal_keys.iter().map(|k| Value::Text(k.to_string())));
        self.query_many(&sql, rusqlite::params_from_iter(params))
    }

    /// `deferred` rows whose hold has elapsed.
    pub fn list_deferred_due(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE status = 'deferred' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY next_attempt_at ASC
             LIMIT ?2",
            ATTEMPT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![now.0, limit])
    }

    /// Unclaimed `pending` rows that may be dispatched now.
    pub fn list_pending_due(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE status = 'pending' AND claim_token IS NULL
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY created_at ASC
             LIMIT ?2",
            ATTEMPT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![now.0, limit])
    }

    /// The most recently dispatched attempt still awaiting a reply.
    pub fn latest_awaiting_reply(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE contact_id = ?1 AND status = 'sent'
             ORDER BY last_attempt_at DESC
             LIMIT 1",
            ATTEMPT_COLUMNS
        );
        self.query_one(&sql, rusqlite::params![contact_id.to_string()])
    }

    /// Escalated rows awaiting a human, oldest first.
    pub fn list_escalated(&self, limit: u32) -> Result<Vec<AttemptHistory>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM attempt_history
             WHERE status = 'escalated'
             ORDER BY updated_at ASC
             LIMIT ?1",
            ATTEMPT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![limit])
    }

    /// Claim a pending row for dispatch. Only one claimant can win.
    pub fn claim(&self, id: Uuid, token: Uuid, now: Timestamp) -> Result<bool, OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE attempt_history
                     SET claim_token = ?1, claimed_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = 'pending' AND claim_token IS NULL",
                    rusqlite::params![token.to_string(), now.0, id.to_string()],
                )
                .map_err(|e| OutreachError::Storage(format!("Failed to claim attempt: {}", e)))?;
            Ok(changed == 1)
        })
    }

    /// Release a claim held under `token` without changing status.
    pub fn release_claim(&self, id: Uuid, token: Uuid) -> Result<bool, OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE attempt_history
                     SET claim_token = NULL, claimed_at = NULL
                     WHERE id = ?1 AND claim_token = ?2",
                    rusqlite::params![id.to_string(), token.to_string()],
                )
                .map_err(|e| OutreachError::Storage(format!("Failed to release claim: {}", e)))?;
            Ok(changed == 1)
        })
    }

    /// Release claims taken at or before `cutoff` by workers that never
    /// finished. Returns how many rows were freed.
    pub fn release_stale_claims(&self, cutoff: Timestamp) -> Result<usize, OutreachError> {
        let released = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE attempt_history
                 SET claim_token = NULL, claimed_at = NULL
                 WHERE status = 'pending' AND claim_token IS NOT NULL AND claimed_at <= ?1",
                rusqlite::params![cutoff.0],
            )
            .map_err(|e| OutreachError::Storage(format!("Failed to release stale claims: {}", e)))
        })?;
        if released > 0 {
            warn!(released, "Released stale dispatch claims");
        }
        Ok(released)
    }

    /// Record a confirmed dispatch: `pending -> sent`, incrementing the
    /// attempt count unless the row was a clarification re-ask. Requires the
    /// caller's claim token.
    pub fn mark_sent(
        &self,
        id: Uuid,
        token: Uuid,
        message_id: &str,
        now: Timestamp,
    ) -> Result<bool, OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE attempt_history
                     SET status = 'sent',
                         attempt_count = attempt_count + (1 - clarify_pending),
                         clarify_pending = 0,
                         last_attempt_at = ?1, message_id = ?2, next_attempt_at = NULL,
                         claim_token = NULL, claimed_at = NULL, updated_at = ?1
                     WHERE id = ?3 AND status = 'pending' AND claim_token = ?4",
                    rusqlite::params![now.0, message_id, id.to_string(), token.to_string()],
                )
                .map_err(|e| OutreachError::Storage(format!("Failed to mark sent: {}", e)))?;
            Ok(changed == 1)
        })
    }

    /// Write every mutable field of `attempt` if the stored row is still in
    /// `expected` status. Returns `false` when the row moved underneath us.
    pub fn compare_and_set(
        &self,
        attempt: &AttemptHistory,
        expected: AttemptStatus,
    ) -> Result<bool, OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE attempt_history
                     SET status = ?1, attempt_count = ?2, last_attempt_at = ?3,
                         next_attempt_at = ?4, outcome_name = ?5, response_text = ?6,
                         response_sentiment = ?7, response_intent = ?8, message_id = ?9,
                         claim_token = ?10, claimed_at = ?11, updated_at = ?12,
                         clarify_pending = ?15
                     WHERE id = ?13 AND status = ?14",
                    rusqlite::params![
                        attempt.status.as_str(),
                        attempt.attempt_count,
                        attempt.last_attempt_at.map(|t| t.0),
                        attempt.next_attempt_at.map(|t| t.0),
                        attempt.outcome_name,
                        attempt.response_text,
                        attempt.response_sentiment.map(|s| s.to_string()),
                        attempt.response_intent.map(|i| i.to_string()),
                        attempt.message_id,
                        attempt.claim_token.map(|t| t.to_string()),
                        attempt.claimed_at.map(|t| t.0),
                        attempt.updated_at.0,
                        attempt.id.to_string(),
                        expected.as_str(),
                        attempt.clarify_pending,
                    ],
                )
                .map_err(|e| map_write_err("Failed to advance attempt", e))?;
            Ok(changed == 1)
        })
    }

    /// Number of open attempts across all contacts.
    pub fn count_open(&self) -> Result<u64, OutreachError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT COUNT(*) FROM attempt_history WHERE status IN {}",
                OPEN_STATUS_SQL
            );
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }

    fn query_one<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<AttemptHistory>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let result = stmt
                .query_row(params, |row| Ok(row_to_attempt(row)))
                .optional()
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            match result {
                Some(attempt) => Ok(Some(attempt?)),
                None => Ok(None),
            }
        })
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<AttemptHistory>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_attempt(row)))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut attempts = Vec::new();
            for row in rows {
                let attempt = row.map_err(|e| OutreachError::Storage(e.to_string()))??;
                attempts.push(attempt);
            }
            Ok(attempts)
        })
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, OutreachError> {
    value.parse::<T>().map_err(OutreachError::Storage)
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> Result<AttemptHistory, OutreachError> {
    let get_err = |e: rusqlite::Error| OutreachError::Storage(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let contact_id: String = row.get(1).map_err(get_err)?;
    let status: String = row.get(3).map_err(get_err)?;
    let sentiment: Option<String> = row.get(9).map_err(get_err)?;
    let intent: Option<String> = row.get(10).map_err(get_err)?;
    let method: String = row.get(13).map_err(get_err)?;
    let claim_token: Option<String> = row.get(15).map_err(get_err)?;

    Ok(AttemptHistory {
        id: parse_uuid(&id)?,
        contact_id: parse_uuid(&contact_id)?,
        goal_key: row.get(2).map_err(get_err)?,
        status: parse_column(&status)?,
        attempt_count: row.get(4).map_err(get_err)?,
        last_attempt_at: row.get::<_, Option<i64>>(5).map_err(get_err)?.map(Timestamp),
        next_attempt_at: row.get::<_, Option<i64>>(6).map_err(get_err)?.map(Timestamp),
        outcome_name: row.get(7).map_err(get_err)?,
        response_text: row.get(8).map_err(get_err)?,
        response_sentiment: sentiment.as_deref().map(parse_column).transpose()?,
        response_intent: intent.as_deref().map(parse_column).transpose()?,
        planner_reasoning: row.get(11).map_err(get_err)?,
        planner_score: row.get::<_, f64>(12).map_err(get_err)? as f32,
        decision_method: parse_column(&method)?,
        message_id: row.get(14).map_err(get_err)?,
        claim_token: claim_token.as_deref().map(parse_uuid).transpose()?,
        claimed_at: row.get::<_, Option<i64>>(16).map_err(get_err)?.map(Timestamp),
        created_at: Timestamp(row.get(17).map_err(get_err)?),
        updated_at: Timestamp(row.get(18).map_err(get_err)?),
        clarify_pending: row.get(19).map_err(get_err)?,
    })
}
