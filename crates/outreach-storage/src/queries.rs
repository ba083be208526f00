//! Read-only reporting projections over the attempt ledger.

use std::sync::Arc;

use serde::Serialize;

use outreach_core::error::OutreachError;

use crate::db::Database;

/// Attempt counts and rates for one goal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalStats {
    pub goal_key: String,
    pub total: u64,
    /// Attempts that were actually delivered at least once.
    pub dispatched: u64,
    pub responded: u64,
    pub success: u64,
    pub declined: u64,
    pub open: u64,
    /// `responded / dispatched`, 0 when nothing was dispatched.
    pub response_rate: f64,
    /// `success / dispatched`, 0 when nothing was dispatched.
    pub success_rate: f64,
}

/// Contact population by lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCount {
    pub stage: String,
    pub contacts: u64,
}

/// Reporting service for operators.
pub struct ReportService {
    db: Arc<Database>,
}

impl ReportService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Per-goal attempt counts, response rate, and success rate.
    pub fn goal_stats(&self) -> Result<Vec<GoalStats>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT goal_key,
                            COUNT(*),
                            SUM(CASE WHEN attempt_count > 0 THEN 1 ELSE 0 END),
                            SUM(CASE WHEN response_text IS NOT NULL THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status = 'declined' THEN 1 ELSE 0 END),
                            SUM(CASE WHEN status NOT IN ('success', 'declined') THEN 1 ELSE 0 END)
                     FROM attempt_history
                     GROUP BY goal_key
                     ORDER BY goal_key ASC",
                )
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    let count = |idx: usize| -> rusqlite::Result<u64> {
                        Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0) as u64)
                    };
                    let dispatched = count(2)?;
                    let responded = count(3)?;
                    let success = count(4)?;
                    Ok(GoalStats {
                        goal_key: row.get(0)?,
                        total: count(1)?,
                        dispatched,
                        responded,
                        success,
                        declined: count(5)?,
                        open: count(6)?,
                        response_rate: rate(responded, dispatched),
                        success_rate: rate(success, dispatched),
                    })
                })
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut stats = Vec::new();
            for row in rows {
                stats.push(row.map_err(|e| OutreachError::Storage(e.to_string()))?);
            }
            Ok(stats)
        })
    }

    /// Contacts per lifecycle stage.
    pub fn lifecycle_distribution(&self) -> Result<Vec<StageCount>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT lifecycle_stage, COUNT(*) FROM contacts
                     GROUP BY lifecycle_stage
                     ORDER BY COUNT(*) DESC, lifecycle_stage ASC",
                )
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StageCount {
                        stage: row.get(0)?,
                        contacts: row.get::<_, i64>(1)? as u64,
                    })
                })
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut counts = Vec::new();
            for row in rows {
                counts.push(row.map_err(|e| OutreachError::Storage(e.to_string()))?);
            }
            Ok(counts)
        })
    }
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
