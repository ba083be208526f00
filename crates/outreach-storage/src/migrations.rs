//! Database schema migrations.
//!
//! Applies the initial schema: contacts, organizations, activity_signals,
//! insights, goal_catalog, attempt_history, and schema_migrations, then the
//! incremental versions after it.

use rusqlite::Connection;
use tracing::info;

use outreach_core::error::OutreachError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), OutreachError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| OutreachError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| OutreachError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: clarify_pending");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), OutreachError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS organizations (
            id                  TEXT PRIMARY KEY NOT NULL,
            name                TEXT NOT NULL,
            company_type        TEXT,
            lifecycle_stage     TEXT NOT NULL DEFAULT 'prospect'
                                CHECK (lifecycle_stage IN ('prospect', 'evaluating', 'trial',
                                                           'paying', 'churned', 'at_risk')),
            interest_level      TEXT
                                CHECK (interest_level IN ('low', 'medium', 'high', 'very_high')),
            engagement_score    INTEGER NOT NULL DEFAULT 0,
            engagement_reasons  TEXT NOT NULL DEFAULT '[]',
            engagement_level    INTEGER NOT NULL DEFAULT 1
                                CHECK (engagement_level BETWEEN 1 AND 5),
            champion_contact_id TEXT,
            scores_computed_at  INTEGER
        );

        CREATE TABLE IF NOT EXISTS contacts (
            id                   TEXT PRIMARY KEY NOT NULL,
            canonical_key        TEXT NOT NULL UNIQUE,
            identity             TEXT NOT NULL,
            chat_user_id         TEXT,
            email                TEXT,
            display_name         TEXT,
            organization_id      TEXT REFERENCES organizations(id) ON DELETE SET NULL,
            opted_out            INTEGER NOT NULL DEFAULT 0,
            is_paying            INTEGER NOT NULL DEFAULT 0,
            persona              TEXT,
            engagement           INTEGER NOT NULL DEFAULT 0,
            excitement           INTEGER NOT NULL DEFAULT 0,
            lifecycle_stage      TEXT NOT NULL DEFAULT 'new'
                                 CHECK (lifecycle_stage IN ('new', 'active', 'engaged',
                                                            'champion', 'at_risk')),
            score_components     TEXT NOT NULL DEFAULT '{}',
            scores_computed_at   INTEGER,
            last_conversation_at INTEGER,
            last_refusal_at      INTEGER,
            created_at           INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_contacts_staleness
            ON contacts (scores_computed_at ASC);

        CREATE INDEX IF NOT EXISTS idx_contacts_chat_user
            ON contacts (chat_user_id)
            WHERE chat_user_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_contacts_email
            ON contacts (email)
            WHERE email IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_contacts_organization
            ON contacts (organization_id)
            WHERE organization_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS activity_signals (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_id  TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
            kind        TEXT NOT NULL
                        CHECK (kind IN ('chat_message', 'message_opened', 'message_clicked',
                                        'conversation', 'community_activity',
                                        'group_membership', 'event_interest')),
            occurred_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_contact_kind
            ON activity_signals (contact_id, kind, occurred_at DESC);

        CREATE TABLE IF NOT EXISTS insights (
            id          TEXT PRIMARY KEY NOT NULL,
            contact_id  TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
            attribute   TEXT NOT NULL,
            value       TEXT NOT NULL,
            confidence  REAL NOT NULL DEFAULT 1.0,
            source      TEXT NOT NULL
                        CHECK (source IN ('outcome', 'classifier', 'manual', 'import')),
            is_current  INTEGER NOT NULL DEFAULT 1,
            supersedes  TEXT,
            created_at  INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_insights_current
            ON insights (contact_id, attribute)
            WHERE is_current = 1;

        CREATE TABLE IF NOT EXISTS goal_catalog (
            key         TEXT PRIMARY KEY NOT NULL,
            position    INTEGER NOT NULL,
            definition  TEXT NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attempt_history (
            id                 TEXT PRIMARY KEY NOT NULL,
            contact_id         TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
            goal_key           TEXT NOT NULL,
            status             TEXT NOT NULL
                               CHECK (status IN ('pending', 'sent', 'responded', 'deferred',
                                                 'escalated', 'success', 'declined')),
            attempt_count      INTEGER NOT NULL DEFAULT 0,
            last_attempt_at    INTEGER,
            next_attempt_at    INTEGER,
            outcome_name       TEXT,
            response_text      TEXT,
            response_sentiment TEXT,
            response_intent    TEXT,
            planner_reasoning  TEXT NOT NULL DEFAULT '',
            planner_score      REAL NOT NULL DEFAULT 0.0,
            decision_method    TEXT NOT NULL
                               CHECK (decision_method IN ('rule_match', 'heuristic', 'llm')),
            message_id         TEXT,
            claim_token        TEXT,
            claimed_at         INTEGER,
            created_at         INTEGER NOT NULL,
            updated_at         INTEGER NOT NULL
        );

        -- At most one open attempt per (contact, goal).
        CREATE UNIQUE INDEX IF NOT EXISTS idx_attempt_open_pair
            ON attempt_history (contact_id, goal_key)
            WHERE status IN ('pending', 'sent', 'responded', 'deferred', 'escalated');

        CREATE INDEX IF NOT EXISTS idx_attempt_status_last
            ON attempt_history (status, last_attempt_at ASC);

        CREATE INDEX IF NOT EXISTS idx_attempt_status_next
            ON attempt_history (status, next_attempt_at ASC);

        CREATE INDEX IF NOT EXISTS idx_attempt_contact
            ON attempt_history (contact_id, updated_at DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| OutreachError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Version 2: mark pending rows re-entered through a clarification, which
/// are re-asked without spending an attempt.
fn apply_v2(conn: &Connection) -> Result<(), OutreachError> {
    conn.execute_batch(
        "
        ALTER TABLE attempt_history ADD COLUMN clarify_pending INTEGER NOT NULL DEFAULT 0;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'clarify_pending');
        ",
    )
    .map_err(|e| OutreachError::Storage(format!("Failed to apply migration v2: {}", e)))?;

    Ok(())
}
