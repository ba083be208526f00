//! Repository implementations for SQLite-backed persistence.
//!
//! Provides ContactRepository, OrganizationRepository, InsightRepository,
//! SignalRepository, and GoalRepository that operate on the Database struct
//! using raw SQL.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use tracing::debug;
use uuid::Uuid;

use outreach_core::error::OutreachError;
use outreach_core::goal::Goal;
use outreach_core::types::{
    ActivitySignals, Contact, EngagementComponents, Identity, Insight, InsightSource,
    InterestLevel, LifecycleStage, OrgLifecycleStage, OrgSignals, Organization, ScoreSnapshot,
    SignalKind, Timestamp,
};

use crate::db::{map_write_err, Database};

const CONTACT_COLUMNS: &str = "id, identity, display_name, organization_id, opted_out, is_paying,
     persona, engagement, excitement, lifecycle_stage, score_components, scores_computed_at,
     last_conversation_at, last_refusal_at, created_at";

const ORG_COLUMNS: &str = "id, name, company_type, lifecycle_stage, interest_level,
     engagement_score, engagement_reasons, engagement_level, champion_contact_id,
     scores_computed_at";

const INSIGHT_COLUMNS: &str =
    "id, contact_id, attribute, value, confidence, source, is_current, supersedes, created_at";

/// Open statuses as a SQL list, kept in step with `AttemptStatus::OPEN`.
pub(crate) const OPEN_STATUS_SQL: &str =
    "('pending', 'sent', 'responded', 'deferred', 'escalated')";

// =============================================================================
// ContactRepository
// =============================================================================

/// Repository for contacts and their identity envelope.
pub struct ContactRepository {
    db: Arc<Database>,
}

impl ContactRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a new contact. Fails with `Conflict` if its canonical key exists.
    pub fn insert(&self, contact: &Contact) -> Result<(), OutreachError> {
        let identity = serde_json::to_string(&contact.identity)?;
        let components = serde_json::to_string(&contact.scores.components)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (id, canonical_key, identity, chat_user_id, email,
                                       display_name, organization_id, opted_out, is_paying,
                                       persona, engagement, excitement, lifecycle_stage,
                                       score_components, scores_computed_at,
                                       last_conversation_at, last_refusal_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18)",
                rusqlite::params![
                    contact.id.to_string(),
                    contact.identity.canonical_key(),
                    identity,
                    contact.identity.chat_user_id(),
                    contact.identity.email().map(|e| e.trim().to_lowercase()),
                    contact.display_name,
                    contact.organization_id.map(|id| id.to_string()),
                    contact.opted_out as i32,
                    contact.is_paying as i32,
                    contact.persona,
                    contact.scores.engagement,
                    contact.scores.excitement,
                    contact.scores.lifecycle_stage.as_str(),
                    components,
                    contact.scores.computed_at.map(|t| t.0),
                    contact.last_conversation_at.map(|t| t.0),
                    contact.last_refusal_at.map(|t| t.0),
                    contact.created_at.0,
                ],
            )
            .map_err(|e| map_write_err("Failed to insert contact", e))?;
            Ok(())
        })
    }

    /// Find a contact by ID.
    pub fn get(&self, id: Uuid) -> Result<Option<Contact>, OutreachError> {
        let sql = format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLUMNS);
        self.query_one(&sql, rusqlite::params![id.to_string()])
    }

    /// Find a contact by ID, failing with `NotFound` when absent.
    pub fn require(&self, id: Uuid) -> Result<Contact, OutreachError> {
        self.get(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("contact {}", id)))
    }

    /// Resolve an observed identity to an existing contact.
    ///
    /// Matches the canonical key first, then any known chat handle, then the
    /// normalized email, so a chat user who later links an account still maps
    /// to the same row.
    pub fn resolve(&self, identity: &Identity) -> Result<Option<Contact>, OutreachError> {
        let by_key = format!("SELECT {} FROM contacts WHERE canonical_key = ?1", CONTACT_COLUMNS);
        if let Some(contact) =
            self.query_one(&by_key, rusqlite::params![identity.canonical_key()])?
        {
            return Ok(Some(contact));
        }

        if let Some(chat_user_id) = identity.chat_user_id() {
            let sql = format!(
                "SELECT {} FROM contacts WHERE chat_user_id = ?1 ORDER BY created_at ASC LIMIT 1",
                CONTACT_COLUMNS
            );
            if let Some(contact) = self.query_one(&sql, rusqlite::params![chat_user_id])? {
                return Ok(Some(contact));
            }
        }

        if let Some(email) = identity.email() {
            let sql = format!(
                "SELECT {} FROM contacts WHERE email = ?1 ORDER BY created_at ASC LIMIT 1",
                CONTACT_COLUMNS
            );
            let normalized = email.trim().to_lowercase();
            if let Some(contact) = self.query_one(&sql, rusqlite::params![normalized])? {
                return Ok(Some(contact));
            }
        }

        Ok(None)
    }

    /// Resolve an identity, creating the contact on first sight.
    pub fn resolve_or_create(
        &self,
        identity: &Identity,
        display_name: Option<&str>,
    ) -> Result<Contact, OutreachError> {
        if let Some(existing) = self.resolve(identity)? {
            return Ok(existing);
        }

        let mut contact = Contact::new(identity.clone());
        contact.display_name = display_name.map(str::to_string);
        match self.insert(&contact) {
            Ok(()) => {
                debug!(contact_id = %contact.id, key = %identity.canonical_key(), "Created contact");
                Ok(contact)
            }
            // Another worker created it between our read and insert.
            Err(OutreachError::Conflict(_)) => self.resolve(identity)?.ok_or_else(|| {
                OutreachError::NotFound(format!("contact {}", identity.canonical_key()))
            }),
            Err(e) => Err(e),
        }
    }

    /// Attach an account to a contact, rewriting its canonical key.
    pub fn link_account(&self, id: Uuid, account_id: &str) -> Result<Contact, OutreachError> {
        let mut contact = self.require(id)?;
        contact.identity = contact.identity.link_account(account_id);
        let identity = serde_json::to_string(&contact.identity)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE contacts SET identity = ?1, canonical_key = ?2 WHERE id = ?3",
                rusqlite::params![identity, contact.identity.canonical_key(), id.to_string()],
            )
            .map_err(|e| map_write_err("Failed to link account", e))?;
            Ok(())
        })?;
        Ok(contact)
    }

    pub fn set_opted_out(&self, id: Uuid, opted_out: bool) -> Result<(), OutreachError> {
        self.update_column(id, "UPDATE contacts SET opted_out = ?1 WHERE id = ?2", opted_out as i32)
    }

    pub fn set_paying(&self, id: Uuid, is_paying: bool) -> Result<(), OutreachError> {
        self.update_column(id, "UPDATE contacts SET is_paying = ?1 WHERE id = ?2", is_paying as i32)
    }

    pub fn set_persona(&self, id: Uuid, persona: Option<&str>) -> Result<(), OutreachError> {
        self.update_column(id, "UPDATE contacts SET persona = ?1 WHERE id = ?2", persona)
    }

    pub fn set_display_name(&self, id: Uuid, name: &str) -> Result<(), OutreachError> {
        self.update_column(id, "UPDATE contacts SET display_name = ?1 WHERE id = ?2", name)
    }

    pub fn set_organization(&self, id: Uuid, org_id: Option<Uuid>) -> Result<(), OutreachError> {
        self.update_column(
            id,
            "UPDATE contacts SET organization_id = ?1 WHERE id = ?2",
            org_id.map(|o| o.to_string()),
        )
    }

    /// Remember when the contact last refused outreach.
    pub fn record_refusal(&self, id: Uuid, at: Timestamp) -> Result<(), OutreachError> {
        self.update_column(id, "UPDATE contacts SET last_refusal_at = ?1 WHERE id = ?2", at.0)
    }

    /// Remember when the contact last held a conversation with us.
    pub fn record_conversation(&self, id: Uuid, at: Timestamp) -> Result<(), OutreachError> {
        self.update_column(
            id,
            "UPDATE contacts SET last_conversation_at = ?1 WHERE id = ?2",
            at.0,
        )
    }

    /// Persist a freshly computed score snapshot.
    pub fn update_scores(&self, id: Uuid, scores: &ScoreSnapshot) -> Result<(), OutreachError> {
        let components = serde_json::to_string(&scores.components)?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE contacts
                     SET engagement = ?1, excitement = ?2, lifecycle_stage = ?3,
                         score_components = ?4, scores_computed_at = ?5
                     WHERE id = ?6",
                    rusqlite::params![
                        scores.engagement,
                        scores.excitement,
                        scores.lifecycle_stage.as_str(),
                        components,
                        scores.computed_at.map(|t| t.0),
                        id.to_string(),
                    ],
                )
                .map_err(|e| OutreachError::Storage(format!("Failed to update scores: {}", e)))?;
            if changed == 0 {
                return Err(OutreachError::NotFound(format!("contact {}", id)));
            }
            Ok(())
        })
    }

    /// Contacts whose scores were never computed or are older than `cutoff`,
    /// never-computed first, then oldest first.
    pub fn list_stale(&self, cutoff: Timestamp, limit: u32) -> Result<Vec<Contact>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM contacts
             WHERE scores_computed_at IS NULL OR scores_computed_at < ?1
             ORDER BY scores_computed_at IS NOT NULL, scores_computed_at ASC, created_at ASC
             LIMIT ?2",
            CONTACT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![cutoff.0, limit])
    }

    /// Contacts that may be planned for: not opted out, no refusal since
    /// `refused_before`, and no open attempt. Highest combined score first.
    pub fn list_plannable(
        &self,
        refused_before: Timestamp,
        limit: u32,
    ) -> Result<Vec<Contact>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM contacts c
             WHERE c.opted_out = 0
               AND (c.last_refusal_at IS NULL OR c.last_refusal_at < ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM attempt_history a
                   WHERE a.contact_id = c.id AND a.status IN {}
               )
             ORDER BY (c.engagement + c.excitement) DESC, c.created_at ASC
             LIMIT ?2",
            CONTACT_COLUMNS, OPEN_STATUS_SQL
        );
        self.query_many(&sql, rusqlite::params![refused_before.0, limit])
    }

    /// Members of an organization, earliest created first.
    pub fn list_by_organization(&self, org_id: Uuid) -> Result<Vec<Contact>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM contacts WHERE organization_id = ?1 ORDER BY created_at ASC, id ASC",
            CONTACT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![org_id.to_string()])
    }

    pub fn count(&self) -> Result<u64, OutreachError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }

    fn update_column<P: rusqlite::ToSql>(
        &self,
        id: Uuid,
        sql: &str,
        value: P,
    ) -> Result<(), OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(sql, rusqlite::params![value, id.to_string()])
                .map_err(|e| OutreachError::Storage(format!("Failed to update contact: {}", e)))?;
            if changed == 0 {
                return Err(OutreachError::NotFound(format!("contact {}", id)));
            }
            Ok(())
        })
    }

    fn query_one<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<Contact>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let result = stmt
                .query_row(params, |row| Ok(row_to_contact(row)))
                .optional()
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            match result {
                Some(contact) => Ok(Some(contact?)),
                None => Ok(None),
            }
        })
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Contact>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_contact(row)))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut contacts = Vec::new();
            for row in rows {
                let contact = row.map_err(|e| OutreachError::Storage(e.to_string()))??;
                contacts.push(contact);
            }
            Ok(contacts)
        })
    }
}

// =============================================================================
// OrganizationRepository
// =============================================================================

/// Repository for organizations and their member-derived signals.
pub struct OrganizationRepository {
    db: Arc<Database>,
}

impl OrganizationRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, org: &Organization) -> Result<(), OutreachError> {
        let reasons = serde_json::to_string(&org.engagement_reasons)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO organizations (id, name, company_type, lifecycle_stage,
                                            interest_level, engagement_score, engagement_reasons,
                                            engagement_level, champion_contact_id,
                                            scores_computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    org.id.to_string(),
                    org.name,
                    org.company_type,
                    org.lifecycle_stage.as_str(),
                    org.interest_level.map(|l| l.as_str()),
                    org.engagement_score,
                    reasons,
                    org.engagement_level,
                    org.champion_contact_id.map(|id| id.to_string()),
                    org.scores_computed_at.map(|t| t.0),
                ],
            )
            .map_err(|e| map_write_err("Failed to insert organization", e))?;
            Ok(())
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Organization>, OutreachError> {
        let sql = format!("SELECT {} FROM organizations WHERE id = ?1", ORG_COLUMNS);
        let mut orgs = self.query_many(&sql, rusqlite::params![id.to_string()])?;
        Ok(orgs.pop())
    }

    /// All organizations ordered by tier, then score.
    pub fn list(&self, limit: u32) -> Result<Vec<Organization>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM organizations
             ORDER BY engagement_level DESC, engagement_score DESC, name ASC
             LIMIT ?1",
            ORG_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![limit])
    }

    /// Organizations whose engagement was never computed or is older than
    /// `cutoff`, never-computed first.
    pub fn list_stale(
        &self,
        cutoff: Timestamp,
        limit: u32,
    ) -> Result<Vec<Organization>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM organizations
             WHERE scores_computed_at IS NULL OR scores_computed_at < ?1
             ORDER BY scores_computed_at IS NOT NULL, scores_computed_at ASC
             LIMIT ?2",
            ORG_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![cutoff.0, limit])
    }

    /// Persist score, reasons, tier, and champion from one computation.
    pub fn update_engagement(
        &self,
        id: Uuid,
        score: u8,
        reasons: &[String],
        level: u8,
        champion: Option<Uuid>,
        computed_at: Timestamp,
    ) -> Result<(), OutreachError> {
        let reasons = serde_json::to_string(reasons)?;
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE organizations
                     SET engagement_score = ?1, engagement_reasons = ?2, engagement_level = ?3,
                         champion_contact_id = ?4, scores_computed_at = ?5
                     WHERE id = ?6",
                    rusqlite::params![
                        score,
                        reasons,
                        level,
                        champion.map(|c| c.to_string()),
                        computed_at.0,
                        id.to_string(),
                    ],
                )
                .map_err(|e| {
                    OutreachError::Storage(format!("Failed to update organization: {}", e))
                })?;
            if changed == 0 {
                return Err(OutreachError::NotFound(format!("organization {}", id)));
            }
            Ok(())
        })
    }

    pub fn set_interest_level(
        &self,
        id: Uuid,
        level: Option<InterestLevel>,
    ) -> Result<(), OutreachError> {
        self.update_column(
            id,
            "UPDATE organizations SET interest_level = ?1 WHERE id = ?2",
            level.map(|l| l.as_str()),
        )
    }

    pub fn set_lifecycle_stage(
        &self,
        id: Uuid,
        stage: OrgLifecycleStage,
    ) -> Result<(), OutreachError> {
        self.update_column(
            id,
            "UPDATE organizations SET lifecycle_stage = ?1 WHERE id = ?2",
            stage.as_str(),
        )
    }

    /// Windowed counts over the organization's members.
    pub fn signals(&self, id: Uuid, since: Timestamp) -> Result<OrgSignals, OutreachError> {
        let org = self
            .get(id)?
            .ok_or_else(|| OutreachError::NotFound(format!("organization {}", id)))?;

        self.db.with_conn(|conn| {
            let (chat_users, team_members): (i64, i64) = conn
                .query_row(
                    "SELECT
                         COALESCE(SUM(CASE WHEN chat_user_id IS NOT NULL THEN 1 ELSE 0 END), 0),
                         COALESCE(SUM(CASE WHEN canonical_key LIKE 'account:%' THEN 1 ELSE 0 END), 0)
                     FROM contacts WHERE organization_id = ?1",
                    rusqlite::params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT s.kind, COUNT(*)
                     FROM activity_signals s
                     JOIN contacts c ON c.id = s.contact_id
                     WHERE c.organization_id = ?1 AND s.occurred_at >= ?2
                     GROUP BY s.kind",
                )
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![id.to_string(), since.0], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut signals = OrgSignals {
                chat_users: chat_users as u32,
                team_members: team_members as u32,
                interest_level: org.interest_level,
                lifecycle_stage: org.lifecycle_stage,
                ..OrgSignals::default()
            };
            for row in rows {
                let (kind, count) = row.map_err(|e| OutreachError::Storage(e.to_string()))?;
                let count = count as u32;
                match SignalKind::parse(&kind) {
                    Some(SignalKind::GroupMembership) => signals.group_memberships += count,
                    Some(SignalKind::CommunityActivity) | Some(SignalKind::Conversation) => {
                        signals.recent_activities += count
                    }
                    Some(SignalKind::MessageOpened) | Some(SignalKind::MessageClicked) => {
                        signals.message_engagement += count
                    }
                    Some(SignalKind::EventInterest) => signals.event_interest += count,
                    Some(SignalKind::ChatMessage) | None => {}
                }
            }
            Ok(signals)
        })
    }

    fn update_column<P: rusqlite::ToSql>(
        &self,
        id: Uuid,
        sql: &str,
        value: P,
    ) -> Result<(), OutreachError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(sql, rusqlite::params![value, id.to_string()])
                .map_err(|e| {
                    OutreachError::Storage(format!("Failed to update organization: {}", e))
                })?;
            if changed == 0 {
                return Err(OutreachError::NotFound(format!("organization {}", id)));
            }
            Ok(())
        })
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Organization>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_organization(row)))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut orgs = Vec::new();
            for row in rows {
                let org = row.map_err(|e| OutreachError::Storage(e.to_string()))??;
                orgs.push(org);
            }
            Ok(orgs)
        })
    }
}

// =============================================================================
// InsightRepository
// =============================================================================

/// Repository for versioned contact insights.
pub struct InsightRepository {
    db: Arc<Database>,
}

impl InsightRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an insight, superseding the current one for the same attribute.
    ///
    /// Returns the stored insight with its `supersedes` pointer filled in.
    pub fn record(&self, insight: &Insight) -> Result<Insight, OutreachError> {
        let mut stored = insight.clone();
        stored.is_current = true;

        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| OutreachError::Storage(format!("Failed to begin: {}", e)))?;

            let previous: Option<String> = tx
                .query_row(
                    "SELECT id FROM insights
                     WHERE contact_id = ?1 AND attribute = ?2 AND is_current = 1",
                    rusqlite::params![stored.contact_id.to_string(), stored.attribute],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            if let Some(prev) = &previous {
                tx.execute(
                    "UPDATE insights SET is_current = 0 WHERE id = ?1",
                    rusqlite::params![prev],
                )
                .map_err(|e| OutreachError::Storage(format!("Failed to supersede insight: {}", e)))?;
                stored.supersedes = Some(parse_uuid(prev)?);
            }

            tx.execute(
                "INSERT INTO insights (id, contact_id, attribute, value, confidence, source,
                                       is_current, supersedes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
                rusqlite::params![
                    stored.id.to_string(),
                    stored.contact_id.to_string(),
                    stored.attribute,
                    stored.value,
                    stored.confidence as f64,
                    stored.source.as_str(),
                    stored.supersedes.map(|s| s.to_string()),
                    stored.created_at.0,
                ],
            )
            .map_err(|e| map_write_err("Failed to insert insight", e))?;

            tx.commit()
                .map_err(|e| OutreachError::Storage(format!("Failed to commit insight: {}", e)))?;
            Ok(())
        })?;

        debug!(
            contact_id = %stored.contact_id,
            attribute = %stored.attribute,
            value = %stored.value,
            "Recorded insight"
        );
        Ok(stored)
    }

    /// Current insights for a contact, by attribute.
    pub fn current_for_contact(&self, contact_id: Uuid) -> Result<Vec<Insight>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM insights
             WHERE contact_id = ?1 AND is_current = 1
             ORDER BY attribute ASC",
            INSIGHT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![contact_id.to_string()])
    }

    /// Every version of one attribute, newest first.
    pub fn history(&self, contact_id: Uuid, attribute: &str) -> Result<Vec<Insight>, OutreachError> {
        let sql = format!(
            "SELECT {} FROM insights
             WHERE contact_id = ?1 AND attribute = ?2
             ORDER BY is_current DESC, created_at DESC, rowid DESC",
            INSIGHT_COLUMNS
        );
        self.query_many(&sql, rusqlite::params![contact_id.to_string(), attribute])
    }

    fn query_many<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Insight>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_insight(row)))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut insights = Vec::new();
            for row in rows {
                let insight = row.map_err(|e| OutreachError::Storage(e.to_string()))??;
                insights.push(insight);
            }
            Ok(insights)
        })
    }
}

// =============================================================================
// SignalRepository
// =============================================================================

/// Repository for raw activity signals.
pub struct SignalRepository {
    db: Arc<Database>,
}

impl SignalRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record one activity observation.
    pub fn record(
        &self,
        contact_id: Uuid,
        kind: SignalKind,
        occurred_at: Timestamp,
    ) -> Result<(), OutreachError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_signals (contact_id, kind, occurred_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![contact_id.to_string(), kind.as_str(), occurred_at.0],
            )
            .map_err(|e| map_write_err("Failed to record signal", e))?;
            Ok(())
        })
    }

    /// Windowed activity counts for a contact since `since`.
    pub fn activity(
        &self,
        contact_id: Uuid,
        since: Timestamp,
    ) -> Result<ActivitySignals, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT kind, COUNT(*), COUNT(DISTINCT occurred_at / 86400)
                     FROM activity_signals
                     WHERE contact_id = ?1 AND occurred_at >= ?2
                     GROUP BY kind",
                )
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(rusqlite::params![contact_id.to_string(), since.0], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut signals = ActivitySignals::default();
            for row in rows {
                let (kind, count, days) =
                    row.map_err(|e| OutreachError::Storage(e.to_string()))?;
                let count = count as u32;
                match SignalKind::parse(&kind) {
                    Some(SignalKind::ChatMessage) => {
                        signals.chat_messages = count;
                        signals.chat_active_days = days as u32;
                    }
                    Some(SignalKind::MessageOpened) => signals.messages_opened = count,
                    Some(SignalKind::MessageClicked) => signals.messages_clicked = count,
                    Some(SignalKind::Conversation) => signals.conversations = count,
                    Some(SignalKind::CommunityActivity) => signals.community_activities = count,
                    Some(SignalKind::GroupMembership) | Some(SignalKind::EventInterest) | None => {}
                }
            }
            Ok(signals)
        })
    }
}

// =============================================================================
// GoalRepository
// =============================================================================

/// Stored goal catalog. Validation happens before anything reaches here.
pub struct GoalRepository {
    db: Arc<Database>,
}

impl GoalRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Replace the whole catalog atomically, preserving declaration order.
    pub fn replace_catalog(&self, goals: &[Goal]) -> Result<(), OutreachError> {
        let now = Timestamp::now();
        let mut encoded = Vec::with_capacity(goals.len());
        for goal in goals {
            encoded.push((goal.key.clone(), serde_json::to_string(goal)?));
        }

        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| OutreachError::Storage(format!("Failed to begin: {}", e)))?;
            tx.execute("DELETE FROM goal_catalog", [])
                .map_err(|e| OutreachError::Storage(format!("Failed to clear catalog: {}", e)))?;
            for (position, (key, definition)) in encoded.iter().enumerate() {
                tx.execute(
                    "INSERT INTO goal_catalog (key, position, definition, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![key, position as i64, definition, now.0],
                )
                .map_err(|e| map_write_err("Failed to store goal", e))?;
            }
            tx.commit()
                .map_err(|e| OutreachError::Storage(format!("Failed to commit catalog: {}", e)))?;
            Ok(())
        })
    }

    /// Load the stored catalog in declaration order. Empty if never saved.
    pub fn load_catalog(&self) -> Result<Vec<Goal>, OutreachError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT definition FROM goal_catalog ORDER BY position ASC")
                .map_err(|e| OutreachError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| OutreachError::Storage(e.to_string()))?;

            let mut goals = Vec::new();
            for row in rows {
                let definition = row.map_err(|e| OutreachError::Storage(e.to_string()))?;
                goals.push(serde_json::from_str(&definition)?);
            }
            Ok(goals)
        })
    }
}

// =============================================================================
// Row mapping helpers
// =============================================================================

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, OutreachError> {
    Uuid::parse_str(s).map_err(|e| OutreachError::Storage(format!("Invalid UUID '{}': {}", s, e)))
}

fn opt_uuid(s: Option<String>) -> Result<Option<Uuid>, OutreachError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> Result<Contact, OutreachError> {
    let get_err = |e: rusqlite::Error| OutreachError::Storage(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let identity: String = row.get(1).map_err(get_err)?;
    let organization_id: Option<String> = row.get(3).map_err(get_err)?;
    let stage: String = row.get(9).map_err(get_err)?;
    let components: String = row.get(10).map_err(get_err)?;
    let components: EngagementComponents = serde_json::from_str(&components).unwrap_or_default();

    Ok(Contact {
        id: parse_uuid(&id)?,
        identity: serde_json::from_str(&identity)?,
        display_name: row.get(2).map_err(get_err)?,
        organization_id: opt_uuid(organization_id)?,
        opted_out: row.get::<_, i32>(4).map_err(get_err)? != 0,
        is_paying: row.get::<_, i32>(5).map_err(get_err)? != 0,
        persona: row.get(6).map_err(get_err)?,
        scores: ScoreSnapshot {
            engagement: row.get(7).map_err(get_err)?,
            excitement: row.get(8).map_err(get_err)?,
            lifecycle_stage: LifecycleStage::parse(&stage).unwrap_or_default(),
            components,
            computed_at: row.get::<_, Option<i64>>(11).map_err(get_err)?.map(Timestamp),
        },
        last_conversation_at: row.get::<_, Option<i64>>(12).map_err(get_err)?.map(Timestamp),
        last_refusal_at: row.get::<_, Option<i64>>(13).map_err(get_err)?.map(Timestamp),
        created_at: Timestamp(row.get(14).map_err(get_err)?),
    })
}

fn row_to_organization(row: &rusqlite::Row<'_>) -> Result<Organization, OutreachError> {
    let get_err = |e: rusqlite::Error| OutreachError::Storage(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let stage: String = row.get(3).map_err(get_err)?;
    let interest: Option<String> = row.get(4).map_err(get_err)?;
    let reasons: String = row.get(6).map_err(get_err)?;
    let champion: Option<String> = row.get(8).map_err(get_err)?;

    Ok(Organization {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(get_err)?,
        company_type: row.get(2).map_err(get_err)?,
        lifecycle_stage: OrgLifecycleStage::parse(&stage).unwrap_or_default(),
        interest_level: interest.as_deref().and_then(InterestLevel::parse),
        engagement_score: row.get(5).map_err(get_err)?,
        engagement_reasons: serde_json::from_str(&reasons)?,
        engagement_level: row.get(7).map_err(get_err)?,
        champion_contact_id: opt_uuid(champion)?,
        scores_computed_at: row.get::<_, Option<i64>>(9).map_err(get_err)?.map(Timestamp),
    })
}

fn row_to_insight(row: &rusqlite::Row<'_>) -> Result<Insight, OutreachError> {
    let get_err = |e: rusqlite::Error| OutreachError::Storage(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let contact_id: String = row.get(1).map_err(get_err)?;
    let source: String = row.get(5).map_err(get_err)?;
    let supersedes: Option<String> = row.get(7).map_err(get_err)?;

    Ok(Insight {
        id: parse_uuid(&id)?,
        contact_id: parse_uuid(&contact_id)?,
        attribute: row.get(2).map_err(get_err)?,
        value: row.get(3).map_err(get_err)?,
        confidence: row.get::<_, f64>(4).map_err(get_err)? as f32,
        source: InsightSource::parse(&source)
            .ok_or_else(|| OutreachError::Storage(format!("Unknown insight source: {}", source)))?,
        is_current: row.get::<_, i32>(6).map_err(get_err)? != 0,
        supersedes: opt_uuid(supersedes)?,
        created_at: Timestamp(row.get(8).map_err(get_err)?),
    })
}
