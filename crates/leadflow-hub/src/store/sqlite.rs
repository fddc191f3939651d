//! SQLite-backed lead repository.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use leadflow_core::activity::{FollowUpTask, LeadActivity};
use leadflow_core::agent::{Agent, AgentFilter, AgentId, PerformanceMetric};
use leadflow_core::assignment::{Assignment, AssignmentId, AssignmentRequest};
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::lead::{
    Lead, LeadId, LeadProfile, LeadSource, LeadStatus, PropertyInterest, StatusChange,
};
use leadflow_core::repository::{LeadChange, LeadRepository, LeadUpdateOutcome};
use leadflow_core::scoring::{self, ScoringRule};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS leads (
    lead_id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT NOT NULL,
    nationality TEXT,
    language_preference TEXT,
    budget_min INTEGER,
    budget_max INTEGER,
    property_type TEXT,
    preferred_areas TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'new',
    lead_score INTEGER NOT NULL DEFAULT 0 CHECK (lead_score BETWEEN 0 AND 100),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_leads_phone ON leads(phone);
CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(email);

CREATE TABLE IF NOT EXISTS lead_sources (
    source_id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    source_type TEXT NOT NULL,
    campaign_id TEXT,
    referrer_agent_id TEXT,
    property_id TEXT,
    utm_source TEXT,
    utm_medium TEXT,
    utm_campaign TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    agent_id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT NOT NULL,
    language TEXT,
    specialization TEXT NOT NULL DEFAULT '[]',
    preferred_areas TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lead_assignments (
    assignment_id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    agent_id TEXT NOT NULL REFERENCES agents(agent_id),
    assigned_at TEXT NOT NULL,
    reason TEXT,
    superseded INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_assignments_agent ON lead_assignments(agent_id, superseded);
CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_one_active
    ON lead_assignments(lead_id) WHERE superseded = 0;

CREATE TABLE IF NOT EXISTS lead_activities (
    activity_id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    agent_id TEXT,
    activity_type TEXT NOT NULL,
    notes TEXT,
    outcome TEXT,
    created_at TEXT NOT NULL,
    next_follow_up TEXT
);
CREATE INDEX IF NOT EXISTS idx_activities_lead ON lead_activities(lead_id, created_at);

CREATE TABLE IF NOT EXISTS follow_up_tasks (
    task_id TEXT PRIMARY KEY,
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    agent_id TEXT,
    task_type TEXT NOT NULL,
    due_date TEXT NOT NULL,
    priority TEXT NOT NULL,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS lead_property_interests (
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    property_id TEXT NOT NULL,
    interest_level TEXT NOT NULL,
    PRIMARY KEY (lead_id, property_id)
);

CREATE TABLE IF NOT EXISTS lead_status_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lead_id TEXT NOT NULL REFERENCES leads(lead_id) ON DELETE CASCADE,
    previous_status TEXT NOT NULL,
    new_status TEXT NOT NULL,
    notes TEXT,
    changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_performance_metrics (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    total_active_leads INTEGER NOT NULL DEFAULT 0,
    conversions INTEGER NOT NULL DEFAULT 0,
    conversion_rate REAL,
    PRIMARY KEY (agent_id, date)
);

CREATE TABLE IF NOT EXISTS scoring_rules (
    rule_id TEXT PRIMARY KEY,
    rule_name TEXT NOT NULL,
    criterion TEXT NOT NULL,
    score_delta INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
";

const LEAD_COLUMNS: &str = "lead_id, source_type, first_name, last_name, email, phone, \
     nationality, language_preference, budget_min, budget_max, property_type, \
     preferred_areas, status, lead_score, created_at, updated_at";

const AGENT_COLUMNS: &str =
    "agent_id, full_name, email, phone, language, specialization, preferred_areas, is_active, created_at";

const ASSIGNMENT_COLUMNS: &str = "assignment_id, lead_id, agent_id, assigned_at, superseded, reason";

const ACTIVE_COUNT_SQL: &str = "SELECT COUNT(*) FROM lead_assignments la
     JOIN leads l ON l.lead_id = la.lead_id
     WHERE la.agent_id = ?1 AND la.superseded = 0
       AND l.status NOT IN ('converted', 'lost')";

/// SQLite lead repository: a single connection behind a mutex.
///
/// Multi-row writes run inside `BEGIN IMMEDIATE` transactions, so a failure
/// rolls back every statement of the operation.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open or create a SQLite database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| LeadFlowError::Repository(format!("SQLite open error: {}", e)))?;
        Self::init(conn)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LeadFlowError::Repository(format!("SQLite error: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| LeadFlowError::Repository(format!("SQLite init error: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LeadFlowError::Repository("SQLite connection lock poisoned".to_string()))
    }
}

// ─── Column helpers ────────────────────────────────────────

fn db_err(e: rusqlite::Error) -> LeadFlowError {
    LeadFlowError::Repository(e.to_string())
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion(idx, e))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn col_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    parse_uuid(idx, &s)
}

fn col_opt_uuid(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_uuid(idx, &s)).transpose()
}

fn col_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(idx, &s)
}

fn col_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn col_enum<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = LeadFlowError>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion(idx, e))
}

fn col_opt_enum<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = LeadFlowError>,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse().map_err(|e| conversion(idx, e)))
        .transpose()
}

fn col_json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion(idx, e))
}

// ─── Row mapping ───────────────────────────────────────────

fn lead_from_row(row: &Row) -> rusqlite::Result<Lead> {
    Ok(Lead {
        lead_id: col_uuid(row, 0)?,
        source_type: col_enum(row, 1)?,
        profile: LeadProfile {
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
            phone: row.get(5)?,
            nationality: row.get(6)?,
            language_preference: row.get(7)?,
            budget_min: row.get(8)?,
            budget_max: row.get(9)?,
            property_type: col_opt_enum(row, 10)?,
            preferred_areas: col_json(row, 11)?,
        },
        status: col_enum(row, 12)?,
        score: row.get(13)?,
        created_at: col_ts(row, 14)?,
        updated_at: col_ts(row, 15)?,
    })
}

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        agent_id: col_uuid(row, 0)?,
        full_name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        language: row.get(4)?,
        specialization: col_json(row, 5)?,
        preferred_areas: col_json(row, 6)?,
        is_active: row.get(7)?,
        created_at: col_ts(row, 8)?,
    })
}

fn assignment_from_row(row: &Row) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        assignment_id: col_uuid(row, 0)?,
        lead_id: col_uuid(row, 1)?,
        agent_id: col_uuid(row, 2)?,
        assigned_at: col_ts(row, 3)?,
        superseded: row.get(4)?,
        reason: row.get(5)?,
    })
}

fn rule_from_row(row: &Row) -> rusqlite::Result<ScoringRule> {
    Ok(ScoringRule {
        rule_id: col_uuid(row, 0)?,
        rule_name: row.get(1)?,
        criterion: col_json(row, 2)?,
        score_delta: row.get(3)?,
        is_active: row.get(4)?,
        created_at: col_ts(row, 5)?,
    })
}

// ─── Statements shared by transactional methods ────────────

fn active_count(conn: &Connection, agent_id: AgentId) -> Result<u32> {
    conn.query_row(ACTIVE_COUNT_SQL, params![agent_id.to_string()], |row| row.get(0))
        .map_err(db_err)
}

fn check_capacity(conn: &Connection, request: &AssignmentRequest) -> Result<()> {
    if let Some(ceiling) = request.capacity_ceiling {
        if active_count(conn, request.agent_id)? >= ceiling {
            return Err(LeadFlowError::CapacityExceeded {
                agent_id: request.agent_id,
                ceiling,
            });
        }
    }
    Ok(())
}

fn insert_assignment(conn: &Connection, request: &AssignmentRequest) -> Result<AssignmentId> {
    let assignment = Assignment::from_request(request);
    conn.execute(
        "INSERT INTO lead_assignments (assignment_id, lead_id, agent_id, assigned_at, superseded, reason)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            assignment.assignment_id.to_string(),
            assignment.lead_id.to_string(),
            assignment.agent_id.to_string(),
            ts(&assignment.assigned_at),
            assignment.reason,
        ],
    )
    .map_err(db_err)?;
    Ok(assignment.assignment_id)
}

fn insert_follow_up(conn: &Connection, task: &FollowUpTask) -> Result<()> {
    conn.execute(
        "INSERT INTO follow_up_tasks (task_id, lead_id, agent_id, task_type, due_date, priority, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task.task_id.to_string(),
            task.lead_id.to_string(),
            task.agent_id.map(|id| id.to_string()),
            task.task_type.as_str(),
            ts(&task.due_date),
            task.priority.as_str(),
            task.notes,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn insert_activity(conn: &Connection, activity: &LeadActivity) -> Result<()> {
    conn.execute(
        "INSERT INTO lead_activities
             (activity_id, lead_id, agent_id, activity_type, notes, outcome, created_at, next_follow_up)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            activity.activity_id.to_string(),
            activity.lead_id.to_string(),
            activity.agent_id.map(|id| id.to_string()),
            activity.activity_type.as_str(),
            activity.notes,
            activity.outcome.map(|o| o.as_str()),
            ts(&activity.created_at),
            activity.next_follow_up.as_ref().map(ts),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl LeadRepository for SqliteRepository {
    async fn insert_lead(&self, lead: &Lead, source: &LeadSource) -> Result<()> {
        let areas = serde_json::to_string(&lead.profile.preferred_areas)?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let p = &lead.profile;
        tx.execute(
            &format!(
                "INSERT INTO leads ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                LEAD_COLUMNS
            ),
            params![
                lead.lead_id.to_string(),
                lead.source_type.as_str(),
                p.first_name,
                p.last_name,
                p.email,
                p.phone,
                p.nationality,
                p.language_preference,
                p.budget_min,
                p.budget_max,
                p.property_type.map(|t| t.as_str()),
                areas,
                lead.status.as_str(),
                scoring::clamp_score(lead.score as i64),
                ts(&lead.created_at),
                ts(&lead.updated_at),
            ],
        )
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO lead_sources (source_id, lead_id, source_type, campaign_id, referrer_agent_id,
                 property_id, utm_source, utm_medium, utm_campaign, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                source.source_id.to_string(),
                source.lead_id.to_string(),
                source.source_type.as_str(),
                source.campaign_id,
                source.referrer_agent_id.map(|id| id.to_string()),
                source.property_id.map(|id| id.to_string()),
                source.utm_source,
                source.utm_medium,
                source.utm_campaign,
                ts(&source.created_at),
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)
    }

    async fn get_lead(&self, lead_id: LeadId) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM leads WHERE lead_id = ?1", LEAD_COLUMNS),
            params![lead_id.to_string()],
            lead_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn delete_lead(&self, lead_id: LeadId) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute("DELETE FROM leads WHERE lead_id = ?1", params![lead_id.to_string()])
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn find_recent_duplicate(
        &self,
        phone: &str,
        email: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LeadId>> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT lead_id FROM leads
                 WHERE (phone = ?1 OR (?2 IS NOT NULL AND email = ?2))
                   AND created_at >= ?3
                 LIMIT 1",
                params![phone, email, ts(&since)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        found
            .map(|s| parse_uuid(0, &s).map_err(db_err))
            .transpose()
    }

    async fn get_lead_score(&self, lead_id: LeadId) -> Result<i32> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT lead_score FROM leads WHERE lead_id = ?1",
            params![lead_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))
    }

    async fn set_lead_score(&self, lead_id: LeadId, score: i32) -> Result<i32> {
        let score = scoring::clamp_score(score as i64);
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE leads SET lead_score = ?1, updated_at = ?2 WHERE lead_id = ?3",
                params![score, ts(&Utc::now()), lead_id.to_string()],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(LeadFlowError::lead_not_found(lead_id));
        }
        Ok(score)
    }

    async fn apply_lead_update(&self, change: LeadChange) -> Result<LeadUpdateOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let lead_key = change.lead_id.to_string();
        let now = Utc::now();

        let (previous_status, previous_score) = tx
            .query_row(
                "SELECT status, lead_score FROM leads WHERE lead_id = ?1",
                params![lead_key],
                |row| Ok((col_enum::<LeadStatus>(row, 0)?, row.get::<_, i32>(1)?)),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| LeadFlowError::lead_not_found(change.lead_id))?;

        let status_change = match change.new_status {
            Some(new_status) if new_status != previous_status => Some(StatusChange {
                lead_id: change.lead_id,
                previous_status,
                new_status,
                notes: change.status_notes.clone(),
                changed_at: now,
            }),
            _ => None,
        };
        if let Some(sc) = &status_change {
            tx.execute(
                "INSERT INTO lead_status_history (lead_id, previous_status, new_status, notes, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    lead_key,
                    sc.previous_status.as_str(),
                    sc.new_status.as_str(),
                    sc.notes,
                    ts(&sc.changed_at),
                ],
            )
            .map_err(db_err)?;
        }

        if let Some(activity) = &change.activity {
            insert_activity(&tx, activity)?;
        }
        if let Some(task) = &change.follow_up {
            insert_follow_up(&tx, task)?;
        }
        for interest in &change.interests {
            tx.execute(
                "INSERT INTO lead_property_interests (lead_id, property_id, interest_level)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(lead_id, property_id) DO UPDATE SET interest_level = excluded.interest_level",
                params![
                    lead_key,
                    interest.property_id.to_string(),
                    interest.interest_level.as_str(),
                ],
            )
            .map_err(db_err)?;
        }

        let score = scoring::apply_delta(previous_score, change.score_delta);
        let status = status_change
            .as_ref()
            .map_or(previous_status, |sc| sc.new_status);
        tx.execute(
            "UPDATE leads SET status = ?1, lead_score = ?2, updated_at = ?3 WHERE lead_id = ?4",
            params![status.as_str(), score, ts(&now), lead_key],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(LeadUpdateOutcome {
            status,
            previous_score,
            score,
            status_change,
        })
    }

    async fn last_activity_at(&self, lead_id: LeadId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM lead_activities WHERE lead_id = ?1",
                params![lead_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        latest
            .map(|s| parse_ts(0, &s).map_err(db_err))
            .transpose()
    }

    async fn add_follow_up(&self, task: &FollowUpTask) -> Result<()> {
        let conn = self.conn()?;
        insert_follow_up(&conn, task)
    }

    async fn follow_ups(&self, lead_id: LeadId) -> Result<Vec<FollowUpTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT task_id, lead_id, agent_id, task_type, due_date, priority, notes
                 FROM follow_up_tasks WHERE lead_id = ?1 ORDER BY due_date",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![lead_id.to_string()], |row| {
                Ok(FollowUpTask {
                    task_id: col_uuid(row, 0)?,
                    lead_id: col_uuid(row, 1)?,
                    agent_id: col_opt_uuid(row, 2)?,
                    task_type: col_enum(row, 3)?,
                    due_date: col_ts(row, 4)?,
                    priority: col_enum(row, 5)?,
                    notes: row.get(6)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn property_interests(&self, lead_id: LeadId) -> Result<Vec<PropertyInterest>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT property_id, interest_level FROM lead_property_interests
                 WHERE lead_id = ?1 ORDER BY rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![lead_id.to_string()], |row| {
                Ok(PropertyInterest {
                    property_id: col_uuid(row, 0)?,
                    interest_level: col_enum(row, 1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn status_history(&self, lead_id: LeadId) -> Result<Vec<StatusChange>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT lead_id, previous_status, new_status, notes, changed_at
                 FROM lead_status_history WHERE lead_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![lead_id.to_string()], |row| {
                Ok(StatusChange {
                    lead_id: col_uuid(row, 0)?,
                    previous_status: col_enum(row, 1)?,
                    new_status: col_enum(row, 2)?,
                    notes: row.get(3)?,
                    changed_at: col_ts(row, 4)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let specialization = serde_json::to_string(&agent.specialization)?;
        let areas = serde_json::to_string(&agent.preferred_areas)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     full_name = excluded.full_name,
                     email = excluded.email,
                     phone = excluded.phone,
                     language = excluded.language,
                     specialization = excluded.specialization,
                     preferred_areas = excluded.preferred_areas,
                     is_active = excluded.is_active",
                AGENT_COLUMNS
            ),
            params![
                agent.agent_id.to_string(),
                agent.full_name,
                agent.email,
                agent.phone,
                agent.language,
                specialization,
                areas,
                agent.is_active,
                ts(&agent.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM agents WHERE agent_id = ?1", AGENT_COLUMNS),
            params![agent_id.to_string()],
            agent_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM agents ORDER BY created_at, agent_id",
                AGENT_COLUMNS
            ))
            .map_err(db_err)?;
        let agents = stmt
            .query_map([], agent_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(agents.into_iter().filter(|a| filter.matches(a)).collect())
    }

    async fn record_performance(&self, metric: &PerformanceMetric) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_performance_metrics
                 (agent_id, date, total_active_leads, conversions, conversion_rate)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(agent_id, date) DO UPDATE SET
                 total_active_leads = excluded.total_active_leads,
                 conversions = excluded.conversions,
                 conversion_rate = excluded.conversion_rate",
            params![
                metric.agent_id.to_string(),
                metric.date.to_string(),
                metric.total_active_leads,
                metric.conversions,
                metric.conversion_rate,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_conversion_rate(&self, agent_id: AgentId) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let rate: Option<Option<f64>> = conn
            .query_row(
                "SELECT conversion_rate FROM agent_performance_metrics
                 WHERE agent_id = ?1
                 ORDER BY date DESC LIMIT 1",
                params![agent_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(rate.flatten())
    }

    async fn count_active_assignments(&self, agent_id: AgentId) -> Result<u32> {
        let conn = self.conn()?;
        active_count(&conn, agent_id)
    }

    async fn active_assignment(&self, lead_id: LeadId) -> Result<Option<Assignment>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM lead_assignments WHERE lead_id = ?1 AND superseded = 0",
                ASSIGNMENT_COLUMNS
            ),
            params![lead_id.to_string()],
            assignment_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn assignment_history(&self, lead_id: LeadId) -> Result<Vec<Assignment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM lead_assignments WHERE lead_id = ?1 ORDER BY assigned_at, rowid",
                ASSIGNMENT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![lead_id.to_string()], assignment_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn create_assignment(&self, request: &AssignmentRequest) -> Result<AssignmentId> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let active: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM lead_assignments WHERE lead_id = ?1 AND superseded = 0",
                params![request.lead_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if active > 0 {
            return Err(LeadFlowError::AlreadyAssigned(request.lead_id));
        }
        check_capacity(&tx, request)?;

        let id = insert_assignment(&tx, request)?;
        tx.commit().map_err(db_err)?;
        Ok(id)
    }

    async fn supersede_active_assignment(&self, lead_id: LeadId) -> Result<u64> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE lead_assignments SET superseded = 1 WHERE lead_id = ?1 AND superseded = 0",
                params![lead_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(rows as u64)
    }

    async fn replace_active_assignment(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssignmentId> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        check_capacity(&tx, request)?;
        tx.execute(
            "UPDATE lead_assignments SET superseded = 1 WHERE lead_id = ?1 AND superseded = 0",
            params![request.lead_id.to_string()],
        )
        .map_err(db_err)?;
        let id = insert_assignment(&tx, request)?;

        tx.commit().map_err(db_err)?;
        Ok(id)
    }

    async fn create_scoring_rule(&self, rule: &ScoringRule) -> Result<()> {
        rule.validate()?;
        let criterion = serde_json::to_string(&rule.criterion)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scoring_rules (rule_id, rule_name, criterion, score_delta, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rule.rule_id.to_string(),
                rule.rule_name,
                criterion,
                rule.score_delta,
                rule.is_active,
                ts(&rule.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_scoring_rule(&self, rule_id: Uuid) -> Result<Option<ScoringRule>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT rule_id, rule_name, criterion, score_delta, is_active, created_at
             FROM scoring_rules WHERE rule_id = ?1",
            params![rule_id.to_string()],
            rule_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_scoring_rules(&self, active_only: bool) -> Result<Vec<ScoringRule>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, rule_name, criterion, score_delta, is_active, created_at
                 FROM scoring_rules WHERE (?1 = 0 OR is_active = 1) ORDER BY created_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![active_only], rule_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn update_scoring_rule(&self, rule: &ScoringRule) -> Result<bool> {
        rule.validate()?;
        let criterion = serde_json::to_string(&rule.criterion)?;
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE scoring_rules SET rule_name = ?1, criterion = ?2, score_delta = ?3, is_active = ?4
                 WHERE rule_id = ?5",
                params![
                    rule.rule_name,
                    criterion,
                    rule.score_delta,
                    rule.is_active,
                    rule.rule_id.to_string(),
                ],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn delete_scoring_rule(&self, rule_id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM scoring_rules WHERE rule_id = ?1",
                params![rule_id.to_string()],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }
}

/// Parse a `YYYY-MM-DD` metric date.
pub fn parse_metric_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| LeadFlowError::Validation(format!("invalid date '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::activity::{Activity, ActivityType};
    use leadflow_core::lead::{InterestLevel, PropertyType, SourceDetails, SourceType};
    use leadflow_core::manager::AssignmentManager;
    use leadflow_core::scoring::RuleCriterion;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn lead(phone: &str) -> (Lead, LeadSource) {
        let profile = LeadProfile {
            first_name: "Noura".into(),
            last_name: "Ali".into(),
            phone: phone.into(),
            email: Some(format!("{}@example.com", phone)),
            property_type: Some(PropertyType::Apartment),
            preferred_areas: vec!["JLT".into(), "Marina".into()],
            budget_max: Some(900_000),
            ..Default::default()
        };
        let lead = Lead::new(SourceType::PropertyFinder, profile, 42);
        let source = LeadSource::from_details(
            lead.lead_id,
            lead.source_type,
            &SourceDetails {
                campaign_id: Some("spring".into()),
                ..Default::default()
            },
        );
        (lead, source)
    }

    fn request(lead_id: LeadId, agent_id: AgentId, ceiling: Option<u32>) -> AssignmentRequest {
        AssignmentRequest {
            lead_id,
            agent_id,
            reason: "test".into(),
            capacity_ceiling: ceiling,
        }
    }

    #[tokio::test]
    async fn test_lead_round_trip_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let (lead, source) = lead("0502000001");
        {
            let repo = SqliteRepository::open(tmp.path()).unwrap();
            repo.insert_lead(&lead, &source).await.unwrap();
        }

        let repo = SqliteRepository::open(tmp.path()).unwrap();
        let loaded = repo.get_lead(lead.lead_id).await.unwrap().unwrap();
        assert_eq!(loaded.profile, lead.profile);
        assert_eq!(loaded.status, LeadStatus::New);
        assert_eq!(loaded.score, 42);
        // Timestamps are stored with microsecond precision.
        assert_eq!(loaded.created_at.timestamp_micros(), lead.created_at.timestamp_micros());
    }

    #[tokio::test]
    async fn test_score_is_clamped_on_write() {
        let repo = SqliteRepository::in_memory().unwrap();
        let (lead, source) = lead("0502000002");
        repo.insert_lead(&lead, &source).await.unwrap();

        assert_eq!(repo.set_lead_score(lead.lead_id, 250).await.unwrap(), 100);
        assert_eq!(repo.get_lead_score(lead.lead_id).await.unwrap(), 100);
        assert!(matches!(
            repo.set_lead_score(Uuid::new_v4(), 10).await,
            Err(LeadFlowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_capacity_checked_inside_insert() {
        let repo = SqliteRepository::in_memory().unwrap();
        let agent = Agent::new("Sami", "sami@example.com", "0503000000");
        repo.upsert_agent(&agent).await.unwrap();

        for i in 0..2 {
            let (lead, source) = lead(&format!("05020001{:02}", i));
            repo.insert_lead(&lead, &source).await.unwrap();
            repo.create_assignment(&request(lead.lead_id, agent.agent_id, Some(2)))
                .await
                .unwrap();
        }
        let (extra, source) = lead("0502000199");
        repo.insert_lead(&extra, &source).await.unwrap();
        let refused = repo
            .create_assignment(&request(extra.lead_id, agent.agent_id, Some(2)))
            .await;
        assert!(matches!(refused, Err(LeadFlowError::CapacityExceeded { ceiling: 2, .. })));
        assert!(repo.active_assignment(extra.lead_id).await.unwrap().is_none());
        assert_eq!(repo.count_active_assignments(agent.agent_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_active_assignment_refused() {
        let repo = SqliteRepository::in_memory().unwrap();
        let agent = Agent::new("Sami", "sami@example.com", "0503000000");
        repo.upsert_agent(&agent).await.unwrap();
        let (lead, source) = lead("0502000003");
        repo.insert_lead(&lead, &source).await.unwrap();

        repo.create_assignment(&request(lead.lead_id, agent.agent_id, None))
            .await
            .unwrap();
        let again = repo
            .create_assignment(&request(lead.lead_id, agent.agent_id, None))
            .await;
        assert!(matches!(again, Err(LeadFlowError::AlreadyAssigned(_))));
    }

    #[tokio::test]
    async fn test_failed_replace_rolls_back_supersede() {
        let repo = SqliteRepository::in_memory().unwrap();
        let agent = Agent::new("Sami", "sami@example.com", "0503000000");
        repo.upsert_agent(&agent).await.unwrap();
        let (lead, source) = lead("0502000004");
        repo.insert_lead(&lead, &source).await.unwrap();
        repo.create_assignment(&request(lead.lead_id, agent.agent_id, None))
            .await
            .unwrap();

        // Unknown agent violates the foreign key after the supersede ran.
        let result = repo
            .replace_active_assignment(&request(lead.lead_id, Uuid::new_v4(), None))
            .await;
        assert!(matches!(result, Err(LeadFlowError::Repository(_))));

        let history = repo.assignment_history(lead.lead_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].superseded);
    }

    #[tokio::test]
    async fn test_apply_lead_update_and_cascade_delete() {
        let repo = SqliteRepository::in_memory().unwrap();
        let (lead, source) = lead("0502000005");
        repo.insert_lead(&lead, &source).await.unwrap();
        let property = Uuid::new_v4();

        let activity = Activity::new(ActivityType::Viewing);
        let record = LeadActivity::record(lead.lead_id, None, &activity);
        let follow_up = FollowUpTask::new(
            lead.lead_id,
            None,
            ActivityType::Viewing,
            Utc::now(),
            "second viewing",
        );
        let outcome = repo
            .apply_lead_update(LeadChange {
                new_status: Some(LeadStatus::ViewingScheduled),
                status_notes: Some("Updated via API".into()),
                activity: Some(record.clone()),
                follow_up: Some(follow_up),
                interests: vec![
                    PropertyInterest {
                        property_id: property,
                        interest_level: InterestLevel::Medium,
                    },
                    PropertyInterest {
                        property_id: property,
                        interest_level: InterestLevel::High,
                    },
                ],
                score_delta: 70,
                ..LeadChange::new(lead.lead_id)
            })
            .await
            .unwrap();

        assert_eq!(outcome.score, 100);
        assert_eq!(outcome.status, LeadStatus::ViewingScheduled);
        let last = repo.last_activity_at(lead.lead_id).await.unwrap().unwrap();
        assert_eq!(last.timestamp_micros(), record.created_at.timestamp_micros());
        let interests = repo.property_interests(lead.lead_id).await.unwrap();
        assert_eq!(interests.len(), 1);
        assert_eq!(interests[0].interest_level, InterestLevel::High);
        assert_eq!(repo.status_history(lead.lead_id).await.unwrap().len(), 1);
        assert_eq!(repo.follow_ups(lead.lead_id).await.unwrap().len(), 1);

        assert!(repo.delete_lead(lead.lead_id).await.unwrap());
        assert!(repo.get_lead(lead.lead_id).await.unwrap().is_none());
        assert!(repo.follow_ups(lead.lead_id).await.unwrap().is_empty());
        assert!(repo.last_activity_at(lead.lead_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_lead_writes_nothing() {
        let repo = SqliteRepository::in_memory().unwrap();
        let ghost = Uuid::new_v4();
        let result = repo
            .apply_lead_update(LeadChange {
                score_delta: 5,
                ..LeadChange::new(ghost)
            })
            .await;
        assert!(matches!(result, Err(LeadFlowError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_lookup_and_metrics() {
        let repo = SqliteRepository::in_memory().unwrap();
        let (lead, source) = lead("0502000006");
        repo.insert_lead(&lead, &source).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(
            repo.find_recent_duplicate("0000000", Some("0502000006@example.com"), since)
                .await
                .unwrap(),
            Some(lead.lead_id)
        );
        assert!(repo
            .find_recent_duplicate("0000000", None, since)
            .await
            .unwrap()
            .is_none());

        let agent = Agent::new("Sami", "sami@example.com", "0503000000");
        repo.upsert_agent(&agent).await.unwrap();
        for (date, rate) in [("2025-01-31", 2.5), ("2025-02-28", 6.0)] {
            repo.record_performance(&PerformanceMetric {
                agent_id: agent.agent_id,
                date: parse_metric_date(date).unwrap(),
                total_active_leads: 10,
                conversions: 1,
                conversion_rate: Some(rate),
            })
            .await
            .unwrap();
        }
        assert_eq!(repo.latest_conversion_rate(agent.agent_id).await.unwrap(), Some(6.0));

        repo.record_performance(&PerformanceMetric {
            agent_id: agent.agent_id,
            date: parse_metric_date("2025-03-31").unwrap(),
            total_active_leads: 10,
            conversions: 0,
            conversion_rate: None,
        })
        .await
        .unwrap();
        assert_eq!(repo.latest_conversion_rate(agent.agent_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scoring_rule_crud() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut rule = ScoringRule::new(
            "luxury",
            RuleCriterion::BudgetAbove { amount: 5_000_000 },
            10,
        );
        repo.create_scoring_rule(&rule).await.unwrap();
        let stored = repo.get_scoring_rule(rule.rule_id).await.unwrap().unwrap();
        assert_eq!(stored.rule_name, rule.rule_name);
        assert_eq!(stored.criterion, rule.criterion);
        assert_eq!(stored.score_delta, 10);
        assert!(stored.is_active);
        assert_eq!(
            stored.created_at.timestamp_micros(),
            rule.created_at.timestamp_micros()
        );

        let oversized = ScoringRule::new("runaway", RuleCriterion::Referral, 500);
        assert!(matches!(
            repo.create_scoring_rule(&oversized).await,
            Err(LeadFlowError::Validation(_))
        ));
        rule.score_delta = -101;
        assert!(matches!(
            repo.update_scoring_rule(&rule).await,
            Err(LeadFlowError::Validation(_))
        ));
        rule.score_delta = 10;

        rule.is_active = false;
        assert!(repo.update_scoring_rule(&rule).await.unwrap());
        assert!(repo.list_scoring_rules(true).await.unwrap().is_empty());
        assert_eq!(repo.list_scoring_rules(false).await.unwrap().len(), 1);

        assert!(repo.delete_scoring_rule(rule.rule_id).await.unwrap());
        assert!(!repo.delete_scoring_rule(rule.rule_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_manager_on_sqlite() {
        let tmp = NamedTempFile::new().unwrap();
        let repo = Arc::new(SqliteRepository::open(tmp.path()).unwrap());
        let a = Agent::new("A", "a@example.com", "0503000001").with_specialization(&["apartment"]);
        let b = Agent::new("B", "b@example.com", "0503000002").with_language("arabic");
        repo.upsert_agent(&a).await.unwrap();
        repo.upsert_agent(&b).await.unwrap();
        let manager = AssignmentManager::new(repo.clone());

        let (lead, source) = lead("0502000007");
        repo.insert_lead(&lead, &source).await.unwrap();
        let first = manager.assign(lead.lead_id, &lead.profile).await.unwrap();
        assert_eq!(first.agent_id, a.agent_id);

        manager
            .reassign(lead.lead_id, "manual", Some(b.agent_id))
            .await
            .unwrap();
        let history = repo.assignment_history(lead.lead_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].superseded);
        assert_eq!(repo.active_assignment(lead.lead_id).await.unwrap().unwrap().agent_id, b.agent_id);
    }
}
