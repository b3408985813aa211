use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use crate::actions::{Action, StepKind};

/// Proposal urgency. Stored as text, read back leniently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accepted" => ProposalStatus::Accepted,
            "rejected" => ProposalStatus::Rejected,
            _ => ProposalStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Running,
    Succeeded,
    Failed,
}

impl MissionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MissionStatus::Running => "running",
            MissionStatus::Succeeded => "succeeded",
            MissionStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => MissionStatus::Succeeded,
            "failed" => MissionStatus::Failed,
            _ => MissionStatus::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, MissionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => StepStatus::Running,
            "succeeded" => StepStatus::Succeeded,
            "failed" => StepStatus::Failed,
            _ => StepStatus::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

/// An agent's intent to perform one action, awaiting or past admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub source: String,
    pub agent: String,
    pub action: Action,
    pub params: Value,
    pub priority: Priority,
    pub status: ProposalStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Unit of approved work, 1:1 with the proposal that spawned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub proposal_id: String,
    pub status: MissionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One ordered, independently executable unit of a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub mission_id: String,
    pub kind: StepKind,
    pub params: Value,
    pub status: StepStatus,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An immutable fact appended to the observation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: String,
    pub kind: String,
    pub tags: Vec<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Record of one completed step execution. The per-action cap gates count
/// these, so every outcome (including sweeper force-failures) writes one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRun {
    pub id: String,
    pub step_id: String,
    pub action: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

fn parse_dt(col: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_dt(col: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_dt(col, value)).transpose()
}

fn parse_json(col: usize, raw: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_action(col: usize, raw: String) -> rusqlite::Result<Action> {
    Action::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown action '{}'", raw),
            )),
        )
    })
}

fn parse_step_kind(col: usize, raw: String) -> rusqlite::Result<StepKind> {
    StepKind::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown step kind '{}'", raw),
            )),
        )
    })
}

/// The durable store for the whole engine: proposals, missions, steps, the
/// event log, policy entries, cooldown records, and the action-run ledger.
pub struct OpsDatabase {
    conn: Mutex<Connection>,
}

impl OpsDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS proposals (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                agent TEXT NOT NULL,
                action TEXT NOT NULL,
                params_json TEXT NOT NULL,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS missions (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                FOREIGN KEY(proposal_id) REFERENCES proposals(id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS mission_steps (
                id TEXT PRIMARY KEY,
                mission_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                params_json TEXT NOT NULL,
                status TEXT NOT NULL,
                reserved_by TEXT,
                reserved_at TEXT,
                result_json TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(mission_id) REFERENCES missions(id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_events (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS policy (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // One row per rule, overwritten on each fire.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS trigger_fires (
                trigger_id TEXT PRIMARY KEY,
                fired_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS reaction_cooldowns (
                pattern_id TEXT PRIMARY KEY,
                last_fired_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS action_runs (
                id TEXT PRIMARY KEY,
                step_id TEXT NOT NULL,
                action TEXT NOT NULL,
                output_json TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proposals_agent_created ON proposals(agent, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proposals_action_created ON proposals(action, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_missions_status_created ON missions(status, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_mission ON mission_steps(mission_id, created_at ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_steps_status_created ON mission_steps(status, created_at ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_created ON agent_events(created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_kind_created ON agent_events(kind, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_action_runs_action_completed ON action_runs(action, completed_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Proposals
    // ========================================================================

    pub fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO proposals (id, source, agent, action, params_json, priority, status, rejection_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                proposal.id,
                proposal.source,
                proposal.agent,
                proposal.action.as_str(),
                proposal.params.to_string(),
                proposal.priority.as_db_str(),
                proposal.status.as_db_str(),
                proposal.rejection_reason,
                proposal.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn proposal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Proposal> {
        Ok(Proposal {
            id: row.get(0)?,
            source: row.get(1)?,
            agent: row.get(2)?,
            action: parse_action(3, row.get(3)?)?,
            params: parse_json(4, row.get(4)?)?,
            priority: Priority::from_db(&row.get::<_, String>(5)?),
            status: ProposalStatus::from_db(&row.get::<_, String>(6)?),
            rejection_reason: row.get(7)?,
            created_at: parse_dt(8, row.get(8)?)?,
        })
    }

    const PROPOSAL_COLUMNS: &'static str =
        "id, source, agent, action, params_json, priority, status, rejection_reason, created_at";

    pub fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM proposals WHERE id = ?1",
                Self::PROPOSAL_COLUMNS
            ),
            [id],
            Self::proposal_from_row,
        );

        match result {
            Ok(proposal) => Ok(Some(proposal)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Guarded status transition out of `pending`. Returns false when the
    /// proposal was not pending (or does not exist), so the accepted
    /// transition can only ever happen once.
    pub fn transition_pending_proposal(
        &self,
        id: &str,
        status: ProposalStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE proposals SET status = ?1, rejection_reason = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.as_db_str(), reason, id],
        )?;
        Ok(changed == 1)
    }

    pub fn count_proposals_for_agent_since(
        &self,
        agent: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM proposals WHERE agent = ?1 AND created_at >= ?2",
            params![agent, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn count_proposals_by_status(&self, status: ProposalStatus) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM proposals WHERE status = ?1",
            [status.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Does a proposal for `action` exist since `since` whose params carry
    /// `key = value`? Used by trigger conditions to avoid duplicate work.
    pub fn proposal_exists_with_param(
        &self,
        action: Action,
        key: &str,
        value: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM proposals
             WHERE action = ?1 AND json_extract(params_json, ?2) = ?3 AND created_at > ?4",
            params![
                action.as_str(),
                format!("$.{}", key),
                value,
                since.to_rfc3339()
            ],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Missions
    // ========================================================================

    pub fn insert_mission(&self, mission: &Mission) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO missions (id, proposal_id, status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mission.id,
                mission.proposal_id,
                mission.status.as_db_str(),
                mission.created_at.to_rfc3339(),
                mission.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn mission_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mission> {
        Ok(Mission {
            id: row.get(0)?,
            proposal_id: row.get(1)?,
            status: MissionStatus::from_db(&row.get::<_, String>(2)?),
            created_at: parse_dt(3, row.get(3)?)?,
            completed_at: parse_opt_dt(4, row.get(4)?)?,
        })
    }

    const MISSION_COLUMNS: &'static str = "id, proposal_id, status, created_at, completed_at";

    pub fn get_mission(&self, id: &str) -> Result<Option<Mission>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM missions WHERE id = ?1",
                Self::MISSION_COLUMNS
            ),
            [id],
            Self::mission_from_row,
        );

        match result {
            Ok(mission) => Ok(Some(mission)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Terminal transition, guarded so it is idempotent: only a running
    /// mission can move to succeeded/failed.
    pub fn finalize_mission(
        &self,
        id: &str,
        status: MissionStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE missions SET status = ?1, completed_at = ?2
             WHERE id = ?3 AND status = 'running'",
            params![status.as_db_str(), completed_at.to_rfc3339(), id],
        )?;
        Ok(changed == 1)
    }

    pub fn count_missions_by_status(&self, status: MissionStatus) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM missions WHERE status = ?1",
            [status.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn running_missions_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Mission>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM missions WHERE status = 'running' AND created_at < ?1
             ORDER BY created_at ASC",
            Self::MISSION_COLUMNS
        ))?;
        let missions = stmt
            .query_map([cutoff.to_rfc3339()], Self::mission_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    pub fn recent_failed_missions(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Mission>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM missions
             WHERE status = 'failed' AND completed_at > ?1
             ORDER BY completed_at DESC
             LIMIT ?2",
            Self::MISSION_COLUMNS
        ))?;
        let missions = stmt
            .query_map(
                params![since.to_rfc3339(), limit as i64],
                Self::mission_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    pub fn recent_missions(&self, limit: usize) -> Result<Vec<Mission>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM missions ORDER BY created_at DESC LIMIT ?1",
            Self::MISSION_COLUMNS
        ))?;
        let missions = stmt
            .query_map([limit as i64], Self::mission_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    pub fn insert_step(&self, step: &Step) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO mission_steps (id, mission_id, kind, params_json, status, reserved_by, reserved_at, result_json, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                step.id,
                step.mission_id,
                step.kind.as_str(),
                step.params.to_string(),
                step.status.as_db_str(),
                step.reserved_by,
                step.reserved_at.map(|t| t.to_rfc3339()),
                step.result.as_ref().map(|v| v.to_string()),
                step.last_error,
                step.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn step_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
        Ok(Step {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            kind: parse_step_kind(2, row.get(2)?)?,
            params: parse_json(3, row.get(3)?)?,
            status: StepStatus::from_db(&row.get::<_, String>(4)?),
            reserved_by: row.get(5)?,
            reserved_at: parse_opt_dt(6, row.get(6)?)?,
            result: row
                .get::<_, Option<String>>(7)?
                .map(|raw| parse_json(7, raw))
                .transpose()?,
            last_error: row.get(8)?,
            created_at: parse_dt(9, row.get(9)?)?,
        })
    }

    const STEP_COLUMNS: &'static str = "id, mission_id, kind, params_json, status, reserved_by, reserved_at, result_json, last_error, created_at";

    pub fn get_step(&self, id: &str) -> Result<Option<Step>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM mission_steps WHERE id = ?1",
                Self::STEP_COLUMNS
            ),
            [id],
            Self::step_from_row,
        );

        match result {
            Ok(step) => Ok(Some(step)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn steps_for_mission(&self, mission_id: &str) -> Result<Vec<Step>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mission_steps WHERE mission_id = ?1 ORDER BY created_at ASC",
            Self::STEP_COLUMNS
        ))?;
        let steps = stmt
            .query_map([mission_id], Self::step_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    /// Oldest queued step whose mission is still running.
    pub fn next_queued_step(&self) -> Result<Option<Step>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT s.id, s.mission_id, s.kind, s.params_json, s.status, s.reserved_by,
                    s.reserved_at, s.result_json, s.last_error, s.created_at
             FROM mission_steps s
             WHERE s.status = 'queued'
               AND EXISTS (SELECT 1 FROM missions m WHERE m.id = s.mission_id AND m.status = 'running')
             ORDER BY s.created_at ASC
             LIMIT 1",
            [],
            Self::step_from_row,
        );

        match result {
            Ok(step) => Ok(Some(step)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The claim: a single-row compare-and-swap from queued to running. The
    /// only mutual-exclusion primitive in the system; exactly one concurrent
    /// caller observes `true` for a given step.
    pub fn try_claim_step(
        &self,
        step_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE mission_steps
             SET status = 'running', reserved_by = ?1, reserved_at = ?2
             WHERE id = ?3 AND status = 'queued'",
            params![worker_id, now.to_rfc3339(), step_id],
        )?;
        Ok(changed == 1)
    }

    /// Guarded terminal transition out of `running`. Returns false when the
    /// step already left `running`, so at most one outcome ever lands.
    pub fn record_step_result(
        &self,
        step_id: &str,
        status: StepStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE mission_steps
             SET status = ?1, result_json = ?2, last_error = ?3
             WHERE id = ?4 AND status = 'running'",
            params![
                status.as_db_str(),
                result.map(|v| v.to_string()),
                error,
                step_id
            ],
        )?;
        Ok(changed == 1)
    }

    /// Force-fail every non-terminal step of a mission. Used by orphan
    /// recovery; the status predicate keeps it idempotent.
    pub fn fail_open_steps_for_mission(&self, mission_id: &str, error: &str) -> Result<u32> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE mission_steps
             SET status = 'failed', last_error = ?1
             WHERE mission_id = ?2 AND status IN ('queued', 'running')",
            params![error, mission_id],
        )?;
        Ok(changed as u32)
    }

    pub fn stale_running_steps(&self, cutoff: DateTime<Utc>) -> Result<Vec<Step>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mission_steps
             WHERE status = 'running' AND reserved_at < ?1
             ORDER BY reserved_at ASC",
            Self::STEP_COLUMNS
        ))?;
        let steps = stmt
            .query_map([cutoff.to_rfc3339()], Self::step_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    pub fn count_steps_by_status(&self, status: StepStatus) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mission_steps WHERE status = ?1",
            [status.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn count_stale_running_steps(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mission_steps WHERE status = 'running' AND reserved_at < ?1",
            [cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ========================================================================
    // Event log
    // ========================================================================

    /// Append one event. Events are never mutated or deleted.
    pub fn insert_event(
        &self,
        source: &str,
        kind: &str,
        tags: &[String],
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            kind: kind.to_string(),
            tags: tags.to_vec(),
            data,
            created_at: now,
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO agent_events (id, source, kind, tags_json, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.source,
                event.kind,
                serde_json::to_string(&event.tags)?,
                event.data.to_string(),
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(event)
    }

    fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
        let tags_json: String = row.get(3)?;
        Ok(Event {
            id: row.get(0)?,
            source: row.get(1)?,
            kind: row.get(2)?,
            tags: serde_json::from_str(&tags_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            data: parse_json(4, row.get(4)?)?,
            created_at: parse_dt(5, row.get(5)?)?,
        })
    }

    const EVENT_COLUMNS: &'static str = "id, source, kind, tags_json, data_json, created_at";

    /// Events newer than `since`, oldest first, capped at `limit`.
    pub fn events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Event>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_events WHERE created_at > ?1 ORDER BY created_at ASC LIMIT ?2",
            Self::EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![since.to_rfc3339(), limit as i64], Self::event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn events_of_kind_since(
        &self,
        kind: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_events
             WHERE kind = ?1 AND created_at > ?2
             ORDER BY created_at DESC
             LIMIT ?3",
            Self::EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(
                params![kind, since.to_rfc3339(), limit as i64],
                Self::event_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_events ORDER BY created_at DESC LIMIT ?1",
            Self::EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map([limit as i64], Self::event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn count_events_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_events WHERE created_at > ?1",
            [since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ========================================================================
    // Policy store
    // ========================================================================

    pub fn get_policy_value(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value_json FROM policy WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_policy_value(&self, key: &str, value: &Value, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO policy (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value.to_string(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_policies(&self) -> Result<Vec<(String, Value)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key, value_json FROM policy ORDER BY key ASC")?;
        let entries = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let value = parse_json(1, row.get(1)?)?;
                Ok((key, value))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ========================================================================
    // Cooldown records
    // ========================================================================

    pub fn last_trigger_fire(&self, trigger_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT fired_at FROM trigger_fires WHERE trigger_id = ?1",
            [trigger_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(Some(raw.parse()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record_trigger_fire(&self, trigger_id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO trigger_fires (trigger_id, fired_at) VALUES (?1, ?2)",
            params![trigger_id, fired_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn last_reaction_fire(&self, pattern_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT last_fired_at FROM reaction_cooldowns WHERE pattern_id = ?1",
            [pattern_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => Ok(Some(raw.parse()?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record_reaction_fire(&self, pattern_id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO reaction_cooldowns (pattern_id, last_fired_at) VALUES (?1, ?2)",
            params![pattern_id, fired_at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Action runs
    // ========================================================================

    pub fn insert_action_run(&self, run: &ActionRun) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO action_runs (id, step_id, action, output_json, error, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.id,
                run.step_id,
                run.action,
                run.output.as_ref().map(|v| v.to_string()),
                run.error,
                run.started_at.to_rfc3339(),
                run.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Completed runs of `action` since `since`. Only successful runs count
    /// toward quotas.
    pub fn count_successful_action_runs_since(
        &self,
        action: &str,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_runs
             WHERE action = ?1 AND error IS NULL AND completed_at >= ?2",
            params![action, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("opsforge_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn sample_proposal(agent: &str, action: Action, status: ProposalStatus) -> Proposal {
        Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            source: "test".to_string(),
            agent: agent.to_string(),
            action,
            params: serde_json::json!({}),
            priority: Priority::Normal,
            status,
            rejection_reason: None,
            created_at: Utc::now(),
        }
    }

    fn sample_step(mission_id: &str, kind: StepKind, created_at: DateTime<Utc>) -> Step {
        Step {
            id: uuid::Uuid::new_v4().to_string(),
            mission_id: mission_id.to_string(),
            kind,
            params: serde_json::json!({}),
            status: StepStatus::Queued,
            reserved_by: None,
            reserved_at: None,
            result: None,
            last_error: None,
            created_at,
        }
    }

    #[test]
    fn proposal_roundtrip_preserves_fields() {
        let path = temp_db_path("proposal_roundtrip");
        let db = OpsDatabase::new(&path).expect("db init");

        let mut proposal = sample_proposal("scout", Action::GatherIntel, ProposalStatus::Pending);
        proposal.params = serde_json::json!({ "trigger_id": "daily_intel_scan" });
        db.insert_proposal(&proposal).expect("insert proposal");

        let loaded = db
            .get_proposal(&proposal.id)
            .expect("get proposal")
            .expect("proposal exists");
        assert_eq!(loaded.agent, "scout");
        assert_eq!(loaded.action, Action::GatherIntel);
        assert_eq!(loaded.status, ProposalStatus::Pending);
        assert_eq!(loaded.params["trigger_id"], "daily_intel_scan");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pending_transition_is_one_shot() {
        let path = temp_db_path("pending_transition");
        let db = OpsDatabase::new(&path).expect("db init");

        let proposal = sample_proposal("quill", Action::DraftTweet, ProposalStatus::Pending);
        db.insert_proposal(&proposal).expect("insert proposal");

        assert!(db
            .transition_pending_proposal(&proposal.id, ProposalStatus::Accepted, None)
            .expect("first transition"));
        assert!(!db
            .transition_pending_proposal(&proposal.id, ProposalStatus::Rejected, Some("late"))
            .expect("second transition"));

        let loaded = db
            .get_proposal(&proposal.id)
            .expect("get proposal")
            .expect("proposal exists");
        assert_eq!(loaded.status, ProposalStatus::Accepted);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn claim_cas_succeeds_once() {
        let path = temp_db_path("claim_cas");
        let db = OpsDatabase::new(&path).expect("db init");

        let proposal = sample_proposal("scout", Action::Crawl, ProposalStatus::Accepted);
        db.insert_proposal(&proposal).expect("insert proposal");
        let mission = Mission {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal.id.clone(),
            status: MissionStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        };
        db.insert_mission(&mission).expect("insert mission");
        let step = sample_step(&mission.id, StepKind::Crawl, Utc::now());
        db.insert_step(&step).expect("insert step");

        let now = Utc::now();
        assert!(db
            .try_claim_step(&step.id, "worker-a", now)
            .expect("first claim"));
        assert!(!db
            .try_claim_step(&step.id, "worker-b", now)
            .expect("second claim"));

        let loaded = db.get_step(&step.id).expect("get step").expect("step");
        assert_eq!(loaded.status, StepStatus::Running);
        assert_eq!(loaded.reserved_by.as_deref(), Some("worker-a"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn next_queued_step_skips_finished_missions() {
        let path = temp_db_path("next_queued");
        let db = OpsDatabase::new(&path).expect("db init");

        let base = Utc::now();

        let dead_proposal = sample_proposal("scout", Action::Crawl, ProposalStatus::Accepted);
        db.insert_proposal(&dead_proposal).expect("insert proposal");
        let dead_mission = Mission {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: dead_proposal.id.clone(),
            status: MissionStatus::Failed,
            created_at: base,
            completed_at: Some(base),
        };
        db.insert_mission(&dead_mission).expect("insert mission");
        db.insert_step(&sample_step(&dead_mission.id, StepKind::Crawl, base))
            .expect("insert step");

        let live_proposal = sample_proposal("sage", Action::Analyze, ProposalStatus::Accepted);
        db.insert_proposal(&live_proposal).expect("insert proposal");
        let live_mission = Mission {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: live_proposal.id.clone(),
            status: MissionStatus::Running,
            created_at: base,
            completed_at: None,
        };
        db.insert_mission(&live_mission).expect("insert mission");
        let live_step = sample_step(
            &live_mission.id,
            StepKind::Analyze,
            base + Duration::seconds(1),
        );
        db.insert_step(&live_step).expect("insert step");

        let next = db
            .next_queued_step()
            .expect("next queued")
            .expect("a step is available");
        assert_eq!(next.id, live_step.id);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn policy_roundtrip_and_overwrite() {
        let path = temp_db_path("policy_roundtrip");
        let db = OpsDatabase::new(&path).expect("db init");

        assert!(db
            .get_policy_value("crawl_quota")
            .expect("missing key")
            .is_none());

        let now = Utc::now();
        db.set_policy_value("crawl_quota", &serde_json::json!({ "hourly_limit": 5 }), now)
            .expect("set policy");
        db.set_policy_value("crawl_quota", &serde_json::json!({ "hourly_limit": 9 }), now)
            .expect("overwrite policy");

        let value = db
            .get_policy_value("crawl_quota")
            .expect("get policy")
            .expect("policy exists");
        assert_eq!(value["hourly_limit"], 9);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cooldown_rows_are_overwritten_not_appended() {
        let path = temp_db_path("cooldowns");
        let db = OpsDatabase::new(&path).expect("db init");

        let first = Utc::now() - Duration::hours(3);
        let second = Utc::now();
        db.record_trigger_fire("daily_intel_scan", first)
            .expect("first fire");
        db.record_trigger_fire("daily_intel_scan", second)
            .expect("second fire");

        let last = db
            .last_trigger_fire("daily_intel_scan")
            .expect("last fire")
            .expect("fire recorded");
        assert_eq!(last.timestamp(), second.timestamp());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn action_run_counting_ignores_failures() {
        let path = temp_db_path("action_runs");
        let db = OpsDatabase::new(&path).expect("db init");

        let now = Utc::now();
        for (idx, error) in [None, None, Some("boom")].into_iter().enumerate() {
            db.insert_action_run(&ActionRun {
                id: format!("run-{}", idx),
                step_id: format!("step-{}", idx),
                action: "crawl".to_string(),
                output: None,
                error: error.map(|e| e.to_string()),
                started_at: now,
                completed_at: now,
            })
            .expect("insert run");
        }

        let count = db
            .count_successful_action_runs_since("crawl", now - Duration::hours(1))
            .expect("count runs");
        assert_eq!(count, 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn proposal_param_lookup_matches_json_field() {
        let path = temp_db_path("param_lookup");
        let db = OpsDatabase::new(&path).expect("db init");

        let mut proposal = sample_proposal("sage", Action::DiagnoseFailure, ProposalStatus::Pending);
        proposal.params = serde_json::json!({ "mission_id": "m-42" });
        db.insert_proposal(&proposal).expect("insert proposal");

        let since = Utc::now() - Duration::hours(1);
        assert!(db
            .proposal_exists_with_param(Action::DiagnoseFailure, "mission_id", "m-42", since)
            .expect("lookup existing"));
        assert!(!db
            .proposal_exists_with_param(Action::DiagnoseFailure, "mission_id", "m-43", since)
            .expect("lookup missing"));

        let _ = std::fs::remove_file(&path);
    }
}
