//! Self-healing: steps get stuck in `running` when a worker dies mid-step,
//! and missions sit untouched when no worker ever claims them. The sweeper
//! force-fails both so the factory keeps moving, and exposes an aggregate
//! health read for the dashboard.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::database::{
    ActionRun, MissionStatus, OpsDatabase, ProposalStatus, StepStatus,
};
use crate::missions::MissionScheduler;

/// A step running longer than this without an outcome is presumed dead.
pub const STALE_THRESHOLD_MINUTES: i64 = 30;
/// A running mission older than this with no claimed step is orphaned.
pub const ORPHAN_THRESHOLD_MINUTES: i64 = 60;

const DEGRADED_FAILED_STEPS: u32 = 10;
const DEGRADED_STALE_STEPS: u32 = 5;
const CRITICAL_STALE_STEPS: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredStep {
    pub step_id: String,
    pub mission_id: String,
    pub kind: String,
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredMission {
    pub mission_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StaleRecoveryReport {
    pub recovered: Vec<RecoveredStep>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct OrphanRecoveryReport {
    pub recovered: Vec<RecoveredMission>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Pure read-side diagnostic; no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: u32,
    pub pending_proposals: u32,
    pub running_missions: u32,
    pub running_steps: u32,
    pub failed_steps: u32,
    pub stale_steps: u32,
    pub status: HealthStatus,
}

pub struct Sweeper {
    db: Arc<OpsDatabase>,
    scheduler: Arc<MissionScheduler>,
}

impl Sweeper {
    pub fn new(db: Arc<OpsDatabase>, scheduler: Arc<MissionScheduler>) -> Self {
        Self { db, scheduler }
    }

    /// Force-fail steps stuck in `running` past the staleness threshold and
    /// re-evaluate their missions. Idempotent: a recovered step is no longer
    /// `running`, so a second pass selects nothing.
    pub fn recover_stale_steps(&self, now: DateTime<Utc>) -> Result<StaleRecoveryReport> {
        let cutoff = now - Duration::minutes(STALE_THRESHOLD_MINUTES);
        let mut report = StaleRecoveryReport::default();

        for step in self.db.stale_running_steps(cutoff)? {
            let worker = step
                .reserved_by
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let elapsed_minutes = step
                .reserved_at
                .map(|at| (now - at).num_minutes())
                .unwrap_or(0);
            let error = format!(
                "Stale: no progress for {} minutes (worker: {})",
                elapsed_minutes, worker
            );

            // The guarded update loses gracefully if a late outcome landed
            // between selection and recovery.
            if !self
                .db
                .record_step_result(&step.id, StepStatus::Failed, None, Some(&error))?
            {
                continue;
            }

            self.db.insert_action_run(&ActionRun {
                id: uuid::Uuid::new_v4().to_string(),
                step_id: step.id.clone(),
                action: step.kind.as_str().to_string(),
                output: None,
                error: Some(format!(
                    "Stale recovery: step was running for >{} minutes without progress",
                    STALE_THRESHOLD_MINUTES
                )),
                started_at: step.reserved_at.unwrap_or(now),
                completed_at: now,
            })?;

            self.db.insert_event(
                "system",
                "step_stale_recovered",
                &[
                    "step".to_string(),
                    "stale".to_string(),
                    step.kind.as_str().to_string(),
                ],
                serde_json::json!({
                    "step_id": step.id.clone(),
                    "mission_id": step.mission_id.clone(),
                    "kind": step.kind.as_str(),
                    "worker": worker.clone(),
                }),
                now,
            )?;

            self.scheduler.maybe_finalize(&step.mission_id, now)?;

            tracing::warn!(
                "Recovered stale step {} (worker {}, {} minutes)",
                step.id,
                worker,
                elapsed_minutes
            );
            report.recovered.push(RecoveredStep {
                step_id: step.id,
                mission_id: step.mission_id,
                kind: step.kind.as_str().to_string(),
                worker: step.reserved_by,
            });
        }

        Ok(report)
    }

    /// Force-fail running missions past the orphan threshold that either
    /// have no steps at all or whose steps were never claimed. Missions with
    /// any progress are left to the stale-step path.
    pub fn recover_orphaned_missions(&self, now: DateTime<Utc>) -> Result<OrphanRecoveryReport> {
        let cutoff = now - Duration::minutes(ORPHAN_THRESHOLD_MINUTES);
        let mut report = OrphanRecoveryReport::default();

        for mission in self.db.running_missions_older_than(cutoff)? {
            let steps = self.db.steps_for_mission(&mission.id)?;
            let reason = if steps.is_empty() {
                "no_steps"
            } else if steps.iter().all(|s| s.status == StepStatus::Queued) {
                "never_claimed"
            } else {
                continue;
            };

            self.db.fail_open_steps_for_mission(
                &mission.id,
                "Mission orphaned: no worker claimed steps",
            )?;
            if !self
                .db
                .finalize_mission(&mission.id, MissionStatus::Failed, now)?
            {
                continue;
            }

            self.db.insert_event(
                "system",
                "mission_orphaned",
                &["mission".to_string(), "orphaned".to_string()],
                serde_json::json!({
                    "mission_id": mission.id.clone(),
                    "reason": reason,
                }),
                now,
            )?;

            tracing::warn!("Recovered orphaned mission {} ({})", mission.id, reason);
            report.recovered.push(RecoveredMission {
                mission_id: mission.id,
                reason: reason.to_string(),
            });
        }

        Ok(report)
    }

    /// Aggregate live counts into a coarse status.
    pub fn system_health(&self, now: DateTime<Utc>) -> Result<SystemHealth> {
        let stale_cutoff = now - Duration::minutes(STALE_THRESHOLD_MINUTES);
        let pending_proposals = self.db.count_proposals_by_status(ProposalStatus::Pending)?;
        let queued_steps = self.db.count_steps_by_status(StepStatus::Queued)?;
        let running_steps = self.db.count_steps_by_status(StepStatus::Running)?;
        let failed_steps = self.db.count_steps_by_status(StepStatus::Failed)?;
        let stale_steps = self.db.count_stale_running_steps(stale_cutoff)?;
        let running_missions = self.db.count_missions_by_status(MissionStatus::Running)?;

        let status = if stale_steps > CRITICAL_STALE_STEPS {
            HealthStatus::Critical
        } else if failed_steps > DEGRADED_FAILED_STEPS || stale_steps > DEGRADED_STALE_STEPS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(SystemHealth {
            timestamp: now,
            queue_depth: queued_steps + pending_proposals,
            pending_proposals,
            running_missions,
            running_steps,
            failed_steps,
            stale_steps,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, StepKind};
    use crate::database::{Mission, Priority, Proposal, Step};
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("opsforge_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn sweeper_with(db: Arc<OpsDatabase>) -> Sweeper {
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        Sweeper::new(db, scheduler)
    }

    fn seeded_mission(db: &OpsDatabase, action: Action, created_at: DateTime<Utc>) -> Mission {
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            source: "test".to_string(),
            agent: "scout".to_string(),
            action,
            params: serde_json::json!({}),
            priority: Priority::Normal,
            status: ProposalStatus::Accepted,
            rejection_reason: None,
            created_at,
        };
        db.insert_proposal(&proposal).expect("insert proposal");
        let mission = Mission {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal.id,
            status: MissionStatus::Running,
            created_at,
            completed_at: None,
        };
        db.insert_mission(&mission).expect("insert mission");
        mission
    }

    fn seeded_step(
        db: &OpsDatabase,
        mission_id: &str,
        status: StepStatus,
        reserved_at: Option<DateTime<Utc>>,
    ) -> Step {
        let step = Step {
            id: uuid::Uuid::new_v4().to_string(),
            mission_id: mission_id.to_string(),
            kind: StepKind::Crawl,
            params: serde_json::json!({}),
            status,
            reserved_by: reserved_at.map(|_| "worker-gone".to_string()),
            reserved_at,
            result: None,
            last_error: None,
            created_at: reserved_at.unwrap_or_else(Utc::now),
        };
        db.insert_step(&step).expect("insert step");
        step
    }

    #[test]
    fn stale_step_is_failed_and_mission_finalized() {
        let path = temp_db_path("stale_recovery");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let mission = seeded_mission(&db, Action::Crawl, now - Duration::hours(1));
        let step = seeded_step(
            &db,
            &mission.id,
            StepStatus::Running,
            Some(now - Duration::minutes(31)),
        );

        let sweeper = sweeper_with(db.clone());
        let report = sweeper.recover_stale_steps(now).expect("recover");
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].step_id, step.id);

        let failed = db.get_step(&step.id).expect("get step").expect("step");
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed
            .last_error
            .as_deref()
            .expect("error recorded")
            .starts_with("Stale:"));

        let finalized = db
            .get_mission(&mission.id)
            .expect("get mission")
            .expect("mission");
        assert_eq!(finalized.status, MissionStatus::Failed);

        let events = db.recent_events(10).expect("events");
        assert!(events.iter().any(|e| e.kind == "step_stale_recovered"));

        // Second pass finds nothing left to recover.
        let again = sweeper.recover_stale_steps(now).expect("second recover");
        assert!(again.recovered.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fresh_running_step_is_left_alone() {
        let path = temp_db_path("fresh_step");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let mission = seeded_mission(&db, Action::Crawl, now);
        seeded_step(
            &db,
            &mission.id,
            StepStatus::Running,
            Some(now - Duration::minutes(5)),
        );

        let sweeper = sweeper_with(db.clone());
        let report = sweeper.recover_stale_steps(now).expect("recover");
        assert!(report.recovered.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stepless_mission_is_orphaned() {
        let path = temp_db_path("orphan_no_steps");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let mission = seeded_mission(&db, Action::Crawl, now - Duration::hours(2));

        let sweeper = sweeper_with(db.clone());
        let report = sweeper.recover_orphaned_missions(now).expect("recover");
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].reason, "no_steps");

        let failed = db
            .get_mission(&mission.id)
            .expect("get mission")
            .expect("mission");
        assert_eq!(failed.status, MissionStatus::Failed);

        let events = db.recent_events(10).expect("events");
        assert!(events.iter().any(|e| e.kind == "mission_orphaned"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn never_claimed_mission_fails_all_steps() {
        let path = temp_db_path("orphan_never_claimed");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let mission = seeded_mission(&db, Action::GatherIntel, now - Duration::hours(2));
        seeded_step(&db, &mission.id, StepStatus::Queued, None);
        seeded_step(&db, &mission.id, StepStatus::Queued, None);

        let sweeper = sweeper_with(db.clone());
        let report = sweeper.recover_orphaned_missions(now).expect("recover");
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.recovered[0].reason, "never_claimed");

        let steps = db.steps_for_mission(&mission.id).expect("steps");
        assert!(steps.iter().all(|s| s.status == StepStatus::Failed));

        // Idempotent: the mission is terminal now, nothing more to do.
        let again = sweeper.recover_orphaned_missions(now).expect("second recover");
        assert!(again.recovered.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missions_with_progress_are_not_orphaned() {
        let path = temp_db_path("orphan_progress");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let mission = seeded_mission(&db, Action::GatherIntel, now - Duration::hours(2));
        seeded_step(&db, &mission.id, StepStatus::Succeeded, None);
        seeded_step(&db, &mission.id, StepStatus::Queued, None);

        let sweeper = sweeper_with(db.clone());
        let report = sweeper.recover_orphaned_missions(now).expect("recover");
        assert!(report.recovered.is_empty());

        let kept = db
            .get_mission(&mission.id)
            .expect("get mission")
            .expect("mission");
        assert_eq!(kept.status, MissionStatus::Running);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn health_thresholds_map_counts_to_statuses() {
        let path = temp_db_path("health_thresholds");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let now = Utc::now();
        let sweeper = sweeper_with(db.clone());

        let health = sweeper.system_health(now).expect("health");
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.queue_depth, 0);

        let mission = seeded_mission(&db, Action::Crawl, now);
        for _ in 0..6 {
            seeded_step(
                &db,
                &mission.id,
                StepStatus::Running,
                Some(now - Duration::hours(1)),
            );
        }
        let degraded = sweeper.system_health(now).expect("health");
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(degraded.stale_steps, 6);

        for _ in 0..5 {
            seeded_step(
                &db,
                &mission.id,
                StepStatus::Running,
                Some(now - Duration::hours(1)),
            );
        }
        let critical = sweeper.system_health(now).expect("health");
        assert_eq!(critical.status, HealthStatus::Critical);

        let _ = std::fs::remove_file(&path);
    }
}
