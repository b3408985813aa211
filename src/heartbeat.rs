//! The control-loop tick: trigger evaluation, reaction processing, recovery
//! sweeps, and health aggregation, run in sequence with per-subsystem fault
//! isolation. An internal ticker drives it on a fixed cadence; the HTTP
//! heartbeat endpoint runs the same tick for external schedulers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::healing::{OrphanRecoveryReport, StaleRecoveryReport, Sweeper, SystemHealth};
use crate::reactions::{ReactionEngine, ReactionReport};
use crate::triggers::{TriggerEvaluator, TriggerReport};

/// Distinguishes "ran and found nothing to do" from "failed to run". A
/// failed subsystem never aborts its siblings.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TickOutcome<T: Serialize> {
    Ran(T),
    Failed(String),
}

impl<T: Serialize> TickOutcome<T> {
    fn capture(label: &str, result: Result<T>) -> Self {
        match result {
            Ok(value) => TickOutcome::Ran(value),
            Err(e) => {
                tracing::error!("Control-loop subsystem '{}' failed: {:#}", label, e);
                TickOutcome::Failed(format!("{:#}", e))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub triggers: TickOutcome<TriggerReport>,
    pub reactions: TickOutcome<ReactionReport>,
    pub stale_steps: TickOutcome<StaleRecoveryReport>,
    pub orphaned_missions: TickOutcome<OrphanRecoveryReport>,
    pub health: TickOutcome<SystemHealth>,
}

pub struct ControlLoop {
    triggers: TriggerEvaluator,
    reactions: ReactionEngine,
    sweeper: Arc<Sweeper>,
}

impl ControlLoop {
    pub fn new(triggers: TriggerEvaluator, reactions: ReactionEngine, sweeper: Arc<Sweeper>) -> Self {
        Self {
            triggers,
            reactions,
            sweeper,
        }
    }

    /// One full tick. Never returns `Err`: subsystem failures are captured
    /// in the report so the caller always sees what ran.
    pub fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let started = std::time::Instant::now();

        let triggers = TickOutcome::capture("triggers", self.triggers.evaluate(now));
        let reactions = TickOutcome::capture("reactions", self.reactions.process(now));
        let stale_steps =
            TickOutcome::capture("stale_recovery", self.sweeper.recover_stale_steps(now));
        let orphaned_missions = TickOutcome::capture(
            "orphan_recovery",
            self.sweeper.recover_orphaned_missions(now),
        );
        let health = TickOutcome::capture("health", self.sweeper.system_health(now));

        TickReport {
            timestamp: now,
            duration_ms: started.elapsed().as_millis() as u64,
            triggers,
            reactions,
            stale_steps,
            orphaned_missions,
            health,
        }
    }

    /// Drive the tick on a fixed cadence from a dedicated thread.
    pub fn spawn_ticker(self: Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        std::thread::spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_secs(interval_secs.max(1)));
            let report = self.run_tick(Utc::now());
            tracing::debug!(
                "Heartbeat tick finished in {}ms (triggers: {}, reactions: {})",
                report.duration_ms,
                summarize(&report.triggers, |t| t.fired.len()),
                summarize(&report.reactions, |r| r.fired.len()),
            );
        })
    }
}

fn summarize<T: Serialize>(outcome: &TickOutcome<T>, count: impl Fn(&T) -> usize) -> String {
    match outcome {
        TickOutcome::Ran(value) => count(value).to_string(),
        TickOutcome::Failed(_) => "failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionControl;
    use crate::chance::SeqRandom;
    use crate::config::OpsConfig;
    use crate::database::OpsDatabase;
    use crate::healing::HealthStatus;
    use crate::missions::MissionScheduler;
    use crate::policy::PolicyStore;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("opsforge_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn control_loop(db: Arc<OpsDatabase>) -> ControlLoop {
        let config = OpsConfig::default();
        let policy = PolicyStore::new(db.clone());
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        let admission = Arc::new(AdmissionControl::new(
            db.clone(),
            policy.clone(),
            scheduler.clone(),
        ));
        let rng = Arc::new(SeqRandom::always(0.99));
        ControlLoop::new(
            TriggerEvaluator::new(db.clone(), admission.clone(), rng.clone(), &config),
            ReactionEngine::new(db.clone(), admission, policy, rng, &config),
            Arc::new(Sweeper::new(db, scheduler)),
        )
    }

    #[test]
    fn quiet_tick_reports_all_subsystems_ran() {
        let path = temp_db_path("quiet_tick");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let report = control_loop(db).run_tick(Utc::now());

        assert!(matches!(report.triggers, TickOutcome::Ran(ref t) if t.fired.is_empty()));
        assert!(matches!(report.reactions, TickOutcome::Ran(ref r) if r.fired.is_empty()));
        assert!(matches!(report.stale_steps, TickOutcome::Ran(ref s) if s.recovered.is_empty()));
        assert!(
            matches!(report.orphaned_missions, TickOutcome::Ran(ref o) if o.recovered.is_empty())
        );
        assert!(
            matches!(report.health, TickOutcome::Ran(ref h) if h.status == HealthStatus::Healthy)
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tick_report_serializes_with_status_tags() {
        let path = temp_db_path("tick_serialize");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let report = control_loop(db).run_tick(Utc::now());

        let json = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(json["triggers"]["status"], "ran");
        assert_eq!(json["health"]["status"], "ran");
        assert!(json["health"]["detail"]["queue_depth"].is_number());

        let _ = std::fs::remove_file(&path);
    }
}
