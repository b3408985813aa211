//! Mission/step scheduling: expanding an accepted proposal into ordered
//! steps, handing steps to workers through an atomic claim, and finalizing
//! missions once every step is terminal.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::database::{
    ActionRun, Mission, MissionStatus, OpsDatabase, Proposal, Step, StepStatus,
};
use crate::reactions::reaction_depth_of;

/// Result a worker reports for one executed step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success(Value),
    Failure(String),
}

/// Agent/action provenance carried into mission and step events, so the
/// reaction engine can both attribute work and bound reaction chains.
struct MissionContext {
    agent: String,
    action: String,
    reaction_depth: u32,
}

pub struct MissionScheduler {
    db: Arc<OpsDatabase>,
}

impl MissionScheduler {
    pub fn new(db: Arc<OpsDatabase>) -> Self {
        Self { db }
    }

    /// Create the mission and its steps for an accepted proposal.
    ///
    /// Step creation timestamps are spaced 100ms apart so `ORDER BY
    /// created_at` preserves template order.
    pub fn create_from_proposal(
        &self,
        proposal: &Proposal,
        now: DateTime<Utc>,
    ) -> Result<Mission> {
        let mission = Mission {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal.id.clone(),
            status: MissionStatus::Running,
            created_at: now,
            completed_at: None,
        };
        self.db.insert_mission(&mission)?;

        let templates = proposal.action.step_template();
        for (index, template) in templates.iter().enumerate() {
            let step = Step {
                id: uuid::Uuid::new_v4().to_string(),
                mission_id: mission.id.clone(),
                kind: template.kind,
                params: template.step_params(&proposal.params),
                status: StepStatus::Queued,
                reserved_by: None,
                reserved_at: None,
                result: None,
                last_error: None,
                created_at: now + Duration::milliseconds(100 * index as i64),
            };
            self.db.insert_step(&step)?;
        }

        self.db.insert_event(
            "system",
            "mission_created",
            &tags(&["mission", "created", proposal.action.as_str()]),
            serde_json::json!({
                "mission_id": mission.id.clone(),
                "proposal_id": proposal.id.clone(),
                "agent": proposal.agent.clone(),
                "action": proposal.action.as_str(),
                "steps_count": templates.len(),
                "reaction_depth": reaction_depth_of(&proposal.params),
            }),
            now,
        )?;

        tracing::info!(
            "Mission {} created from proposal {} ({} steps)",
            mission.id,
            proposal.id,
            templates.len()
        );
        Ok(mission)
    }

    /// Claim the oldest queued step of any running mission for `worker_id`.
    ///
    /// Losing the claim race returns `Ok(None)`, not an error: another worker
    /// advanced the step between selection and the compare-and-swap.
    pub fn claim_next_step(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Step>> {
        let Some(mut step) = self.db.next_queued_step()? else {
            return Ok(None);
        };

        if !self.db.try_claim_step(&step.id, worker_id, now)? {
            tracing::debug!(
                "Worker {} lost the claim race for step {}",
                worker_id,
                step.id
            );
            return Ok(None);
        }

        step.status = StepStatus::Running;
        step.reserved_by = Some(worker_id.to_string());
        step.reserved_at = Some(now);
        Ok(Some(step))
    }

    /// Record a step's execution outcome and finalize its mission if that
    /// was the last open step.
    ///
    /// Returns false when the step had already left `running` (a competing
    /// outcome or a sweeper recovery got there first); nothing is written in
    /// that case.
    pub fn record_outcome(
        &self,
        step_id: &str,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let step = self
            .db
            .get_step(step_id)?
            .with_context(|| format!("Unknown step '{}'", step_id))?;

        let (status, result, error) = match &outcome {
            StepOutcome::Success(value) => (StepStatus::Succeeded, Some(value), None),
            StepOutcome::Failure(message) => (StepStatus::Failed, None, Some(message.as_str())),
        };

        if !self.db.record_step_result(step_id, status, result, error)? {
            return Ok(false);
        }

        self.db.insert_action_run(&ActionRun {
            id: uuid::Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            action: step.kind.as_str().to_string(),
            output: result.cloned(),
            error: error.map(str::to_string),
            started_at: step.reserved_at.unwrap_or(now),
            completed_at: now,
        })?;

        let context = self.mission_context(&step.mission_id)?;
        let (event_kind, outcome_tag) = match status {
            StepStatus::Succeeded => ("step_succeeded", "success"),
            _ => ("step_failed", "failure"),
        };
        self.db.insert_event(
            "system",
            event_kind,
            &tags(&["step", outcome_tag, step.kind.as_str()]),
            serde_json::json!({
                "step_id": step_id,
                "mission_id": step.mission_id.clone(),
                "kind": step.kind.as_str(),
                "agent": context.agent,
                "action": context.action,
                "error": error,
                "reaction_depth": context.reaction_depth,
            }),
            now,
        )?;

        self.maybe_finalize(&step.mission_id, now)?;
        Ok(true)
    }

    /// Move the mission to its terminal state once every step is terminal:
    /// failed if any step failed, succeeded otherwise. Safe to call at any
    /// time; a mission that is already terminal (or still has open steps) is
    /// left untouched.
    pub fn maybe_finalize(
        &self,
        mission_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MissionStatus>> {
        let steps = self.db.steps_for_mission(mission_id)?;
        if steps.is_empty() {
            return Ok(None);
        }
        if !steps.iter().all(|s| s.status.is_terminal()) {
            return Ok(None);
        }

        let any_failed = steps.iter().any(|s| s.status == StepStatus::Failed);
        let status = if any_failed {
            MissionStatus::Failed
        } else {
            MissionStatus::Succeeded
        };

        if !self.db.finalize_mission(mission_id, status, now)? {
            return Ok(None);
        }

        let context = self.mission_context(mission_id)?;
        let (event_kind, outcome_tag) = match status {
            MissionStatus::Failed => ("mission_failed", "failed"),
            _ => ("mission_succeeded", "succeeded"),
        };
        self.db.insert_event(
            "system",
            event_kind,
            &tags(&["mission", outcome_tag]),
            serde_json::json!({
                "mission_id": mission_id,
                "agent": context.agent,
                "action": context.action,
                "reaction_depth": context.reaction_depth,
            }),
            now,
        )?;

        tracing::info!("Mission {} finalized as {:?}", mission_id, status);
        Ok(Some(status))
    }

    fn mission_context(&self, mission_id: &str) -> Result<MissionContext> {
        let proposal = self
            .db
            .get_mission(mission_id)?
            .map(|mission| self.db.get_proposal(&mission.proposal_id))
            .transpose()?
            .flatten();

        Ok(match proposal {
            Some(proposal) => MissionContext {
                agent: proposal.agent.clone(),
                action: proposal.action.as_str().to_string(),
                reaction_depth: reaction_depth_of(&proposal.params),
            },
            None => MissionContext {
                agent: "system".to_string(),
                action: "unknown".to_string(),
                reaction_depth: 0,
            },
        })
    }
}

fn tags(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|t| t.to_string()).collect()
}
