//! Admission control: the single entry point turning an agent's intent into
//! a proposal. Enforces the per-agent daily cap and per-action gates, applies
//! the auto-approve policy, and hands accepted proposals to the scheduler.
//!
//! Every rejection persists a rejected proposal row and emits an event before
//! returning, so rejection volume stays auditable. Cap counting is
//! read-then-write: under heavy concurrent submission from one agent the cap
//! may overshoot by at most the number of in-flight submissions.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::actions::Action;
use crate::database::{Mission, OpsDatabase, Priority, Proposal, ProposalStatus};
use crate::missions::MissionScheduler;
use crate::policy::PolicyStore;
use crate::reactions::reaction_depth_of;

/// One submission, from any source (API, trigger, reaction).
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source: String,
    pub agent: String,
    pub action: Action,
    pub params: Value,
    pub priority: Priority,
}

/// What happened to a submission. A rejection is an expected outcome, not an
/// error: `Err` is reserved for store failures.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub proposal: Option<Proposal>,
    pub rejected: bool,
    pub reason: Option<String>,
    pub auto_approved: bool,
    pub mission: Option<Mission>,
}

pub struct AdmissionControl {
    db: Arc<OpsDatabase>,
    policy: PolicyStore,
    scheduler: Arc<MissionScheduler>,
}

impl AdmissionControl {
    pub fn new(
        db: Arc<OpsDatabase>,
        policy: PolicyStore,
        scheduler: Arc<MissionScheduler>,
    ) -> Self {
        Self {
            db,
            policy,
            scheduler,
        }
    }

    /// Gate a submission and persist the verdict. Checks run in order and
    /// short-circuit on the first failure; policy is read fresh on every
    /// call.
    pub fn submit(&self, request: SubmitRequest, now: DateTime<Utc>) -> Result<SubmitOutcome> {
        // 1. Per-agent daily cap.
        let day_start = day_start(now);
        let daily_count = self
            .db
            .count_proposals_for_agent_since(&request.agent, day_start)?;
        let agent_limit = self.policy.agent_daily_limit(&request.agent)?;
        if daily_count >= agent_limit {
            let reason = format!(
                "Daily proposal limit reached for {} ({}/{})",
                request.agent, daily_count, agent_limit
            );
            return self.reject(request, reason, now);
        }

        // 2. Action-specific gate.
        if let Some(reason) = self.check_action_gate(request.action, now)? {
            return self.reject(request, reason, now);
        }

        // 3. Auto-approve evaluation.
        let auto_approved = self
            .policy
            .auto_approve()?
            .allows(&request.agent, request.action);

        // 4. Persist + event.
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            source: request.source.clone(),
            agent: request.agent.clone(),
            action: request.action,
            params: request.params.clone(),
            priority: request.priority,
            status: if auto_approved {
                ProposalStatus::Accepted
            } else {
                ProposalStatus::Pending
            },
            rejection_reason: None,
            created_at: now,
        };
        self.db.insert_proposal(&proposal)?;

        self.db.insert_event(
            "system",
            "proposal_created",
            &["proposal".to_string(), "created".to_string()],
            serde_json::json!({
                "proposal_id": proposal.id.clone(),
                "agent": proposal.agent.clone(),
                "action": proposal.action.as_str(),
                "auto_approved": auto_approved,
                "source_type": proposal.source.clone(),
                "reaction_depth": reaction_depth_of(&proposal.params),
            }),
            now,
        )?;

        // 5. Auto-approved work starts immediately.
        let mission = if auto_approved {
            Some(self.scheduler.create_from_proposal(&proposal, now)?)
        } else {
            None
        };

        Ok(SubmitOutcome {
            proposal: Some(proposal),
            rejected: false,
            reason: None,
            auto_approved,
            mission,
        })
    }

    /// Administrative accept/reject of a pending proposal. Accepting runs
    /// the same mission-creation path as auto-approval; the transition out of
    /// `pending` happens exactly once.
    pub fn update_proposal_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Proposal> {
        let proposal = self
            .db
            .get_proposal(proposal_id)?
            .with_context(|| format!("Unknown proposal '{}'", proposal_id))?;

        match status {
            ProposalStatus::Pending => bail!("Cannot move a proposal back to pending"),
            ProposalStatus::Accepted => {
                if !self
                    .db
                    .transition_pending_proposal(proposal_id, ProposalStatus::Accepted, None)?
                {
                    bail!(
                        "Proposal '{}' is not pending (status: {:?})",
                        proposal_id,
                        proposal.status
                    );
                }
                let mut updated = proposal;
                updated.status = ProposalStatus::Accepted;
                self.scheduler.create_from_proposal(&updated, now)?;
                self.db.insert_event(
                    "system",
                    "proposal_accepted",
                    &["proposal".to_string(), "accepted".to_string()],
                    serde_json::json!({
                        "proposal_id": proposal_id,
                        "agent": updated.agent.clone(),
                        "action": updated.action.as_str(),
                    }),
                    now,
                )?;
                Ok(updated)
            }
            ProposalStatus::Rejected => {
                if !self.db.transition_pending_proposal(
                    proposal_id,
                    ProposalStatus::Rejected,
                    reason,
                )? {
                    bail!(
                        "Proposal '{}' is not pending (status: {:?})",
                        proposal_id,
                        proposal.status
                    );
                }
                let mut updated = proposal;
                updated.status = ProposalStatus::Rejected;
                updated.rejection_reason = reason.map(str::to_string);
                self.db.insert_event(
                    "system",
                    "proposal_rejected",
                    &["proposal".to_string(), "rejected".to_string()],
                    serde_json::json!({
                        "proposal_id": proposal_id,
                        "agent": updated.agent.clone(),
                        "action": updated.action.as_str(),
                        "reason": reason,
                    }),
                    now,
                )?;
                Ok(updated)
            }
        }
    }

    /// Evaluate the action's registered cap gate, if any. `Some(reason)`
    /// means the gate rejects. Each gate reads its quota window from policy
    /// and counts completed executions inside that window.
    fn check_action_gate(&self, action: Action, now: DateTime<Utc>) -> Result<Option<String>> {
        let day_start = day_start(now);
        match action {
            Action::PostTweet => {
                if !self.policy.autopost_enabled()? {
                    return Ok(Some("x_autopost disabled".to_string()));
                }
                let limit = self.policy.tweet_daily_quota()?;
                let count = self
                    .db
                    .count_successful_action_runs_since("post_tweet", day_start)?;
                if count >= limit {
                    return Ok(Some(format!(
                        "Daily tweet quota reached ({}/{})",
                        count, limit
                    )));
                }
                Ok(None)
            }
            Action::WriteContent => {
                let limit = self.policy.content_daily_quota()?;
                let count = self
                    .db
                    .count_successful_action_runs_since("write_content", day_start)?;
                if count >= limit {
                    return Ok(Some(format!(
                        "Daily content quota reached ({}/{})",
                        count, limit
                    )));
                }
                Ok(None)
            }
            Action::Deploy => {
                if !self.policy.deploy_enabled()? {
                    return Ok(Some("Deploys disabled by policy".to_string()));
                }
                Ok(None)
            }
            Action::Crawl => {
                let limit = self.policy.crawl_hourly_quota()?;
                let one_hour_ago = now - Duration::hours(1);
                let count = self
                    .db
                    .count_successful_action_runs_since("crawl", one_hour_ago)?;
                if count >= limit {
                    return Ok(Some(format!(
                        "Hourly crawl quota reached ({}/{})",
                        count, limit
                    )));
                }
                Ok(None)
            }
            Action::DraftTweet => {
                let limit = self.policy.draft_daily_quota()?;
                let count = self
                    .db
                    .count_successful_action_runs_since("draft_tweet", day_start)?;
                if count >= limit {
                    return Ok(Some(format!(
                        "Daily draft quota reached ({}/{})",
                        count, limit
                    )));
                }
                Ok(None)
            }
            // Analyze and the composite actions carry no gate of their own.
            _ => Ok(None),
        }
    }

    /// Persist the rejected proposal, emit the audit event, and return the
    /// rejection outcome. The rejected row is always written before the
    /// rejection is reported.
    fn reject(
        &self,
        request: SubmitRequest,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            source: request.source.clone(),
            agent: request.agent.clone(),
            action: request.action,
            params: request.params.clone(),
            priority: request.priority,
            status: ProposalStatus::Rejected,
            rejection_reason: Some(reason.clone()),
            created_at: now,
        };
        self.db.insert_proposal(&proposal)?;

        self.db.insert_event(
            "system",
            "proposal_rejected",
            &["proposal".to_string(), "rejected".to_string()],
            serde_json::json!({
                "agent": request.agent.clone(),
                "action": request.action.as_str(),
                "reason": reason.clone(),
            }),
            now,
        )?;

        tracing::info!(
            "Rejected proposal from {} for {}: {}",
            request.agent,
            request.action.as_str(),
            reason
        );

        Ok(SubmitOutcome {
            proposal: Some(proposal),
            rejected: true,
            reason: Some(reason),
            auto_approved: false,
            mission: None,
        })
    }
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::StepKind;
    use crate::database::{ActionRun, MissionStatus};
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("opsforge_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    fn build(db: Arc<OpsDatabase>) -> AdmissionControl {
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        AdmissionControl::new(db.clone(), PolicyStore::new(db), scheduler)
    }

    fn request(agent: &str, action: Action) -> SubmitRequest {
        SubmitRequest {
            source: "api".to_string(),
            agent: agent.to_string(),
            action,
            params: serde_json::json!({}),
            priority: Priority::Normal,
        }
    }

    #[test]
    fn auto_approved_draft_tweet_creates_one_mission_one_step() {
        let path = temp_db_path("auto_approve_draft");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let admission = build(db.clone());

        let outcome = admission
            .submit(request("quill", Action::DraftTweet), Utc::now())
            .expect("submit");

        assert!(!outcome.rejected);
        assert!(outcome.auto_approved);
        let proposal = outcome.proposal.expect("proposal persisted");
        assert_eq!(proposal.status, ProposalStatus::Accepted);

        let mission = outcome.mission.expect("mission created");
        let steps = db.steps_for_mission(&mission.id).expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StepKind::DraftTweet);
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Running)
                .expect("count"),
            1
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn daily_cap_rejects_with_reason_and_event() {
        let path = temp_db_path("daily_cap");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        db.set_policy_value(
            "agent_daily_limits",
            &serde_json::json!({ "default": 1 }),
            Utc::now(),
        )
        .expect("set policy");
        let admission = build(db.clone());

        let first = admission
            .submit(request("scout", Action::Analyze), Utc::now())
            .expect("first submit");
        assert!(!first.rejected);

        let second = admission
            .submit(request("scout", Action::Analyze), Utc::now())
            .expect("second submit");
        assert!(second.rejected);
        let reason = second.reason.expect("reason");
        assert!(reason.contains("Daily proposal limit reached for scout"));

        // The rejection itself is persisted for auditing.
        let rejected = second.proposal.expect("rejected row");
        assert_eq!(rejected.status, ProposalStatus::Rejected);

        let events = db.recent_events(10).expect("events");
        assert!(events.iter().any(|e| e.kind == "proposal_rejected"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn crawl_gate_rejects_at_hourly_quota_without_mission() {
        let path = temp_db_path("crawl_gate");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        db.set_policy_value(
            "crawl_quota",
            &serde_json::json!({ "hourly_limit": 2 }),
            Utc::now(),
        )
        .expect("set policy");

        let now = Utc::now();
        for idx in 0..2 {
            db.insert_action_run(&ActionRun {
                id: format!("run-{}", idx),
                step_id: format!("step-{}", idx),
                action: "crawl".to_string(),
                output: Some(serde_json::json!({})),
                error: None,
                started_at: now,
                completed_at: now,
            })
            .expect("insert run");
        }

        let admission = build(db.clone());
        let outcome = admission
            .submit(request("scout", Action::Crawl), now)
            .expect("submit");

        assert!(outcome.rejected);
        assert!(outcome.reason.expect("reason").contains("quota reached"));
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Running)
                .expect("count"),
            0
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn autopost_disabled_rejects_post_tweet() {
        let path = temp_db_path("autopost_gate");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        db.set_policy_value(
            "x_autopost",
            &serde_json::json!({ "enabled": false }),
            Utc::now(),
        )
        .expect("set policy");
        let admission = build(db.clone());

        let outcome = admission
            .submit(request("xalt", Action::PostTweet), Utc::now())
            .expect("submit");
        assert!(outcome.rejected);
        assert_eq!(outcome.reason.as_deref(), Some("x_autopost disabled"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn non_allowlisted_submission_stays_pending_until_manual_accept() {
        let path = temp_db_path("manual_accept");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let admission = build(db.clone());

        // post_tweet is not in the default auto-approve kinds
        let outcome = admission
            .submit(request("xalt", Action::PostTweet), Utc::now())
            .expect("submit");
        assert!(!outcome.rejected);
        assert!(!outcome.auto_approved);
        let proposal = outcome.proposal.expect("proposal");
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert!(outcome.mission.is_none());

        let accepted = admission
            .update_proposal_status(&proposal.id, ProposalStatus::Accepted, None, Utc::now())
            .expect("manual accept");
        assert_eq!(accepted.status, ProposalStatus::Accepted);
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Running)
                .expect("count"),
            1
        );

        // A second accept must not create a second mission.
        assert!(admission
            .update_proposal_status(&proposal.id, ProposalStatus::Accepted, None, Utc::now())
            .is_err());
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Running)
                .expect("count"),
            1
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn policy_change_between_submits_changes_the_verdict() {
        let path = temp_db_path("fresh_policy");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let admission = build(db.clone());

        let first = admission
            .submit(request("scout", Action::Crawl), Utc::now())
            .expect("first submit");
        assert!(first.auto_approved);

        db.set_policy_value(
            "auto_approve",
            &serde_json::json!({ "enabled": false }),
            Utc::now(),
        )
        .expect("set policy");

        let second = admission
            .submit(request("scout", Action::Crawl), Utc::now())
            .expect("second submit");
        assert!(!second.auto_approved);
        assert_eq!(
            second.proposal.expect("proposal").status,
            ProposalStatus::Pending
        );

        let _ = std::fs::remove_file(&path);
    }
}
