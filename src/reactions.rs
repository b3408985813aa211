//! Spontaneous inter-agent reactions: recent events are matched against a
//! pattern table and, per match, a weighted coin decides whether the target
//! agent proposes a follow-up through admission control.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::actions::Action;
use crate::admission::{AdmissionControl, SubmitRequest};
use crate::chance::RandomSource;
use crate::config::OpsConfig;
use crate::database::{Event, OpsDatabase, Priority};
use crate::policy::PolicyStore;

/// One row of the reaction matrix. `source` filters the triggering agent
/// (`*` matches anyone); every tag must appear in the event's tags or its
/// kind. The wire shape matches the `reaction_matrix` policy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPattern {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub target: String,
    #[serde(rename = "type")]
    pub action: String,
    pub probability: f64,
    /// Minutes between fires of this pattern.
    pub cooldown: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ReactionPattern {
    fn matches(&self, event: &Event) -> bool {
        if self.source != "*" && self.source != event.source {
            return false;
        }
        self.tags
            .iter()
            .all(|tag| event.tags.iter().any(|t| t == tag) || event.kind.contains(tag.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionMatrix {
    pub patterns: Vec<ReactionPattern>,
}

impl Default for ReactionMatrix {
    fn default() -> Self {
        let pattern = |id: &str,
                       source: &str,
                       tags: &[&str],
                       target: &str,
                       action: &str,
                       probability: f64,
                       cooldown: i64,
                       description: &str| ReactionPattern {
            id: id.to_string(),
            source: source.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            target: target.to_string(),
            action: action.to_string(),
            probability,
            cooldown,
            description: Some(description.to_string()),
        };

        Self {
            patterns: vec![
                pattern(
                    "tweet_analyze",
                    "xalt",
                    &["tweet", "posted"],
                    "scout",
                    "analyze_viral_content",
                    0.3,
                    120,
                    "Xalt posts tweet -> 30% chance Scout analyzes performance",
                ),
                pattern(
                    "failure_diagnose",
                    "*",
                    &["mission", "failed"],
                    "sage",
                    "diagnose_failure",
                    1.0,
                    60,
                    "Any mission fails -> Sage diagnoses (100%)",
                ),
                pattern(
                    "content_review",
                    "quill",
                    &["content", "published"],
                    "observer",
                    "review_content",
                    0.5,
                    30,
                    "Quill publishes content -> 50% chance Observer reviews",
                ),
                pattern(
                    "intel_report",
                    "scout",
                    &["intel", "gathered"],
                    "sage",
                    "strategic_analysis",
                    0.4,
                    60,
                    "Scout gathers intel -> 40% chance Sage strategizes",
                ),
                pattern(
                    "decision_support",
                    "minion",
                    &["decision", "pending"],
                    "sage",
                    "strategic_analysis",
                    0.6,
                    30,
                    "Minion has pending decision -> 60% chance Sage advises",
                ),
            ],
        }
    }
}

/// How many reaction hops produced this payload. Proposals and events carry
/// the depth forward so chains can be bounded.
pub fn reaction_depth_of(data: &Value) -> u32 {
    data.get("reaction_depth")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionFire {
    pub event_id: String,
    pub pattern_id: String,
    pub target_agent: String,
    pub action: String,
    pub proposal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ReactionReport {
    pub scanned: usize,
    pub fired: Vec<ReactionFire>,
    pub timed_out: bool,
}

pub struct ReactionEngine {
    db: Arc<OpsDatabase>,
    admission: Arc<AdmissionControl>,
    policy: PolicyStore,
    rng: Arc<dyn RandomSource>,
    lookback: Duration,
    batch_limit: usize,
    budget: std::time::Duration,
    max_depth: u32,
}

impl ReactionEngine {
    pub fn new(
        db: Arc<OpsDatabase>,
        admission: Arc<AdmissionControl>,
        policy: PolicyStore,
        rng: Arc<dyn RandomSource>,
        config: &OpsConfig,
    ) -> Self {
        Self {
            db,
            admission,
            policy,
            rng,
            lookback: Duration::seconds(config.reaction_lookback_secs as i64),
            batch_limit: config.reaction_batch_limit,
            budget: std::time::Duration::from_millis(config.reaction_budget_ms),
            max_depth: config.max_reaction_depth,
        }
    }

    /// One reaction pass over recent events, bounded by the wall-clock
    /// budget. The cooldown row for a pattern is only written when its
    /// submission was not rejected, so a quota-blocked reaction can retry on
    /// the next pass.
    pub fn process(&self, now: DateTime<Utc>) -> Result<ReactionReport> {
        let matrix = self.policy.reaction_matrix()?;
        let events = self.db.events_since(now - self.lookback, self.batch_limit)?;
        let started = std::time::Instant::now();

        let mut report = ReactionReport {
            scanned: events.len(),
            ..Default::default()
        };

        for event in &events {
            if started.elapsed() > self.budget {
                tracing::warn!("Reaction pass hit its time budget, stopping early");
                report.timed_out = true;
                break;
            }

            let depth = reaction_depth_of(&event.data);
            if depth >= self.max_depth {
                tracing::debug!(
                    "Skipping event {} at reaction depth {} (bound {})",
                    event.id,
                    depth,
                    self.max_depth
                );
                continue;
            }

            for pattern in &matrix.patterns {
                if !pattern.matches(event) {
                    continue;
                }

                if let Some(last) = self.db.last_reaction_fire(&pattern.id)? {
                    if now - last < Duration::minutes(pattern.cooldown) {
                        continue;
                    }
                }

                if self.rng.roll() >= pattern.probability {
                    continue;
                }

                let Some(action) = Action::parse(&pattern.action) else {
                    tracing::warn!(
                        "Reaction pattern '{}' names unknown action '{}', skipping",
                        pattern.id,
                        pattern.action
                    );
                    continue;
                };

                let triggered_by = event
                    .data
                    .get("agent")
                    .and_then(Value::as_str)
                    .unwrap_or(&event.source)
                    .to_string();

                let outcome = self.admission.submit(
                    SubmitRequest {
                        source: "reaction".to_string(),
                        agent: pattern.target.clone(),
                        action,
                        params: serde_json::json!({
                            "source_event_id": event.id.clone(),
                            "source_event_kind": event.kind.clone(),
                            "pattern_id": pattern.id.clone(),
                            "triggered_by": triggered_by,
                            "reaction_depth": depth + 1,
                        }),
                        priority: Priority::Normal,
                    },
                    now,
                )?;

                if outcome.rejected {
                    tracing::debug!(
                        "Reaction '{}' rejected at admission: {:?}",
                        pattern.id,
                        outcome.reason
                    );
                    continue;
                }

                self.db.record_reaction_fire(&pattern.id, now)?;
                report.fired.push(ReactionFire {
                    event_id: event.id.clone(),
                    pattern_id: pattern.id.clone(),
                    target_agent: pattern.target.clone(),
                    action: pattern.action.clone(),
                    proposal_id: outcome.proposal.map(|p| p.id),
                });
            }
        }

        Ok(report)
    }
}
