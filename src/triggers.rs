//! Time- and condition-based trigger rules. Each pass walks the rule table
//! under a wall-clock budget, skips rules still cooling down, evaluates the
//! rule's condition against recent events and missions, and submits matching
//! proposals through admission control.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::actions::Action;
use crate::admission::{AdmissionControl, SubmitRequest};
use crate::chance::RandomSource;
use crate::config::OpsConfig;
use crate::database::{OpsDatabase, Priority};

/// Engagement ratio above which a posted tweet is considered viral.
const VIRAL_ENGAGEMENT_THRESHOLD: f64 = 0.05;
/// Upvotes required before an insight is worth promoting.
const INSIGHT_PROMOTION_UPVOTES: u64 = 3;
/// Minutes past the scheduled hour during which a scheduled rule may fire.
const SCHEDULE_WINDOW_MINUTES: u32 = 5;

#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub id: &'static str,
    pub name: &'static str,
    pub agent: &'static str,
    pub action: Action,
    pub cooldown: Duration,
    pub priority: Priority,
    /// Jitter for scheduled rules: chance that a passing evaluation is
    /// skipped this tick, so cron-aligned callers don't fire on the exact
    /// same minute every period.
    pub skip_probability: f64,
}

pub fn builtin_rules() -> Vec<TriggerRule> {
    vec![
        TriggerRule {
            id: "viral_tweet_analysis",
            name: "Viral Tweet Analysis",
            agent: "scout",
            action: Action::AnalyzeViralContent,
            cooldown: Duration::hours(2),
            priority: Priority::High,
            skip_probability: 0.0,
        },
        TriggerRule {
            id: "mission_failure_diagnosis",
            name: "Mission Failure Diagnosis",
            agent: "sage",
            action: Action::DiagnoseFailure,
            cooldown: Duration::hours(1),
            priority: Priority::High,
            skip_probability: 0.0,
        },
        TriggerRule {
            id: "content_quality_review",
            name: "Content Quality Review",
            agent: "observer",
            action: Action::ReviewContent,
            cooldown: Duration::hours(2),
            priority: Priority::Normal,
            skip_probability: 0.0,
        },
        TriggerRule {
            id: "insight_promotion",
            name: "Insight Promotion",
            agent: "sage",
            action: Action::PromoteInsight,
            cooldown: Duration::hours(4),
            priority: Priority::Low,
            skip_probability: 0.0,
        },
        TriggerRule {
            id: "daily_intel_scan",
            name: "Daily Intel Scan",
            agent: "scout",
            action: Action::GatherIntel,
            // daily with buffer
            cooldown: Duration::hours(20),
            priority: Priority::Normal,
            skip_probability: 0.25,
        },
        TriggerRule {
            id: "weekly_strategy_review",
            name: "Weekly Strategy Review",
            agent: "sage",
            action: Action::StrategicAnalysis,
            cooldown: Duration::days(6),
            priority: Priority::Normal,
            skip_probability: 0.25,
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerFire {
    pub trigger_id: String,
    pub trigger_name: String,
    pub proposal_id: Option<String>,
    pub auto_approved: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TriggerReport {
    pub evaluated: usize,
    pub fired: Vec<TriggerFire>,
    pub timed_out: bool,
}

pub struct TriggerEvaluator {
    db: Arc<OpsDatabase>,
    admission: Arc<AdmissionControl>,
    rng: Arc<dyn RandomSource>,
    budget: std::time::Duration,
}

impl TriggerEvaluator {
    pub fn new(
        db: Arc<OpsDatabase>,
        admission: Arc<AdmissionControl>,
        rng: Arc<dyn RandomSource>,
        config: &OpsConfig,
    ) -> Self {
        Self {
            db,
            admission,
            rng,
            budget: std::time::Duration::from_millis(config.trigger_budget_ms),
        }
    }

    /// One evaluation pass over the rule table. A rule whose condition check
    /// fails is logged and skipped; a rejected submission is not an error.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<TriggerReport> {
        let started = std::time::Instant::now();
        let mut report = TriggerReport::default();

        for rule in builtin_rules() {
            if started.elapsed() > self.budget {
                tracing::warn!("Trigger evaluation hit its time budget, stopping early");
                report.timed_out = true;
                break;
            }
            report.evaluated += 1;

            if let Some(last) = self.db.last_trigger_fire(rule.id)? {
                if now - last < rule.cooldown {
                    continue;
                }
            }

            let extra_params = match self.evaluate_condition(&rule, now) {
                Ok(Some(params)) => params,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Condition check for trigger '{}' failed: {}", rule.id, e);
                    continue;
                }
            };

            if rule.skip_probability > 0.0 && self.rng.roll() < rule.skip_probability {
                tracing::debug!("Jitter skipped trigger '{}' this pass", rule.id);
                continue;
            }

            // Record the firing time before submitting, so a submission that
            // gets rejected still consumes the cooldown.
            self.db.record_trigger_fire(rule.id, now)?;

            let mut params = serde_json::json!({
                "trigger_id": rule.id,
                "trigger_name": rule.name,
            });
            if let (Some(base), Some(extra)) = (params.as_object_mut(), extra_params.as_object()) {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
            }

            let outcome = self.admission.submit(
                SubmitRequest {
                    source: "trigger".to_string(),
                    agent: rule.agent.to_string(),
                    action: rule.action,
                    params,
                    priority: rule.priority,
                },
                now,
            )?;

            if outcome.rejected {
                tracing::debug!(
                    "Trigger '{}' submission rejected: {:?}",
                    rule.id,
                    outcome.reason
                );
                continue;
            }

            report.fired.push(TriggerFire {
                trigger_id: rule.id.to_string(),
                trigger_name: rule.name.to_string(),
                proposal_id: outcome.proposal.map(|p| p.id),
                auto_approved: outcome.auto_approved,
            });
        }

        Ok(report)
    }

    /// Evaluate one rule's condition. `Some(params)` means the rule should
    /// fire; the params identify the matched entity so later passes (and
    /// other submitters) can detect the duplicate.
    fn evaluate_condition(&self, rule: &TriggerRule, now: DateTime<Utc>) -> Result<Option<Value>> {
        match rule.id {
            "viral_tweet_analysis" => self.check_viral_tweet(now),
            "mission_failure_diagnosis" => self.check_failed_missions(now),
            "content_quality_review" => self.check_new_content(now),
            "insight_promotion" => self.check_promotable_insights(now),
            "daily_intel_scan" => self.check_daily_schedule(rule.id, 4, now),
            "weekly_strategy_review" => {
                self.check_weekly_schedule(rule.id, chrono::Weekday::Mon, 9, now)
            }
            _ => Ok(None),
        }
    }

    /// A tweet posted in the last two hours crossed the engagement threshold
    /// and nobody proposed analyzing it yet.
    fn check_viral_tweet(&self, now: DateTime<Utc>) -> Result<Option<Value>> {
        let since = now - Duration::hours(2);
        let events = self.db.events_of_kind_since("tweet_posted", since, 10)?;

        for event in events {
            let engagement = event
                .data
                .get("engagement")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            if engagement <= VIRAL_ENGAGEMENT_THRESHOLD {
                continue;
            }
            if !self.db.proposal_exists_with_param(
                Action::AnalyzeViralContent,
                "event_id",
                &event.id,
                since,
            )? {
                return Ok(Some(serde_json::json!({ "event_id": event.id })));
            }
        }
        Ok(None)
    }

    /// A mission failed in the last hour and no diagnosis proposal carries
    /// its id yet.
    fn check_failed_missions(&self, now: DateTime<Utc>) -> Result<Option<Value>> {
        let since = now - Duration::hours(1);
        let failed = self.db.recent_failed_missions(since, 5)?;

        for mission in failed {
            if !self.db.proposal_exists_with_param(
                Action::DiagnoseFailure,
                "mission_id",
                &mission.id,
                since,
            )? {
                return Ok(Some(serde_json::json!({ "mission_id": mission.id })));
            }
        }
        Ok(None)
    }

    /// Content was published in the last two hours without a review.
    fn check_new_content(&self, now: DateTime<Utc>) -> Result<Option<Value>> {
        let since = now - Duration::hours(2);
        let published = self.db.events_of_kind_since("content_published", since, 5)?;

        for event in published {
            if !self.db.proposal_exists_with_param(
                Action::ReviewContent,
                "event_id",
                &event.id,
                since,
            )? {
                return Ok(Some(serde_json::json!({ "event_id": event.id })));
            }
        }
        Ok(None)
    }

    /// An insight gathered enough upvotes to be worth promoting.
    fn check_promotable_insights(&self, now: DateTime<Utc>) -> Result<Option<Value>> {
        let since = now - Duration::hours(4);
        let upvoted = self.db.events_of_kind_since("insight_upvoted", since, 10)?;

        for event in upvoted {
            let upvotes = event
                .data
                .get("upvotes")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if upvotes < INSIGHT_PROMOTION_UPVOTES {
                continue;
            }
            if !self.db.proposal_exists_with_param(
                Action::PromoteInsight,
                "event_id",
                &event.id,
                since,
            )? {
                return Ok(Some(serde_json::json!({ "event_id": event.id })));
            }
        }
        Ok(None)
    }

    /// It is the scheduled hour (within the window) and the rule has not
    /// fired yet today.
    fn check_daily_schedule(
        &self,
        trigger_id: &str,
        target_hour: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        if now.hour() != target_hour || now.minute() > SCHEDULE_WINDOW_MINUTES {
            return Ok(None);
        }
        if let Some(last) = self.db.last_trigger_fire(trigger_id)? {
            if last.date_naive() == now.date_naive() {
                return Ok(None);
            }
        }
        Ok(Some(serde_json::json!({})))
    }

    /// It is the scheduled weekday and hour, and the rule has not fired yet
    /// this ISO week.
    fn check_weekly_schedule(
        &self,
        trigger_id: &str,
        target_day: chrono::Weekday,
        target_hour: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        if now.weekday() != target_day
            || now.hour() != target_hour
            || now.minute() > SCHEDULE_WINDOW_MINUTES
        {
            return Ok(None);
        }
        if let Some(last) = self.db.last_trigger_fire(trigger_id)? {
            if last.iso_week() == now.iso_week() {
                return Ok(None);
            }
        }
        Ok(Some(serde_json::json!({})))
    }
}
