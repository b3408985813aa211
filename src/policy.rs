//! Read-through accessors over the mutable policy table.
//!
//! Every accessor reads the store fresh on each call: policy may change
//! between two submissions and the gates must see the change. Missing or
//! malformed entries fall back to the documented defaults rather than
//! failing admission.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::actions::Action;
use crate::database::OpsDatabase;
use crate::reactions::ReactionMatrix;

/// Default per-agent daily proposal cap when `agent_daily_limits` has no
/// entry for the agent and no `default` key.
pub const DEFAULT_AGENT_DAILY_LIMIT: u32 = 50;
/// Default `x_daily_quota.limit`.
pub const DEFAULT_TWEET_DAILY_QUOTA: u32 = 8;
/// Default `content_quota.daily_limit`.
pub const DEFAULT_CONTENT_DAILY_QUOTA: u32 = 5;
/// Default `crawl_quota.hourly_limit`.
pub const DEFAULT_CRAWL_HOURLY_QUOTA: u32 = 20;
/// Default `draft_quota.daily_limit`.
pub const DEFAULT_DRAFT_DAILY_QUOTA: u32 = 20;

/// Which (agent, action) pairs bypass manual review. Policy key
/// `auto_approve`; all three conditions must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprovePolicy {
    #[serde(default = "default_auto_approve_enabled")]
    pub enabled: bool,
    #[serde(default = "default_allowed_step_kinds")]
    pub allowed_step_kinds: Vec<String>,
    #[serde(default = "default_allowed_agents")]
    pub allowed_agents: Vec<String>,
}

fn default_auto_approve_enabled() -> bool {
    true
}

fn default_allowed_step_kinds() -> Vec<String> {
    ["draft_tweet", "crawl", "analyze", "write_content"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_allowed_agents() -> Vec<String> {
    ["minion", "sage", "scout", "quill", "xalt", "observer"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Default for AutoApprovePolicy {
    fn default() -> Self {
        Self {
            enabled: default_auto_approve_enabled(),
            allowed_step_kinds: default_allowed_step_kinds(),
            allowed_agents: default_allowed_agents(),
        }
    }
}

impl AutoApprovePolicy {
    pub fn allows(&self, agent: &str, action: Action) -> bool {
        self.enabled
            && self
                .allowed_step_kinds
                .iter()
                .any(|kind| kind == action.as_str())
            && self.allowed_agents.iter().any(|name| name == agent)
    }
}

/// Thin handle over the policy table.
#[derive(Clone)]
pub struct PolicyStore {
    db: Arc<OpsDatabase>,
}

impl PolicyStore {
    pub fn new(db: Arc<OpsDatabase>) -> Self {
        Self { db }
    }

    fn u32_field(&self, key: &str, field: &str, default: u32) -> Result<u32> {
        let value = self.db.get_policy_value(key)?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get(field))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(default))
    }

    fn bool_field(&self, key: &str, field: &str, default: bool) -> Result<bool> {
        let value = self.db.get_policy_value(key)?;
        Ok(value
            .as_ref()
            .and_then(|v| v.get(field))
            .and_then(Value::as_bool)
            .unwrap_or(default))
    }

    /// `agent_daily_limits`: per-agent cap, falling back to the map's
    /// `default` key, then the built-in default.
    pub fn agent_daily_limit(&self, agent: &str) -> Result<u32> {
        let value = self.db.get_policy_value("agent_daily_limits")?;
        let from_map = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).map(|n| n as u32);
        Ok(value
            .as_ref()
            .and_then(|v| from_map(v, agent).or_else(|| from_map(v, "default")))
            .unwrap_or(DEFAULT_AGENT_DAILY_LIMIT))
    }

    /// `x_autopost.enabled` — master switch for posting tweets.
    pub fn autopost_enabled(&self) -> Result<bool> {
        self.bool_field("x_autopost", "enabled", true)
    }

    /// `x_daily_quota.limit` — posted tweets per UTC day.
    pub fn tweet_daily_quota(&self) -> Result<u32> {
        self.u32_field("x_daily_quota", "limit", DEFAULT_TWEET_DAILY_QUOTA)
    }

    /// `content_quota.daily_limit` — content pieces per UTC day.
    pub fn content_daily_quota(&self) -> Result<u32> {
        self.u32_field("content_quota", "daily_limit", DEFAULT_CONTENT_DAILY_QUOTA)
    }

    /// `deploy_policy.enabled` — whether deploys may be proposed at all.
    pub fn deploy_enabled(&self) -> Result<bool> {
        self.bool_field("deploy_policy", "enabled", true)
    }

    /// `crawl_quota.hourly_limit` — crawls per rolling hour.
    pub fn crawl_hourly_quota(&self) -> Result<u32> {
        self.u32_field("crawl_quota", "hourly_limit", DEFAULT_CRAWL_HOURLY_QUOTA)
    }

    /// `draft_quota.daily_limit` — tweet drafts per UTC day.
    pub fn draft_daily_quota(&self) -> Result<u32> {
        self.u32_field("draft_quota", "daily_limit", DEFAULT_DRAFT_DAILY_QUOTA)
    }

    /// `auto_approve` policy, defaults matching the shipped rule set.
    pub fn auto_approve(&self) -> Result<AutoApprovePolicy> {
        match self.db.get_policy_value("auto_approve")? {
            Some(value) => match serde_json::from_value(value) {
                Ok(policy) => Ok(policy),
                Err(e) => {
                    tracing::warn!("Malformed auto_approve policy, using defaults: {}", e);
                    Ok(AutoApprovePolicy::default())
                }
            },
            None => Ok(AutoApprovePolicy::default()),
        }
    }

    /// `reaction_matrix` policy, or the built-in default matrix.
    pub fn reaction_matrix(&self) -> Result<ReactionMatrix> {
        match self.db.get_policy_value("reaction_matrix")? {
            Some(value) => match serde_json::from_value(value) {
                Ok(matrix) => Ok(matrix),
                Err(e) => {
                    tracing::warn!("Malformed reaction_matrix policy, using defaults: {}", e);
                    Ok(ReactionMatrix::default())
                }
            },
            None => Ok(ReactionMatrix::default()),
        }
    }

    pub fn set_reaction_matrix(&self, matrix: &ReactionMatrix, now: DateTime<Utc>) -> Result<()> {
        let value = serde_json::to_value(matrix)?;
        self.db.set_policy_value("reaction_matrix", &value, now)
    }
}
