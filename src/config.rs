use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Runtime configuration for the orchestration daemon.
///
/// Loaded from `opsforge_config.toml` next to the executable, falling back to
/// environment variables. Every field has a default so a bare binary starts
/// with sane behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Bind address for the HTTP API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Identity this process uses when claiming steps.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// How many worker loops to run inside this process.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Seconds between worker polls for queued steps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds between internal control-loop ticks. The `/v1/heartbeat`
    /// endpoint runs the same tick for external cron callers.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Whether this process drives the control loop itself. Disable when an
    /// external scheduler owns the heartbeat cadence.
    #[serde(default = "default_internal_heartbeat")]
    pub internal_heartbeat: bool,

    /// Wall-clock budget for one trigger-evaluation pass.
    #[serde(default = "default_trigger_budget")]
    pub trigger_budget_ms: u64,

    /// Wall-clock budget for one reaction-processing pass.
    #[serde(default = "default_reaction_budget")]
    pub reaction_budget_ms: u64,

    /// How far back the reaction engine looks for unprocessed events.
    #[serde(default = "default_reaction_lookback")]
    pub reaction_lookback_secs: u64,

    /// Maximum number of events examined per reaction pass.
    #[serde(default = "default_reaction_batch")]
    pub reaction_batch_limit: usize,

    /// How many reaction hops a single event chain may travel before the
    /// engine stops reacting to its descendants.
    #[serde(default = "default_max_reaction_depth")]
    pub max_reaction_depth: u32,
}

fn default_database_path() -> String {
    "opsforge.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_worker_id() -> String {
    format!("opsforge-{}", std::process::id())
}

fn default_worker_count() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_internal_heartbeat() -> bool {
    true
}

fn default_trigger_budget() -> u64 {
    4000
}

fn default_reaction_budget() -> u64 {
    3000
}

fn default_reaction_lookback() -> u64 {
    300
}

fn default_reaction_batch() -> usize {
    50
}

fn default_max_reaction_depth() -> u32 {
    2
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
            worker_id: default_worker_id(),
            worker_count: default_worker_count(),
            poll_interval_secs: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            internal_heartbeat: default_internal_heartbeat(),
            trigger_budget_ms: default_trigger_budget(),
            reaction_budget_ms: default_reaction_budget(),
            reaction_lookback_secs: default_reaction_lookback(),
            reaction_batch_limit: default_reaction_batch(),
            max_reaction_depth: default_max_reaction_depth(),
        }
    }
}

impl OpsConfig {
    fn get_base_dir() -> PathBuf {
        env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn config_path() -> PathBuf {
        Self::get_base_dir().join("opsforge_config.toml")
    }

    /// Load config from file, falling back to env vars + defaults.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<OpsConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable).
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(())
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = env::var("OPSFORGE_DATABASE") {
            config.database_path = path;
        }
        if let Ok(addr) = env::var("OPSFORGE_BIND") {
            config.bind_addr = addr;
        }
        if let Ok(id) = env::var("OPSFORGE_WORKER_ID") {
            config.worker_id = id;
        }
        if let Ok(raw) = env::var("OPSFORGE_WORKER_COUNT") {
            if let Ok(count) = raw.parse() {
                config.worker_count = count;
            }
        }
        if let Ok(raw) = env::var("OPSFORGE_POLL_INTERVAL_SECS") {
            if let Ok(secs) = raw.parse() {
                config.poll_interval_secs = secs;
            }
        }
        if let Ok(raw) = env::var("OPSFORGE_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = raw.parse() {
                config.heartbeat_interval_secs = secs;
            }
        }
        if let Ok(raw) = env::var("OPSFORGE_INTERNAL_HEARTBEAT") {
            config.internal_heartbeat = !matches!(raw.trim(), "0" | "false" | "off");
        }
        if let Ok(raw) = env::var("OPSFORGE_MAX_REACTION_DEPTH") {
            if let Ok(depth) = raw.parse() {
                config.max_reaction_depth = depth;
            }
        }
        config
    }
}
