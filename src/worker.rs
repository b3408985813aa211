//! The worker side of the factory: a poll loop that claims queued steps and
//! dispatches them to registered executors, one per step kind.
//!
//! Many worker instances may run concurrently (in and across processes);
//! exclusivity comes entirely from the claim compare-and-swap, so executors
//! never need their own locking.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::actions::StepKind;
use crate::chance::RandomSource;
use crate::config::OpsConfig;
use crate::database::Step;
use crate::missions::{MissionScheduler, StepOutcome};

/// An executor performs the work of one step kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKind;
    async fn execute(&self, step: &Step) -> Result<Value>;
}

/// Thread-safe registry mapping step kinds to executors.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<StepKind, Arc<dyn StepExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, executor: Arc<dyn StepExecutor>) {
        let kind = executor.kind();
        self.executors.write().await.insert(kind, executor);
    }

    pub async fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.read().await.get(&kind).cloned()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn register_builtin_executors(
    registry: Arc<ExecutorRegistry>,
    rng: Arc<dyn RandomSource>,
) {
    registry.register(Arc::new(CrawlExecutor)).await;
    registry.register(Arc::new(AnalyzeExecutor)).await;
    registry.register(Arc::new(WriteContentExecutor)).await;
    registry
        .register(Arc::new(DraftTweetExecutor { rng }))
        .await;
    registry.register(Arc::new(PostTweetExecutor)).await;
    registry.register(Arc::new(DeployExecutor)).await;

    tracing::info!("Executor registry initialized with 6 built-in executors");
}

/// Crawl is simulated: it reports canned findings for the requested target.
struct CrawlExecutor;

#[async_trait]
impl StepExecutor for CrawlExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Crawl
    }

    async fn execute(&self, step: &Step) -> Result<Value> {
        let target = step
            .params
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("general");
        tracing::debug!("Crawling: {}", target);
        Ok(serde_json::json!({
            "target": target,
            "findings": ["trend_1", "trend_2", "trend_3"],
        }))
    }
}

struct AnalyzeExecutor;

#[async_trait]
impl StepExecutor for AnalyzeExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Analyze
    }

    async fn execute(&self, step: &Step) -> Result<Value> {
        let analysis_type = step
            .params
            .get("analysis_type")
            .and_then(Value::as_str)
            .unwrap_or("general");
        tracing::debug!("Analyzing: {}", analysis_type);
        Ok(serde_json::json!({
            "type": analysis_type,
            "insights": ["insight_1", "insight_2"],
            "confidence": 0.75,
        }))
    }
}

struct WriteContentExecutor;

#[async_trait]
impl StepExecutor for WriteContentExecutor {
    fn kind(&self) -> StepKind {
        StepKind::WriteContent
    }

    async fn execute(&self, step: &Step) -> Result<Value> {
        let format = step
            .params
            .get("output_format")
            .and_then(Value::as_str)
            .unwrap_or("content");
        tracing::debug!("Writing: {}", format);
        let content = format!("Generated {} content", format);
        Ok(serde_json::json!({
            "format": format,
            "word_count": content.split_whitespace().count(),
            "content": content,
        }))
    }
}

const TWEET_BANK: &[&str] = &[
    "AI agents working together achieve more than any single agent alone.",
    "The future of work is collaborative intelligence.",
    "Just watched my agents have a standup meeting. Surreal.",
    "Multi-agent systems: where emergent behavior meets intentional design.",
];

/// Draft selection is randomized through the injected source so tests can
/// pin the pick.
struct DraftTweetExecutor {
    rng: Arc<dyn RandomSource>,
}

#[async_trait]
impl StepExecutor for DraftTweetExecutor {
    fn kind(&self) -> StepKind {
        StepKind::DraftTweet
    }

    async fn execute(&self, _step: &Step) -> Result<Value> {
        let tweet = TWEET_BANK[self.rng.pick_index(TWEET_BANK.len())];
        Ok(serde_json::json!({
            "tweet": tweet,
            "character_count": tweet.len(),
        }))
    }
}

struct PostTweetExecutor;

#[async_trait]
impl StepExecutor for PostTweetExecutor {
    fn kind(&self) -> StepKind {
        StepKind::PostTweet
    }

    async fn execute(&self, _step: &Step) -> Result<Value> {
        Ok(serde_json::json!({
            "tweet_id": format!("sim_{}", uuid::Uuid::new_v4()),
            "note": "simulated - no live API call",
        }))
    }
}

struct DeployExecutor;

#[async_trait]
impl StepExecutor for DeployExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Deploy
    }

    async fn execute(&self, _step: &Step) -> Result<Value> {
        Ok(serde_json::json!({
            "deployed": true,
            "note": "simulated deploy",
        }))
    }
}

/// Summary of one processed step, for logs and tests.
#[derive(Debug, Clone)]
pub struct WorkedStep {
    pub step_id: String,
    pub kind: StepKind,
    pub success: bool,
}

pub struct StepWorker {
    id: String,
    scheduler: Arc<MissionScheduler>,
    registry: Arc<ExecutorRegistry>,
    poll_interval: std::time::Duration,
}

impl StepWorker {
    pub fn new(
        id: String,
        scheduler: Arc<MissionScheduler>,
        registry: Arc<ExecutorRegistry>,
        config: &OpsConfig,
    ) -> Self {
        Self {
            id,
            scheduler,
            registry,
            poll_interval: std::time::Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    /// Claim and execute at most one step. `Ok(None)` means the queue was
    /// empty or the claim race was lost; either way there is nothing to do
    /// until the next poll.
    pub async fn work_once(&self) -> Result<Option<WorkedStep>> {
        let Some(step) = self.scheduler.claim_next_step(&self.id, Utc::now())? else {
            return Ok(None);
        };

        tracing::info!(
            "Worker {} executing step {} ({})",
            self.id,
            step.id,
            step.kind.as_str()
        );

        let outcome = match self.registry.get(step.kind).await {
            Some(executor) => match executor.execute(&step).await {
                Ok(output) => StepOutcome::Success(output),
                Err(e) => StepOutcome::Failure(format!("{:#}", e)),
            },
            None => StepOutcome::Failure(format!(
                "No executor registered for step kind '{}'",
                step.kind.as_str()
            )),
        };

        let success = matches!(outcome, StepOutcome::Success(_));
        self.scheduler
            .record_outcome(&step.id, outcome, Utc::now())
            .with_context(|| format!("Failed to record outcome for step '{}'", step.id))?;

        Ok(Some(WorkedStep {
            step_id: step.id,
            kind: step.kind,
            success,
        }))
    }

    /// Poll loop. Backs off after repeated store errors instead of spinning.
    pub async fn run(self) {
        tracing::info!(
            "Step worker {} starting (poll interval {:?})",
            self.id,
            self.poll_interval
        );
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.work_once().await {
                Ok(_) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::error!("Worker {} error: {:#}", self.id, e);
                    if consecutive_errors > 5 {
                        tracing::error!(
                            "Worker {} backing off after {} consecutive errors",
                            self.id,
                            consecutive_errors
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        consecutive_errors = 0;
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::admission::{AdmissionControl, SubmitRequest};
    use crate::chance::SeqRandom;
    use crate::database::{MissionStatus, OpsDatabase, Priority, StepStatus};
    use crate::policy::PolicyStore;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("opsforge_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    async fn worker_with(db: Arc<OpsDatabase>) -> (StepWorker, Arc<MissionScheduler>) {
        let scheduler = Arc::new(MissionScheduler::new(db));
        let registry = Arc::new(ExecutorRegistry::new());
        register_builtin_executors(registry.clone(), Arc::new(SeqRandom::always(0.0))).await;
        let worker = StepWorker::new(
            "worker-test".to_string(),
            scheduler.clone(),
            registry,
            &OpsConfig::default(),
        );
        (worker, scheduler)
    }

    fn submit(db: Arc<OpsDatabase>, agent: &str, action: Action) {
        let policy = PolicyStore::new(db.clone());
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        let admission = AdmissionControl::new(db, policy, scheduler);
        let outcome = admission
            .submit(
                SubmitRequest {
                    source: "test".to_string(),
                    agent: agent.to_string(),
                    action,
                    params: serde_json::json!({}),
                    priority: Priority::Normal,
                },
                Utc::now(),
            )
            .expect("submit");
        assert!(outcome.auto_approved, "test expects auto-approved work");
    }

    #[tokio::test]
    async fn draft_tweet_mission_runs_to_success() {
        let path = temp_db_path("worker_draft");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        submit(db.clone(), "quill", Action::DraftTweet);

        let (worker, _) = worker_with(db.clone()).await;
        let worked = worker
            .work_once()
            .await
            .expect("work once")
            .expect("a step was processed");
        assert!(worked.success);
        assert_eq!(worked.kind, StepKind::DraftTweet);

        let step = db
            .get_step(&worked.step_id)
            .expect("get step")
            .expect("step");
        assert_eq!(step.status, StepStatus::Succeeded);
        let result = step.result.expect("result stored");
        assert_eq!(result["tweet"], TWEET_BANK[0]);

        assert_eq!(
            db.count_missions_by_status(MissionStatus::Succeeded)
                .expect("count"),
            1
        );
        assert_eq!(
            db.count_successful_action_runs_since("draft_tweet", Utc::now() - chrono::Duration::hours(1))
                .expect("runs"),
            1
        );

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn multi_step_mission_completes_in_template_order() {
        let path = temp_db_path("worker_pipeline");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        submit(db.clone(), "scout", Action::AnalyzeViralContent);

        let (worker, _) = worker_with(db.clone()).await;
        let mut kinds = Vec::new();
        while let Some(worked) = worker.work_once().await.expect("work once") {
            assert!(worked.success);
            kinds.push(worked.kind);
        }

        assert_eq!(
            kinds,
            vec![StepKind::Crawl, StepKind::Analyze, StepKind::WriteContent]
        );
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Succeeded)
                .expect("count"),
            1
        );

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_executor_fails_the_step_and_mission() {
        let path = temp_db_path("worker_missing_executor");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        submit(db.clone(), "scout", Action::Crawl);

        // Registry without any executors: every claim fails its step.
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        let worker = StepWorker::new(
            "worker-test".to_string(),
            scheduler,
            Arc::new(ExecutorRegistry::new()),
            &OpsConfig::default(),
        );

        let worked = worker
            .work_once()
            .await
            .expect("work once")
            .expect("a step was processed");
        assert!(!worked.success);

        let step = db
            .get_step(&worked.step_id)
            .expect("get step")
            .expect("step");
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step
            .last_error
            .expect("error recorded")
            .contains("No executor registered"));
        assert_eq!(
            db.count_missions_by_status(MissionStatus::Failed)
                .expect("count"),
            1
        );

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn empty_queue_yields_nothing() {
        let path = temp_db_path("worker_idle");
        let db = Arc::new(OpsDatabase::new(&path).expect("db init"));
        let (worker, _) = worker_with(db).await;
        assert!(worker.work_once().await.expect("work once").is_none());
        let _ = std::fs::remove_file(&path);
    }
}
