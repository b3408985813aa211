//! Bootstrap wiring: build the store and engine components from config and
//! spawn the background loops (workers + internal heartbeat).

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::admission::AdmissionControl;
use crate::chance::{RandomSource, ThreadRandom};
use crate::config::OpsConfig;
use crate::database::OpsDatabase;
use crate::healing::Sweeper;
use crate::heartbeat::ControlLoop;
use crate::missions::MissionScheduler;
use crate::policy::PolicyStore;
use crate::reactions::ReactionEngine;
use crate::triggers::TriggerEvaluator;
use crate::worker::{register_builtin_executors, ExecutorRegistry, StepWorker};

pub struct OpsRuntime {
    pub config: OpsConfig,
    pub db: Arc<OpsDatabase>,
    pub policy: PolicyStore,
    pub scheduler: Arc<MissionScheduler>,
    pub admission: Arc<AdmissionControl>,
    pub sweeper: Arc<Sweeper>,
    pub control: Arc<ControlLoop>,
    pub registry: Arc<ExecutorRegistry>,
}

impl OpsRuntime {
    pub async fn bootstrap(config: OpsConfig) -> Result<Self> {
        let db = Arc::new(
            OpsDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database '{}'", config.database_path))?,
        );
        let policy = PolicyStore::new(db.clone());
        let scheduler = Arc::new(MissionScheduler::new(db.clone()));
        let admission = Arc::new(AdmissionControl::new(
            db.clone(),
            policy.clone(),
            scheduler.clone(),
        ));
        let rng: Arc<dyn RandomSource> = Arc::new(ThreadRandom);
        let sweeper = Arc::new(Sweeper::new(db.clone(), scheduler.clone()));
        let control = Arc::new(ControlLoop::new(
            TriggerEvaluator::new(db.clone(), admission.clone(), rng.clone(), &config),
            ReactionEngine::new(
                db.clone(),
                admission.clone(),
                policy.clone(),
                rng.clone(),
                &config,
            ),
            sweeper.clone(),
        ));

        let registry = Arc::new(ExecutorRegistry::new());
        register_builtin_executors(registry.clone(), rng).await;

        Ok(Self {
            config,
            db,
            policy,
            scheduler,
            admission,
            sweeper,
            control,
            registry,
        })
    }

    /// Spawn the worker pool and, unless an external scheduler owns the
    /// cadence, the internal heartbeat ticker.
    pub fn spawn_background_loops(&self) {
        for index in 0..self.config.worker_count.max(1) {
            let worker = StepWorker::new(
                format!("{}-{}", self.config.worker_id, index),
                self.scheduler.clone(),
                self.registry.clone(),
                &self.config,
            );
            tokio::spawn(worker.run());
        }

        if self.config.internal_heartbeat {
            self.control
                .clone()
                .spawn_ticker(self.config.heartbeat_interval_secs);
        } else {
            tracing::info!("Internal heartbeat disabled; expecting external /v1/heartbeat calls");
        }
    }
}
