//! Worker facade: spawns the workflow and activity poll loops against a
//! backend and owns their shutdown.

pub mod activity;
pub mod workflow;

use crate::backend::Backend;
use crate::registry::{ActivityRegistry, WorkflowRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Bound on concurrently executing workflow tasks; polling stops while
    /// the pool is full.
    pub max_concurrent_workflow_tasks: usize,
    pub max_concurrent_activities: usize,
    /// Idle sleep between empty polls.
    pub poll_interval: Duration,
    /// Wall-clock budget for a single workflow task; exhaustion abandons
    /// the task for redelivery.
    pub workflow_task_budget: Duration,
    /// Replay attempts before a non-determinism fault is surfaced as a
    /// workflow failure.
    pub max_nondeterminism_attempts: u32,
    /// Completion retries before an instance is logged stuck.
    pub max_completion_attempts: u32,
    /// Cached executors kept warm between tasks.
    pub executor_cache_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workflow_tasks: 8,
            max_concurrent_activities: 16,
            poll_interval: Duration::from_millis(10),
            workflow_task_budget: Duration::from_secs(10),
            max_nondeterminism_attempts: 3,
            max_completion_attempts: 3,
            executor_cache_size: 128,
        }
    }
}

/// Hosts the two worker loops for one backend.
pub struct Worker {
    backend: Arc<dyn Backend>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(backend: Arc<dyn Backend>, workflows: WorkflowRegistry, activities: ActivityRegistry) -> Self {
        Self {
            backend,
            workflows,
            activities,
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Spawn the poll loops. The returned handle stops them on shutdown.
    pub fn start(self) -> WorkerHandle {
        // Install a default subscriber if none is set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let shutdown = CancellationToken::new();
        let mut joins = Vec::new();

        let wf = workflow::WorkflowWorker::new(
            self.backend.clone(),
            self.workflows.clone(),
            self.options.clone(),
            shutdown.clone(),
        );
        joins.push(tokio::spawn(wf.run()));

        let act = activity::ActivityWorker::new(
            self.backend.clone(),
            self.activities.clone(),
            self.options.clone(),
            shutdown.clone(),
        );
        joins.push(tokio::spawn(act.run()));

        WorkerHandle { shutdown, joins }
    }
}

pub struct WorkerHandle {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop polling and wait for the loops to drain. In-flight tasks finish
    /// their current synchronous turn and are abandoned before committing.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
    }
}
