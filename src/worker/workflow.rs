//! Workflow worker loop: claims workflow tasks, drives the executor, and
//! commits results, with lease heartbeats, a per-task budget, and a sticky
//! executor cache.

use crate::backend::{Backend, WorkflowTask, WorkflowTaskResult};
use crate::core::{WorkflowState, now_ms};
use crate::error::{BackendError, ExecutorError, WorkflowError};
use crate::executor::WorkflowExecutor;
use crate::history::{Event, EventAttributes};
use crate::registry::WorkflowRegistry;
use crate::worker::WorkerOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type CacheKey = (String, String);

pub(crate) struct WorkflowWorker {
    backend: Arc<dyn Backend>,
    registry: WorkflowRegistry,
    options: WorkerOptions,
    shutdown: CancellationToken,
    semaphore: Arc<Semaphore>,
    /// Warm executors by (instance_id, execution_id), stamped for
    /// oldest-first eviction.
    cache: Arc<Mutex<HashMap<CacheKey, (u64, WorkflowExecutor)>>>,
    cache_clock: Arc<Mutex<u64>>,
    /// Replay attempts per execution towards the non-determinism budget.
    nondeterminism_attempts: Arc<Mutex<HashMap<CacheKey, u32>>>,
}

impl WorkflowWorker {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        registry: WorkflowRegistry,
        options: WorkerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = options.max_concurrent_workflow_tasks.max(1);
        Self {
            backend,
            registry,
            options,
            shutdown,
            semaphore: Arc::new(Semaphore::new(permits)),
            cache: Arc::new(Mutex::new(HashMap::new())),
            cache_clock: Arc::new(Mutex::new(0)),
            nondeterminism_attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) async fn run(self) {
        let this = Arc::new(self);
        loop {
            let permit = tokio::select! {
                _ = this.shutdown.cancelled() => break,
                permit = this.semaphore.clone().acquire_owned() => permit.expect("semaphore open"),
            };
            let task = tokio::select! {
                _ = this.shutdown.cancelled() => break,
                task = this.backend.get_workflow_task() => task,
            };
            match task {
                Ok(Some(task)) => {
                    let worker = this.clone();
                    tokio::spawn(async move {
                        worker.handle_task(task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = this.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(this.options.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "workflow task poll failed");
                    tokio::time::sleep(this.options.poll_interval).await;
                }
            }
        }
    }

    async fn handle_task(self: &Arc<Self>, task: WorkflowTask) {
        let key = (task.instance.instance_id.clone(), task.instance.execution_id.clone());
        debug!(instance = %key.0, events = task.new_events.len(), "workflow task claimed");

        // Heartbeat at a third of the lease; on failure the task is
        // abandoned (result discarded, lease expiry redelivers).
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let backend = self.backend.clone();
            let task = task.clone();
            let lease_lost = lease_lost.clone();
            let stop = heartbeat_stop.clone();
            let interval = task.lease_timeout / 3;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = backend.extend_workflow_task(&task).await {
                        warn!(instance = %task.instance.instance_id, error = %e, "lease heartbeat failed; abandoning task");
                        lease_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            })
        };

        let outcome = self.execute(&task, &key).await;
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        let (executor, result) = match outcome {
            Some(pair) => pair,
            None => return,
        };
        if lease_lost.load(Ordering::SeqCst) {
            debug!(instance = %key.0, "lease lost during execution; dropping result");
            return;
        }
        if self.shutdown.is_cancelled() {
            // Shutdown aborts before committing; the lease expires and the
            // task is redelivered elsewhere.
            debug!(instance = %key.0, "worker shutting down; abandoning task");
            return;
        }

        self.complete(&task, &key, executor, result).await;
    }

    /// Build or revive the executor and run it within the task budget.
    /// Returns `None` when the task was abandoned or failed terminally
    /// through the non-determinism budget path.
    async fn execute(
        self: &Arc<Self>,
        task: &WorkflowTask,
        key: &CacheKey,
    ) -> Option<(WorkflowExecutor, WorkflowTaskResult)> {
        let cached = self.cache.lock().unwrap().remove(key).map(|(_, e)| e);
        let mut executor = match cached {
            Some(e) if e.last_sequence_id() == task.last_sequence_id => e,
            other => {
                if other.is_some() {
                    debug!(instance = %key.0, "cached executor stale; replaying from history");
                }
                let mut fresh = WorkflowExecutor::new(
                    self.registry.clone(),
                    self.backend.converter(),
                    task.instance.clone(),
                );
                if task.last_sequence_id > 0 {
                    let history = match self.backend.get_workflow_instance_history(&task.instance, None).await {
                        Ok(h) => h,
                        Err(e) => {
                            warn!(instance = %key.0, error = %e, "history fetch failed; abandoning task");
                            return None;
                        }
                    };
                    if let Err(e) = fresh.replay(&history) {
                        self.handle_executor_error(task, key, e).await;
                        return None;
                    }
                }
                fresh
            }
        };

        let budget = self.options.workflow_task_budget;
        let task_for_run = task.clone();
        let run = tokio::task::spawn_blocking(move || {
            let result = executor.execute_task(&task_for_run);
            (executor, result)
        });
        match tokio::time::timeout(budget, run).await {
            Ok(Ok((executor, Ok(result)))) => Some((executor, result)),
            Ok(Ok((_, Err(e)))) => {
                self.handle_executor_error(task, key, e).await;
                None
            }
            Ok(Err(join_err)) => {
                error!(instance = %key.0, error = %join_err, "executor run failed");
                None
            }
            Err(_) => {
                warn!(instance = %key.0, budget_ms = budget.as_millis() as u64, "task budget exhausted; abandoning");
                None
            }
        }
    }

    async fn complete(
        self: &Arc<Self>,
        task: &WorkflowTask,
        key: &CacheKey,
        executor: WorkflowExecutor,
        result: WorkflowTaskResult,
    ) {
        let terminal = result.state.is_terminal();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.backend.complete_workflow_task(task, result.clone()).await {
                Ok(()) => break,
                Err(BackendError::LeaseLost(_)) => {
                    debug!(instance = %key.0, "lease lost at completion; task redelivered elsewhere");
                    return;
                }
                Err(e) if attempts < self.options.max_completion_attempts => {
                    warn!(instance = %key.0, error = %e, attempt = attempts, "task completion failed; retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => {
                    error!(instance = %key.0, error = %e, "task completion failed repeatedly; instance stuck");
                    return;
                }
            }
        }

        self.nondeterminism_attempts.lock().unwrap().remove(key);
        if terminal {
            debug!(instance = %key.0, state = ?result.state, "workflow execution reached terminal state");
            return;
        }
        // Return the warm executor to the cache, evicting the oldest entry
        // beyond capacity.
        let stamp = {
            let mut clock = self.cache_clock.lock().unwrap();
            *clock += 1;
            *clock
        };
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.clone(), (stamp, executor));
        if cache.len() > self.options.executor_cache_size.max(1)
            && let Some(oldest) = cache.iter().min_by_key(|(_, (s, _))| *s).map(|(k, _)| k.clone())
        {
            cache.remove(&oldest);
        }
    }

    async fn handle_executor_error(self: &Arc<Self>, task: &WorkflowTask, key: &CacheKey, err: ExecutorError) {
        match err {
            ExecutorError::NonDeterminism(message) => {
                let attempts = {
                    let mut map = self.nondeterminism_attempts.lock().unwrap();
                    let entry = map.entry(key.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if attempts < self.options.max_nondeterminism_attempts {
                    // May be code-version skew; abandon so another worker
                    // (possibly on the old version) can retry.
                    warn!(instance = %key.0, attempt = attempts, "non-determinism during replay: {message}");
                    return;
                }
                error!(instance = %key.0, "non-determinism budget exhausted; failing workflow: {message}");
                let ts = now_ms();
                let mut seq = task.last_sequence_id;
                let mut executed_events = vec![
                    Event::new_pending(ts, EventAttributes::WorkflowTaskStarted),
                    Event::new_pending(
                        ts,
                        EventAttributes::WorkflowExecutionFinished {
                            result: None,
                            error: Some(WorkflowError::non_determinism(message)),
                        },
                    ),
                ];
                for ev in &mut executed_events {
                    seq += 1;
                    ev.sequence_id = seq;
                }
                let result = WorkflowTaskResult {
                    executed_events,
                    state: WorkflowState::Finished,
                    ..WorkflowTaskResult::new()
                };
                if let Err(e) = self.backend.complete_workflow_task(task, result).await {
                    warn!(instance = %key.0, error = %e, "failed to record non-determinism failure");
                }
                self.nondeterminism_attempts.lock().unwrap().remove(key);
            }
            ExecutorError::CorruptHistory(message) => {
                // Programmer error or storage damage; not survivable.
                error!(instance = %key.0, "corrupt history: {message}");
                panic!("corrupt history for {}: {message}", key.0);
            }
        }
    }
}
