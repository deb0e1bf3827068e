//! Activity worker loop: runs user activities outside the deterministic
//! scheduler and feeds their results back as response events.

use crate::backend::{ActivityTask, Backend};
use crate::core::{WorkflowInstance, now_ms};
use crate::error::WorkflowError;
use crate::history::{Event, EventAttributes};
use crate::payload::{Converter, Metadata};
use crate::registry::ActivityRegistry;
use crate::worker::WorkerOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Context handed to activity code. Activities may run for a long time;
/// the cancellation token fires when the lease is lost or the worker shuts
/// down, and acting on it is the activity's responsibility.
#[derive(Clone)]
pub struct ActivityContext {
    pub instance: WorkflowInstance,
    pub schedule_event_id: u64,
    pub activity_name: String,
    pub metadata: Metadata,
    pub cancellation: CancellationToken,
    pub(crate) converter: Arc<dyn Converter>,
}

pub(crate) struct ActivityWorker {
    backend: Arc<dyn Backend>,
    registry: ActivityRegistry,
    options: WorkerOptions,
    shutdown: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl ActivityWorker {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        registry: ActivityRegistry,
        options: WorkerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = options.max_concurrent_activities.max(1);
        Self {
            backend,
            registry,
            options,
            shutdown,
            semaphore: Arc::new(Semaphore::new(permits)),
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
                task = this.backend.get_activity_task() => task,
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
                    warn!(error = %e, "activity task poll failed");
                    tokio::time::sleep(this.options.poll_interval).await;
                }
            }
        }
    }

    async fn handle_task(self: &Arc<Self>, task: ActivityTask) {
        debug!(instance = %task.instance.instance_id, activity = %task.name, "activity task claimed");
        let cancellation = self.shutdown.child_token();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = {
            let backend = self.backend.clone();
            let task = task.clone();
            let lease_lost = lease_lost.clone();
            let stop = heartbeat_stop.clone();
            let cancel_work = cancellation.clone();
            let interval = task.lease_timeout / 3;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = backend.extend_activity_task(&task).await {
                        warn!(activity = %task.name, error = %e, "activity heartbeat failed; canceling user code");
                        lease_lost.store(true, Ordering::SeqCst);
                        cancel_work.cancel();
                        break;
                    }
                }
            })
        };

        let ctx = ActivityContext {
            instance: task.instance.clone(),
            schedule_event_id: task.schedule_event_id,
            activity_name: task.name.clone(),
            metadata: task.metadata.clone(),
            cancellation,
            converter: self.backend.converter(),
        };
        for propagator in self.backend.context_propagators() {
            propagator.extract(&ctx.metadata);
        }

        let outcome = match self.registry.get(&task.name) {
            Some(handler) => {
                let input = task.input.clone();
                // Run in a child task so a panicking activity is captured
                // rather than tearing down the worker.
                let join = tokio::spawn(async move { handler.invoke(ctx, input).await });
                match join.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(WorkflowError::panic(format!("activity {} panicked", task.name))),
                    Err(e) => Err(WorkflowError::application(e.to_string())),
                }
            }
            None => Err(WorkflowError::permanent(format!("activity not registered: {}", task.name))),
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        if lease_lost.load(Ordering::SeqCst) {
            debug!(activity = %task.name, "lease lost; dropping activity result");
            return;
        }

        let attributes = match outcome {
            Ok(result) => EventAttributes::ActivityCompleted { result },
            Err(error) => EventAttributes::ActivityFailed { error },
        };
        let response = Event::new_pending(now_ms(), attributes).with_schedule_event_id(task.schedule_event_id);
        if let Err(e) = self.backend.complete_activity_task(&task, response).await {
            warn!(activity = %task.name, error = %e, "failed to complete activity task");
        }
    }
}
