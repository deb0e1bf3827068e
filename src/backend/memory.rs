//! In-memory reference backend. One mutex guards all state, which makes
//! every task completion a single atomic commit; leases are plain expiry
//! stamps swept on each poll, giving at-least-once redelivery.

use crate::backend::{
    ActivityMessage, ActivityTask, Backend, InstanceMessage, TimerMessage, WorkflowTask, WorkflowTaskResult,
};
use crate::core::{InstanceState, WorkflowInstance, WorkflowState, now_ms};
use crate::error::{BackendError, WorkflowError};
use crate::history::{Event, EventAttributes};
use crate::payload::{Converter, JsonConverter, Propagators};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct MemoryBackendOptions {
    pub workflow_lease_timeout: Duration,
    pub activity_lease_timeout: Duration,
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            workflow_lease_timeout: Duration::from_secs(30),
            activity_lease_timeout: Duration::from_secs(60),
        }
    }
}

struct WorkflowLease {
    token: String,
    expires_at: Instant,
    /// How many pending events the leased task carried; completion removes
    /// exactly this prefix.
    consumed: usize,
}

struct ExecutionRecord {
    history: Vec<Event>,
    state: WorkflowState,
    completed_at_ms: Option<u64>,
}

struct InstanceRecord {
    /// Identity of the current execution.
    current: WorkflowInstance,
    created_at_ms: u64,
    executions: BTreeMap<String, ExecutionRecord>,
    /// Events visible to the next workflow task of the current execution.
    pending: VecDeque<Event>,
    /// Events parked until wall clock reaches their visibility stamp.
    delayed: Vec<Event>,
    lock: Option<WorkflowLease>,
}

impl InstanceRecord {
    fn new(instance: WorkflowInstance, start_event: Event) -> Self {
        let mut executions = BTreeMap::new();
        executions.insert(
            instance.execution_id.clone(),
            ExecutionRecord {
                history: Vec::new(),
                state: WorkflowState::Active,
                completed_at_ms: None,
            },
        );
        Self {
            current: instance,
            created_at_ms: now_ms(),
            executions,
            pending: VecDeque::from([start_event]),
            delayed: Vec::new(),
            lock: None,
        }
    }

    fn current_execution(&self) -> &ExecutionRecord {
        &self.executions[&self.current.execution_id]
    }

    fn current_execution_mut(&mut self) -> &mut ExecutionRecord {
        self.executions.get_mut(&self.current.execution_id).expect("current execution record")
    }

    fn is_terminal(&self) -> bool {
        self.current_execution().state.is_terminal()
    }
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceRecord>,
    workflow_queue: VecDeque<String>,
    activity_queue: VecDeque<ActivityMessage>,
    activity_leases: HashMap<String, (ActivityTask, Instant)>,
}

impl Inner {
    fn kick(&mut self, instance_id: &str) {
        if !self.workflow_queue.iter().any(|id| id == instance_id) {
            self.workflow_queue.push_back(instance_id.to_string());
        }
    }

    /// Move due delayed events into pending queues and reclaim expired
    /// workflow leases.
    fn sweep(&mut self, now: Instant) {
        let wall = now_ms();
        let mut kicks: Vec<String> = Vec::new();
        for (id, record) in self.instances.iter_mut() {
            let mut moved = false;
            let mut i = 0;
            while i < record.delayed.len() {
                if record.delayed[i].visible_at_ms.is_some_and(|at| at <= wall) {
                    let ev = record.delayed.remove(i);
                    record.pending.push_back(ev);
                    moved = true;
                } else {
                    i += 1;
                }
            }
            if record.lock.as_ref().is_some_and(|l| l.expires_at <= now) {
                record.lock = None;
                moved = true;
            }
            if moved && !record.pending.is_empty() && !record.is_terminal() {
                kicks.push(id.clone());
            }
        }
        for id in kicks {
            self.kick(&id);
        }
    }

    /// Deliver an event into a sibling/child/parent instance's queue,
    /// honoring its visibility stamp. Failures are logged, never fatal:
    /// worker-side deliveries are best effort.
    fn deliver(&mut self, target_instance_id: &str, event: Event) {
        let Some(record) = self.instances.get_mut(target_instance_id) else {
            warn!(instance = target_instance_id, "dropping event for unknown instance");
            return;
        };
        if record.is_terminal() {
            warn!(instance = target_instance_id, "dropping event for finished instance");
            return;
        }
        if event.visible_at_ms.is_some_and(|at| at > now_ms()) {
            record.delayed.push(event);
        } else {
            record.pending.push_back(event);
            self.kick(target_instance_id);
        }
    }

    fn start_instance(&mut self, instance: WorkflowInstance, start_event: Event) -> Result<(), BackendError> {
        if self.instances.contains_key(&instance.instance_id) {
            return Err(BackendError::InstanceAlreadyExists(instance.instance_id));
        }
        let id = instance.instance_id.clone();
        self.instances.insert(id.clone(), InstanceRecord::new(instance, start_event));
        self.kick(&id);
        Ok(())
    }
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    converter: Arc<dyn Converter>,
    propagators: Propagators,
    options: MemoryBackendOptions,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_options(MemoryBackendOptions::default())
    }

    pub fn with_options(options: MemoryBackendOptions) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            converter: Arc::new(JsonConverter),
            propagators: Vec::new(),
            options,
        }
    }

    pub fn with_propagators(mut self, propagators: Propagators) -> Self {
        self.propagators = propagators;
        self
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn converter(&self) -> Arc<dyn Converter> {
        self.converter.clone()
    }

    fn context_propagators(&self) -> Propagators {
        self.propagators.clone()
    }

    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        start_event: Event,
    ) -> Result<(), BackendError> {
        self.inner.lock().unwrap().start_instance(instance, start_event)
    }

    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
        after_sequence_id: Option<u64>,
    ) -> Result<Vec<Event>, BackendError> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        let execution = record
            .executions
            .get(&instance.execution_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        let after = after_sequence_id.unwrap_or(0);
        Ok(execution
            .history
            .iter()
            .filter(|e| e.sequence_id > after)
            .cloned()
            .collect())
    }

    async fn get_workflow_instance_state(&self, instance: &WorkflowInstance) -> Result<InstanceState, BackendError> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        let execution = record
            .executions
            .get(&instance.execution_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        Ok(InstanceState {
            instance: instance.clone(),
            state: execution.state,
            created_at_ms: record.created_at_ms,
            completed_at_ms: execution.completed_at_ms,
        })
    }

    async fn cancel_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        cancel_event: Event,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get_mut(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        if record.is_terminal() {
            return Err(BackendError::InstanceFinished(instance.instance_id.clone()));
        }
        record.pending.push_back(cancel_event);
        let id = instance.instance_id.clone();
        inner.kick(&id);
        Ok(())
    }

    async fn signal_workflow(&self, instance_id: &str, signal_event: Event) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        if record.is_terminal() {
            return Err(BackendError::InstanceFinished(instance_id.to_string()));
        }
        if signal_event.visible_at_ms.is_some_and(|at| at > now_ms()) {
            record.delayed.push(signal_event);
        } else {
            record.pending.push_back(signal_event);
            inner.kick(instance_id);
        }
        Ok(())
    }

    async fn remove_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get(&instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance.instance_id.clone()))?;
        if !record.is_terminal() {
            return Err(BackendError::InstanceNotTerminal(instance.instance_id.clone()));
        }
        inner.instances.remove(&instance.instance_id);
        Ok(())
    }

    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.sweep(now);
        while let Some(id) = inner.workflow_queue.pop_front() {
            let Some(record) = inner.instances.get_mut(&id) else {
                continue;
            };
            if record.is_terminal() {
                record.pending.clear();
                continue;
            }
            if record.lock.is_some() || record.pending.is_empty() {
                continue;
            }
            let token = uuid::Uuid::new_v4().to_string();
            let new_events: Vec<Event> = record.pending.iter().cloned().collect();
            record.lock = Some(WorkflowLease {
                token: token.clone(),
                expires_at: now + self.options.workflow_lease_timeout,
                consumed: new_events.len(),
            });
            let task = WorkflowTask {
                token,
                instance: record.current.clone(),
                last_sequence_id: record.current_execution().history.len() as u64,
                new_events,
                lease_timeout: self.options.workflow_lease_timeout,
            };
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn extend_workflow_task(&self, task: &WorkflowTask) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get_mut(&task.instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(task.instance.instance_id.clone()))?;
        match &mut record.lock {
            Some(lease) if lease.token == task.token => {
                lease.expires_at = Instant::now() + self.options.workflow_lease_timeout;
                Ok(())
            }
            _ => Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
        }
    }

    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        result: WorkflowTaskResult,
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .instances
            .get_mut(&task.instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(task.instance.instance_id.clone()))?;
        let consumed = match &record.lock {
            Some(lease) if lease.token == task.token => lease.consumed,
            _ => return Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
        };
        if record.current.execution_id != task.instance.execution_id {
            return Err(BackendError::LeaseLost(task.instance.instance_id.clone()));
        }

        // History append; committed sequence ids must continue densely.
        {
            let execution = record.current_execution_mut();
            let mut expected = execution.history.len() as u64;
            for ev in &result.executed_events {
                expected += 1;
                if ev.sequence_id != expected {
                    return Err(BackendError::Internal(format!(
                        "non-dense sequence id {} (expected {expected})",
                        ev.sequence_id
                    )));
                }
            }
            execution.history.extend(result.executed_events.iter().cloned());
            execution.state = result.state;
            if result.state.is_terminal() {
                execution.completed_at_ms = Some(now_ms());
            }
        }

        // Drop the consumed pending prefix and the lease.
        record.pending.drain(..consumed.min(record.pending.len()));
        record.lock = None;
        if result.state.is_terminal() {
            record.pending.clear();
            record.delayed.clear();
        }

        // Timer plumbing for this instance.
        for timer in &result.timer_messages {
            match timer {
                TimerMessage::Schedule {
                    schedule_event_id,
                    fire_at_ms,
                    ..
                } => {
                    let fired = Event::new_pending(now_ms(), EventAttributes::TimerFired { fire_at_ms: *fire_at_ms })
                        .with_schedule_event_id(*schedule_event_id)
                        .with_visible_at(*fire_at_ms);
                    record.delayed.push(fired);
                }
                TimerMessage::Cancel { schedule_event_id, .. } => {
                    record
                        .delayed
                        .retain(|e| e.schedule_event_id != Some(*schedule_event_id));
                }
            }
        }

        let requeue = !record.pending.is_empty() && !result.state.is_terminal();
        let instance_id = task.instance.instance_id.clone();

        // Activity dispatch.
        for msg in result.activity_messages {
            inner.activity_queue.push_back(msg);
        }

        // Cross-instance deliveries: child starts, signals, cancellations,
        // results to the parent, and the continue-as-new successor.
        for msg in result.instance_messages {
            match msg {
                InstanceMessage::Start { instance, start_event } => {
                    if instance.instance_id == instance_id {
                        // Continue-as-new: fresh execution under the same id.
                        let record = inner.instances.get_mut(&instance_id).expect("record exists");
                        record.executions.insert(
                            instance.execution_id.clone(),
                            ExecutionRecord {
                                history: Vec::new(),
                                state: WorkflowState::Active,
                                completed_at_ms: None,
                            },
                        );
                        record.current = instance;
                        record.pending = VecDeque::from([start_event]);
                        record.delayed.clear();
                        inner.kick(&instance_id);
                    } else if let Err(e) = inner.start_instance(instance.clone(), start_event) {
                        warn!(child = %instance.instance_id, error = %e, "sub-workflow start failed");
                        if let Some(parent) = &instance.parent {
                            let failure = Event::new_pending(
                                now_ms(),
                                EventAttributes::SubWorkflowFailed {
                                    error: WorkflowError::permanent(e.to_string()),
                                },
                            )
                            .with_schedule_event_id(parent.schedule_event_id);
                            inner.deliver(&parent.instance_id, failure);
                        }
                    }
                }
                InstanceMessage::Deliver {
                    target_instance_id,
                    event,
                } => {
                    inner.deliver(&target_instance_id, event);
                }
            }
        }

        if requeue {
            inner.kick(&instance_id);
        }
        Ok(())
    }

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        // Reclaim expired activity leases for redelivery.
        let expired: Vec<String> = inner
            .activity_leases
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some((task, _)) = inner.activity_leases.remove(&token) {
                inner.activity_queue.push_front(ActivityMessage {
                    instance: task.instance,
                    schedule_event_id: task.schedule_event_id,
                    name: task.name,
                    input: task.input,
                    metadata: task.metadata,
                });
            }
        }
        let Some(msg) = inner.activity_queue.pop_front() else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        let task = ActivityTask {
            token: token.clone(),
            instance: msg.instance,
            schedule_event_id: msg.schedule_event_id,
            name: msg.name,
            input: msg.input,
            metadata: msg.metadata,
            lease_timeout: self.options.activity_lease_timeout,
        };
        inner
            .activity_leases
            .insert(token, (task.clone(), now + self.options.activity_lease_timeout));
        Ok(Some(task))
    }

    async fn extend_activity_task(&self, task: &ActivityTask) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.activity_leases.get_mut(&task.token) {
            Some((_, expires_at)) => {
                *expires_at = Instant::now() + self.options.activity_lease_timeout;
                Ok(())
            }
            None => Err(BackendError::LeaseLost(task.name.clone())),
        }
    }

    async fn complete_activity_task(&self, task: &ActivityTask, response_event: Event) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.activity_leases.remove(&task.token).is_none() {
            return Err(BackendError::LeaseLost(task.name.clone()));
        }
        let stale = inner
            .instances
            .get(&task.instance.instance_id)
            .is_none_or(|r| r.current.execution_id != task.instance.execution_id);
        if stale {
            // The execution continued-as-new or was removed; results of the
            // old execution no longer apply.
            warn!(instance = %task.instance.instance_id, activity = %task.name, "dropping activity result for stale execution");
            return Ok(());
        }
        inner.deliver(&task.instance.instance_id, response_event);
        Ok(())
    }
}
