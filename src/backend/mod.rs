//! The storage-and-queue contract every persistence implementation must
//! satisfy, plus the task and message shapes that cross it.
//!
//! Guarantees required of implementations:
//!
//! - `complete_workflow_task` is a single atomic commit covering history
//!   append, instance state, activity enqueue, timer scheduling, and
//!   cross-instance event delivery.
//! - Tasks are leased; an expired lease makes the task eligible for
//!   redelivery (at-least-once). At most one workflow task per
//!   `instance_id` is leased at any moment across the deployment.
//! - Committed sequence ids are strictly monotonic and dense per execution.

use crate::core::{InstanceState, WorkflowInstance, WorkflowState};
use crate::error::BackendError;
use crate::history::Event;
use crate::payload::{Converter, Metadata, Payload, Propagators};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;

/// A unit of workflow progress: advance `instance` by consuming
/// `new_events` on top of the committed history ending at
/// `last_sequence_id`.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    /// Lease token; completion and extension must present it.
    pub token: String,
    pub instance: WorkflowInstance,
    pub last_sequence_id: u64,
    pub new_events: Vec<Event>,
    /// Lease duration granted by the backend; workers heartbeat at a
    /// fraction of this.
    pub lease_timeout: Duration,
}

/// A single activity invocation handed to an activity worker.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub token: String,
    /// The workflow instance the result event is delivered to.
    pub instance: WorkflowInstance,
    pub schedule_event_id: u64,
    pub name: String,
    pub input: Payload,
    pub metadata: Metadata,
    pub lease_timeout: Duration,
}

/// Outbound request to run an activity, produced by command translation.
#[derive(Debug, Clone)]
pub struct ActivityMessage {
    pub instance: WorkflowInstance,
    pub schedule_event_id: u64,
    pub name: String,
    pub input: Payload,
    pub metadata: Metadata,
}

/// Outbound timer plumbing: park a delayed `TimerFired` for this instance,
/// or remove one scheduled earlier.
#[derive(Debug, Clone)]
pub enum TimerMessage {
    Schedule {
        instance: WorkflowInstance,
        schedule_event_id: u64,
        fire_at_ms: u64,
    },
    Cancel {
        instance: WorkflowInstance,
        schedule_event_id: u64,
    },
}

/// Outbound event for another instance (or a future execution of this one):
/// child starts, cancellation requests, signals, and sub-workflow results
/// all travel in this envelope.
#[derive(Debug, Clone)]
pub enum InstanceMessage {
    /// Create `instance` and seed it with `start_event`. Failure to create
    /// (duplicate id) must route a `SubWorkflowFailed` back to the parent
    /// recorded in `instance`.
    Start {
        instance: WorkflowInstance,
        start_event: Event,
    },
    /// Append `event` to the pending queue of the targeted instance and
    /// kick its task. Delivery failures are logged and dropped.
    Deliver {
        target_instance_id: String,
        event: Event,
    },
}

/// Everything a completed workflow task commits, in one transaction.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTaskResult {
    /// Events to append to committed history, sequence ids already assigned.
    pub executed_events: Vec<Event>,
    pub activity_messages: Vec<ActivityMessage>,
    pub timer_messages: Vec<TimerMessage>,
    pub instance_messages: Vec<InstanceMessage>,
    pub state: WorkflowState,
}

impl WorkflowTaskResult {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Active,
            ..Default::default()
        }
    }
}

/// Storage-and-queue contract consumed by the kernel.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Payload codec used for every encode/decode this backend observes.
    fn converter(&self) -> Arc<dyn Converter>;

    /// Metadata injectors/extractors applied at instance creation and
    /// activity execution.
    fn context_propagators(&self) -> Propagators;

    /// Create an instance and seed its pending queue with the start event.
    /// Duplicate instance ids fail with `InstanceAlreadyExists`.
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        start_event: Event,
    ) -> Result<(), BackendError>;

    /// Committed history of the given execution, optionally only events
    /// after `after_sequence_id`.
    async fn get_workflow_instance_history(
        &self,
        instance: &WorkflowInstance,
        after_sequence_id: Option<u64>,
    ) -> Result<Vec<Event>, BackendError>;

    async fn get_workflow_instance_state(&self, instance: &WorkflowInstance) -> Result<InstanceState, BackendError>;

    /// Append a cancellation event to the instance's pending queue. Backends
    /// must implement this; there is no not-implemented escape hatch.
    async fn cancel_workflow_instance(&self, instance: &WorkflowInstance, cancel_event: Event)
    -> Result<(), BackendError>;

    /// Append a signal event to the pending queue of the current execution
    /// of `instance_id`. Unknown instances fail with `InstanceNotFound`,
    /// terminal instances with `InstanceFinished`.
    async fn signal_workflow(&self, instance_id: &str, signal_event: Event) -> Result<(), BackendError>;

    /// Drop all stored state for a terminal instance. Active instances fail
    /// with `InstanceNotTerminal`.
    async fn remove_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    /// Claim the next workflow task, granting a lease. Returns `None` when
    /// no task is due; callers poll.
    async fn get_workflow_task(&self) -> Result<Option<WorkflowTask>, BackendError>;

    /// Heartbeat: renew the task's lease. Fails with `LeaseLost` when the
    /// lease already expired or was taken over.
    async fn extend_workflow_task(&self, task: &WorkflowTask) -> Result<(), BackendError>;

    /// Atomically commit the task's results and release the lease.
    async fn complete_workflow_task(&self, task: &WorkflowTask, result: WorkflowTaskResult)
    -> Result<(), BackendError>;

    async fn get_activity_task(&self) -> Result<Option<ActivityTask>, BackendError>;

    async fn extend_activity_task(&self, task: &ActivityTask) -> Result<(), BackendError>;

    /// Deliver the activity's response event into the originating
    /// instance's pending queue and release the lease.
    async fn complete_activity_task(&self, task: &ActivityTask, response_event: Event) -> Result<(), BackendError>;
}
