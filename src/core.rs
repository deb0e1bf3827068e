//! Instance identity and lifecycle state.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single running workflow. `instance_id` is caller-supplied (or a UUID)
/// and unique across active instances; `execution_id` is engine-generated
/// per attempt and changes on continue-as-new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub execution_id: String,
    /// Present when this instance was started as a sub-workflow.
    pub parent: Option<ParentRef>,
}

/// Symbolic reference binding a sub-workflow to its originator. Resolution
/// is always by id through the backend, never by pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub instance_id: String,
    pub execution_id: String,
    /// The parent's `SubWorkflowScheduled` correlation id, used to route
    /// the child's result back.
    pub schedule_event_id: u64,
}

impl WorkflowInstance {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            parent: None,
        }
    }

    pub fn new_sub_workflow(instance_id: impl Into<String>, parent: ParentRef) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            parent: Some(parent),
        }
    }

    /// Successor execution for continue-as-new: same instance id, fresh
    /// execution id, parent linkage carried over.
    pub fn next_execution(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            parent: self.parent.clone(),
        }
    }
}

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowState {
    #[default]
    Active,
    Finished,
    ContinuedAsNew,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Active)
    }
}

/// Persisted instance record: created when a start event is accepted,
/// completed when the executor emits a terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance: WorkflowInstance,
    pub state: WorkflowState,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

/// Wall-clock epoch milliseconds. Never consulted inside workflow code;
/// workflows read time from the task bracket via `WorkflowContext::now_ms`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
