//! Append-only history events: the envelope with sequence and correlation
//! ids, and the typed attribute variants.

use crate::core::ParentRef;
use crate::error::WorkflowError;
use crate::payload::{Metadata, Payload};
use serde::{Deserialize, Serialize};

/// A durable, ordered record of an occurrence in an instance's history.
///
/// `sequence_id` is zero while the event sits in the pending queue and is
/// assigned (strictly monotonic, dense from 1) when the event is committed.
/// `schedule_event_id` correlates a response to the command that produced
/// the earlier scheduling event. `visible_at_ms` delays dispatch of pending
/// events (timers, delayed signals) until wall clock reaches the stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence_id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub schedule_event_id: Option<u64>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub visible_at_ms: Option<u64>,
    pub attributes: EventAttributes,
}

/// Typed event payloads, one variant per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        name: String,
        input: Payload,
        metadata: Metadata,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parent: Option<ParentRef>,
    },
    WorkflowExecutionFinished {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<Payload>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<WorkflowError>,
    },
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        input: Payload,
    },
    WorkflowTaskStarted,
    ActivityScheduled {
        name: String,
        input: Payload,
        metadata: Metadata,
    },
    ActivityCompleted {
        result: Payload,
    },
    ActivityFailed {
        error: WorkflowError,
    },
    TimerScheduled {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    TimerCanceled,
    SignalReceived {
        name: String,
        input: Payload,
    },
    SignalSent {
        target_instance_id: String,
        name: String,
        input: Payload,
    },
    SubWorkflowScheduled {
        instance_id: String,
        name: String,
        input: Payload,
        metadata: Metadata,
    },
    SubWorkflowCompleted {
        result: Payload,
    },
    SubWorkflowFailed {
        error: WorkflowError,
    },
    SubWorkflowCancellationRequested {
        instance_id: String,
    },
    SideEffectResult {
        result: Payload,
    },
}

/// Fieldless discriminant of `EventAttributes`, used for correlation and
/// protocol checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionFinished,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionContinuedAsNew,
    WorkflowTaskStarted,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    TimerCanceled,
    SignalReceived,
    SignalSent,
    SubWorkflowScheduled,
    SubWorkflowCompleted,
    SubWorkflowFailed,
    SubWorkflowCancellationRequested,
    SideEffectResult,
}

impl Event {
    /// A not-yet-committed event: no sequence id until the backend commits.
    pub fn new_pending(timestamp_ms: u64, attributes: EventAttributes) -> Self {
        Self {
            sequence_id: 0,
            schedule_event_id: None,
            timestamp_ms,
            visible_at_ms: None,
            attributes,
        }
    }

    pub fn with_schedule_event_id(mut self, id: u64) -> Self {
        self.schedule_event_id = Some(id);
        self
    }

    pub fn with_visible_at(mut self, visible_at_ms: u64) -> Self {
        self.visible_at_ms = Some(visible_at_ms);
        self
    }

    pub fn event_type(&self) -> EventType {
        match &self.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionFinished { .. } => EventType::WorkflowExecutionFinished,
            EventAttributes::WorkflowExecutionCanceled => EventType::WorkflowExecutionCanceled,
            EventAttributes::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => EventType::WorkflowExecutionContinuedAsNew,
            EventAttributes::WorkflowTaskStarted => EventType::WorkflowTaskStarted,
            EventAttributes::ActivityScheduled { .. } => EventType::ActivityScheduled,
            EventAttributes::ActivityCompleted { .. } => EventType::ActivityCompleted,
            EventAttributes::ActivityFailed { .. } => EventType::ActivityFailed,
            EventAttributes::TimerScheduled { .. } => EventType::TimerScheduled,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
            EventAttributes::TimerCanceled => EventType::TimerCanceled,
            EventAttributes::SignalReceived { .. } => EventType::SignalReceived,
            EventAttributes::SignalSent { .. } => EventType::SignalSent,
            EventAttributes::SubWorkflowScheduled { .. } => EventType::SubWorkflowScheduled,
            EventAttributes::SubWorkflowCompleted { .. } => EventType::SubWorkflowCompleted,
            EventAttributes::SubWorkflowFailed { .. } => EventType::SubWorkflowFailed,
            EventAttributes::SubWorkflowCancellationRequested { .. } => EventType::SubWorkflowCancellationRequested,
            EventAttributes::SideEffectResult { .. } => EventType::SideEffectResult,
        }
    }

    /// Terminal events close an execution: nothing may follow them, and
    /// committed history holds at most one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::WorkflowExecutionFinished
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionTerminated
                | EventType::WorkflowExecutionContinuedAsNew
        )
    }
}

impl EventType {
    /// Scheduling events open a correlation that a response of the paired
    /// kind eventually closes.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            EventType::ActivityScheduled | EventType::TimerScheduled | EventType::SubWorkflowScheduled
        )
    }

    /// The scheduling event type a response event must correlate to.
    pub fn scheduling_counterpart(&self) -> Option<EventType> {
        match self {
            EventType::ActivityCompleted | EventType::ActivityFailed => Some(EventType::ActivityScheduled),
            EventType::TimerFired | EventType::TimerCanceled => Some(EventType::TimerScheduled),
            EventType::SubWorkflowCompleted | EventType::SubWorkflowFailed => Some(EventType::SubWorkflowScheduled),
            _ => None,
        }
    }
}
