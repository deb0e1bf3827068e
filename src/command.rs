//! Commands: side-effect intents emitted by workflow code, and their
//! translation into history events and outbound messages.

use crate::backend::{ActivityMessage, InstanceMessage, TimerMessage};
use crate::core::WorkflowInstance;
use crate::error::WorkflowError;
use crate::history::{Event, EventAttributes};
use crate::payload::{Metadata, Payload};

/// Lifecycle of a command. `Pending` commands were produced by the current
/// run and await translation; `Committed` commands have their scheduling
/// event in history; `Done` commands saw their terminal response (or were
/// canceled before commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    Committed,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    ScheduleActivity {
        name: String,
        input: Payload,
        metadata: Metadata,
    },
    ScheduleTimer {
        fire_at_ms: u64,
    },
    /// Cancels the committed timer command with id `timer_id`.
    CancelTimer {
        timer_id: u64,
    },
    ScheduleSubWorkflow {
        instance_id: String,
        name: String,
        input: Payload,
        metadata: Metadata,
    },
    /// Requests cancellation of the child scheduled by command
    /// `sub_workflow_id`.
    CancelSubWorkflow {
        sub_workflow_id: u64,
        instance_id: String,
    },
    SignalWorkflow {
        instance_id: String,
        name: String,
        input: Payload,
    },
    /// Carries the value recorded on first execution.
    SideEffect {
        result: Payload,
    },
    CompleteWorkflow {
        result: Option<Payload>,
        error: Option<WorkflowError>,
    },
    ContinueAsNew {
        name: String,
        input: Payload,
        metadata: Metadata,
    },
}

impl CommandKind {
    /// Stable name used in non-determinism diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ScheduleActivity { .. } => "ScheduleActivity",
            CommandKind::ScheduleTimer { .. } => "ScheduleTimer",
            CommandKind::CancelTimer { .. } => "CancelTimer",
            CommandKind::ScheduleSubWorkflow { .. } => "ScheduleSubWorkflow",
            CommandKind::CancelSubWorkflow { .. } => "CancelSubWorkflow",
            CommandKind::SignalWorkflow { .. } => "SignalWorkflow",
            CommandKind::SideEffect { .. } => "SideEffect",
            CommandKind::CompleteWorkflow { .. } => "CompleteWorkflow",
            CommandKind::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// What committing one command produces: exactly one scheduling event and
/// at most one outbound message.
#[derive(Debug, Default)]
pub struct CommandEffects {
    pub event: Option<Event>,
    pub activity_message: Option<ActivityMessage>,
    pub timer_message: Option<TimerMessage>,
    pub instance_messages: Vec<InstanceMessage>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: u64,
    pub state: CommandState,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(id: u64, kind: CommandKind) -> Self {
        Self {
            id,
            state: CommandState::Pending,
            kind,
        }
    }

    /// Transition Pending → Committed, emitting the scheduling event and
    /// outbound message this command implies. Committed and Done commands
    /// produce nothing; replays route matched commands straight to
    /// Committed without calling this.
    pub fn execute(&mut self, instance: &WorkflowInstance, now_ms: u64) -> CommandEffects {
        if self.state != CommandState::Pending {
            return CommandEffects::default();
        }
        self.state = CommandState::Committed;

        let mut effects = CommandEffects::default();
        match &self.kind {
            CommandKind::ScheduleActivity { name, input, metadata } => {
                effects.event = Some(
                    Event::new_pending(
                        now_ms,
                        EventAttributes::ActivityScheduled {
                            name: name.clone(),
                            input: input.clone(),
                            metadata: metadata.clone(),
                        },
                    )
                    .with_schedule_event_id(self.id),
                );
                effects.activity_message = Some(ActivityMessage {
                    instance: instance.clone(),
                    schedule_event_id: self.id,
                    name: name.clone(),
                    input: input.clone(),
                    metadata: metadata.clone(),
                });
            }
            CommandKind::ScheduleTimer { fire_at_ms } => {
                effects.event = Some(
                    Event::new_pending(now_ms, EventAttributes::TimerScheduled { fire_at_ms: *fire_at_ms })
                        .with_schedule_event_id(self.id)
                        .with_visible_at(*fire_at_ms),
                );
                effects.timer_message = Some(TimerMessage::Schedule {
                    instance: instance.clone(),
                    schedule_event_id: self.id,
                    fire_at_ms: *fire_at_ms,
                });
            }
            CommandKind::CancelTimer { timer_id } => {
                effects.event =
                    Some(Event::new_pending(now_ms, EventAttributes::TimerCanceled).with_schedule_event_id(*timer_id));
                effects.timer_message = Some(TimerMessage::Cancel {
                    instance: instance.clone(),
                    schedule_event_id: *timer_id,
                });
            }
            CommandKind::ScheduleSubWorkflow {
                instance_id,
                name,
                input,
                metadata,
            } => {
                effects.event = Some(
                    Event::new_pending(
                        now_ms,
                        EventAttributes::SubWorkflowScheduled {
                            instance_id: instance_id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                            metadata: metadata.clone(),
                        },
                    )
                    .with_schedule_event_id(self.id),
                );
                let child = WorkflowInstance::new_sub_workflow(
                    instance_id.clone(),
                    crate::core::ParentRef {
                        instance_id: instance.instance_id.clone(),
                        execution_id: instance.execution_id.clone(),
                        schedule_event_id: self.id,
                    },
                );
                let start_event = Event::new_pending(
                    now_ms,
                    EventAttributes::WorkflowExecutionStarted {
                        name: name.clone(),
                        input: input.clone(),
                        metadata: metadata.clone(),
                        parent: child.parent.clone(),
                    },
                );
                effects.instance_messages.push(InstanceMessage::Start {
                    instance: child,
                    start_event,
                });
            }
            CommandKind::CancelSubWorkflow {
                sub_workflow_id,
                instance_id,
            } => {
                effects.event = Some(
                    Event::new_pending(
                        now_ms,
                        EventAttributes::SubWorkflowCancellationRequested {
                            instance_id: instance_id.clone(),
                        },
                    )
                    .with_schedule_event_id(*sub_workflow_id),
                );
                effects.instance_messages.push(InstanceMessage::Deliver {
                    target_instance_id: instance_id.clone(),
                    event: Event::new_pending(now_ms, EventAttributes::WorkflowExecutionCanceled),
                });
            }
            CommandKind::SignalWorkflow {
                instance_id,
                name,
                input,
            } => {
                effects.event = Some(
                    Event::new_pending(
                        now_ms,
                        EventAttributes::SignalSent {
                            target_instance_id: instance_id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        },
                    )
                    .with_schedule_event_id(self.id),
                );
                effects.instance_messages.push(InstanceMessage::Deliver {
                    target_instance_id: instance_id.clone(),
                    event: Event::new_pending(
                        now_ms,
                        EventAttributes::SignalReceived {
                            name: name.clone(),
                            input: input.clone(),
                        },
                    ),
                });
            }
            CommandKind::SideEffect { result } => {
                effects.event = Some(
                    Event::new_pending(now_ms, EventAttributes::SideEffectResult { result: result.clone() })
                        .with_schedule_event_id(self.id),
                );
            }
            CommandKind::CompleteWorkflow { result, error } => {
                // Terminal per cause: a canceled outcome closes the
                // execution with the Canceled event, everything else with
                // Finished.
                let canceled = error.as_ref().is_some_and(WorkflowError::is_canceled);
                effects.event = Some(if canceled {
                    Event::new_pending(now_ms, EventAttributes::WorkflowExecutionCanceled)
                } else {
                    Event::new_pending(
                        now_ms,
                        EventAttributes::WorkflowExecutionFinished {
                            result: result.clone(),
                            error: error.clone(),
                        },
                    )
                });
                if let Some(parent) = &instance.parent {
                    let attributes = match error {
                        None => EventAttributes::SubWorkflowCompleted {
                            result: result.clone().unwrap_or_default(),
                        },
                        Some(e) => EventAttributes::SubWorkflowFailed { error: e.clone() },
                    };
                    effects.instance_messages.push(InstanceMessage::Deliver {
                        target_instance_id: parent.instance_id.clone(),
                        event: Event::new_pending(now_ms, attributes)
                            .with_schedule_event_id(parent.schedule_event_id),
                    });
                }
            }
            CommandKind::ContinueAsNew { name, input, metadata } => {
                effects.event = Some(Event::new_pending(
                    now_ms,
                    EventAttributes::WorkflowExecutionContinuedAsNew { input: input.clone() },
                ));
                let next = instance.next_execution();
                let start_event = Event::new_pending(
                    now_ms,
                    EventAttributes::WorkflowExecutionStarted {
                        name: name.clone(),
                        input: input.clone(),
                        metadata: metadata.clone(),
                        parent: next.parent.clone(),
                    },
                );
                effects.instance_messages.push(InstanceMessage::Start {
                    instance: next,
                    start_event,
                });
            }
        }
        effects
    }

    pub fn done(&mut self) {
        self.state = CommandState::Done;
    }
}
