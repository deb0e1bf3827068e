//! The workflow executor: replays committed history, applies newly arrived
//! events, runs user code inside the deterministic scheduler, and turns the
//! produced commands into history events and outbound messages.

use crate::backend::{InstanceMessage, WorkflowTask, WorkflowTaskResult};
use crate::command::{Command, CommandKind, CommandState};
use crate::context::{ContextState, WorkflowContext};
use crate::core::{WorkflowInstance, WorkflowState, now_ms};
use crate::error::{ExecutorError, WorkflowError};
use crate::futures::poll_once;
use crate::history::{Event, EventAttributes, EventType};
use crate::payload::{Converter, Payload};
use crate::registry::WorkflowRegistry;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Poll;
use tracing::warn;

type RootFuture = Pin<Box<dyn Future<Output = Result<Payload, WorkflowError>> + Send>>;

/// Replay engine for one workflow execution. Workers keep executors cached
/// between tasks; a cache miss reconstructs state by replaying committed
/// history.
pub struct WorkflowExecutor {
    registry: WorkflowRegistry,
    converter: Arc<dyn Converter>,
    instance: WorkflowInstance,
    state: Arc<Mutex<ContextState>>,
    root: Option<RootFuture>,
    /// Outcome of the root future once it has completed.
    completion: Option<Result<Payload, WorkflowError>>,
    /// Set once a terminal event was observed or emitted; a terminated
    /// execution never produces further events.
    terminated: bool,
    /// Scheduling-event correlation ids seen in committed history, used to
    /// tell corrupt history from non-deterministic code.
    scheduled_ids: HashSet<u64>,
    last_sequence_id: u64,
}

impl WorkflowExecutor {
    pub fn new(registry: WorkflowRegistry, converter: Arc<dyn Converter>, instance: WorkflowInstance) -> Self {
        let state = Arc::new(Mutex::new(ContextState::new(
            instance.clone(),
            String::new(),
            Default::default(),
        )));
        Self {
            registry,
            converter,
            instance,
            state,
            root: None,
            completion: None,
            terminated: false,
            scheduled_ids: HashSet::new(),
            last_sequence_id: 0,
        }
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.last_sequence_id
    }

    /// Reconstruct in-memory state from committed history. Commands the
    /// re-run produces are matched against the scheduling events already
    /// present; any mismatch is a non-determinism error and the executor
    /// must be discarded.
    pub fn replay(&mut self, history: &[Event]) -> Result<(), ExecutorError> {
        // Side-effect markers sit after the bracket that produced them but
        // their values must be readable during that bracket's re-run.
        {
            let mut state = self.state.lock().unwrap();
            for ev in history {
                if let EventAttributes::SideEffectResult { result } = &ev.attributes
                    && let Some(id) = ev.schedule_event_id
                {
                    state.side_effects.insert(id, result.clone());
                }
            }
            state.replaying = true;
        }

        let mut expected_seq = self.last_sequence_id;
        for ev in history {
            expected_seq += 1;
            if ev.sequence_id != expected_seq {
                return Err(ExecutorError::CorruptHistory(format!(
                    "sequence gap: expected {expected_seq}, found {} ({:?})",
                    ev.sequence_id,
                    ev.event_type()
                )));
            }
            self.apply_history_event(ev)?;
            self.last_sequence_id = expected_seq;
        }

        // Every command the re-run produced must have found its scheduling
        // event; a leftover means the current code schedules work the
        // recorded run never did.
        {
            let state = self.state.lock().unwrap();
            if let Some(cmd) = state.commands.iter().find(|c| c.state == CommandState::Pending) {
                return Err(ExecutorError::NonDeterminism(format!(
                    "command {} ({}) has no matching event in history",
                    cmd.id,
                    cmd.kind.name()
                )));
            }
        }
        if let Some(Err(e)) = &self.completion
            && e.kind == WorkflowError::KIND_NON_DETERMINISM
        {
            return Err(ExecutorError::NonDeterminism(e.message.clone()));
        }
        self.state.lock().unwrap().replaying = false;
        Ok(())
    }

    /// Run one workflow task: consume its new events, run user code at the
    /// task bracket, translate fresh commands, and detect termination.
    pub fn execute_task(&mut self, task: &WorkflowTask) -> Result<WorkflowTaskResult, ExecutorError> {
        let mut result = WorkflowTaskResult::new();
        if self.terminated {
            // Late deliveries to a finished execution commit nothing; the
            // backend clears the consumed pending events on completion.
            return Ok(result);
        }

        // 1. Consumed pending prefix. A cancellation request is noted here
        // but applied only after the bracket turn; its committed record is
        // the terminal Canceled event itself.
        let mut consumed: Vec<Event> = Vec::new();
        let mut cancel_requested = false;
        for ev in &task.new_events {
            if ev.event_type() == EventType::WorkflowExecutionCanceled {
                cancel_requested = true;
                continue;
            }
            if self.apply_new_event(ev) {
                consumed.push(ev.clone());
            }
        }

        // 2. Task bracket: stamp logical time, run user code forward.
        let bracket_ts = now_ms();
        self.state.lock().unwrap().now_ms = bracket_ts;
        self.run_scheduler();

        // 3. Apply the cancellation: every open future resolves canceled
        // and the workflow gets one more turn to run its cancellation path.
        // Nothing can be scheduled past this point, so the terminal event
        // alone reproduces the same state on replay.
        let mut canceled_children: Vec<(u64, String)> = Vec::new();
        if cancel_requested {
            let mut state = self.state.lock().unwrap();
            canceled_children = state.open_sub_workflows();
            state.cancel();
            drop(state);
            self.run_scheduler();
        }

        // 4. Translate commands that are still pending, in production order.
        let pending_ids: Vec<u64> = {
            let state = self.state.lock().unwrap();
            state
                .commands
                .iter()
                .filter(|c| c.state == CommandState::Pending)
                .map(|c| c.id)
                .collect()
        };
        let continuing = {
            let state = self.state.lock().unwrap();
            state
                .commands
                .iter()
                .any(|c| c.state == CommandState::Pending && matches!(c.kind, CommandKind::ContinueAsNew { .. }))
        };

        let mut command_events: Vec<Event> = Vec::new();
        let mut terminal_event: Option<Event> = None;
        for id in pending_ids {
            let mut state = self.state.lock().unwrap();
            let Some(cmd) = state.find_command_mut(id) else { continue };
            let is_terminal_cmd = matches!(cmd.kind, CommandKind::ContinueAsNew { .. });
            let effects = {
                let instance = self.instance.clone();
                cmd.execute(&instance, bracket_ts)
            };
            drop(state);
            if let Some(ev) = effects.event {
                if is_terminal_cmd {
                    terminal_event = Some(ev);
                    result.state = WorkflowState::ContinuedAsNew;
                } else {
                    if let Some(id) = ev.schedule_event_id {
                        self.scheduled_ids.insert(id);
                    }
                    command_events.push(ev);
                }
            }
            result.activity_messages.extend(effects.activity_message);
            result.timer_messages.extend(effects.timer_message);
            result.instance_messages.extend(effects.instance_messages);
        }

        // 5. Termination by completion of the root future (unless the run
        // already ended via continue-as-new). A canceled outcome commits
        // the Canceled terminal; anything else commits Finished.
        if !continuing && let Some(outcome) = self.completion.clone() {
            let canceled = outcome.as_ref().is_err_and(WorkflowError::is_canceled);
            let mut complete = Command::new(
                self.state.lock().unwrap().next_command_id,
                CommandKind::CompleteWorkflow {
                    result: outcome.as_ref().ok().cloned(),
                    error: outcome.err(),
                },
            );
            let effects = complete.execute(&self.instance, bracket_ts);
            terminal_event = effects.event;
            result.instance_messages.extend(effects.instance_messages);
            result.state = WorkflowState::Finished;

            // Cascading cancellation: children without a terminal response
            // get a cancel event of their own.
            if canceled {
                for (_, child_id) in canceled_children.drain(..) {
                    result.instance_messages.push(InstanceMessage::Deliver {
                        target_instance_id: child_id,
                        event: Event::new_pending(bracket_ts, EventAttributes::WorkflowExecutionCanceled),
                    });
                }
            }
        }

        // 6. Assemble the committed batch:
        // [consumed…, TaskStarted, command events…, terminal?]. An empty
        // task (nothing consumed, nothing produced) commits nothing.
        if consumed.is_empty() && command_events.is_empty() && terminal_event.is_none() {
            return Ok(result);
        }
        result.executed_events = consumed;
        result
            .executed_events
            .push(Event::new_pending(bracket_ts, EventAttributes::WorkflowTaskStarted));
        result.executed_events.extend(command_events);
        if let Some(term) = terminal_event {
            self.terminated = true;
            result.executed_events.push(term);
        }
        for ev in &mut result.executed_events {
            self.last_sequence_id += 1;
            ev.sequence_id = self.last_sequence_id;
        }
        Ok(result)
    }

    /// Poll the root future once with the no-op waker. Cells resolve only
    /// through event application, so a single poll per bracket drives all
    /// runnable branches to their next suspension point.
    fn run_scheduler(&mut self) {
        if self.completion.is_some() {
            return;
        }
        let Some(root) = self.root.as_mut() else {
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| poll_once(root))) {
            Ok(Poll::Ready(outcome)) => self.completion = Some(outcome),
            Ok(Poll::Pending) => {}
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "workflow panicked".to_string());
                self.completion = Some(Err(WorkflowError::panic(message)));
            }
        }
    }

    /// Apply one committed event during replay.
    fn apply_history_event(&mut self, ev: &Event) -> Result<(), ExecutorError> {
        match &ev.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => {
                self.start_workflow(ev);
                Ok(())
            }
            EventAttributes::WorkflowTaskStarted => {
                self.state.lock().unwrap().now_ms = ev.timestamp_ms;
                self.run_scheduler();
                Ok(())
            }
            EventAttributes::ActivityScheduled { .. }
            | EventAttributes::TimerScheduled { .. }
            | EventAttributes::TimerCanceled
            | EventAttributes::SubWorkflowScheduled { .. }
            | EventAttributes::SubWorkflowCancellationRequested { .. }
            | EventAttributes::SignalSent { .. }
            | EventAttributes::SideEffectResult { .. } => self.match_scheduling_event(ev),
            EventAttributes::ActivityCompleted { result } => {
                self.resolve_response(ev, Ok(result.clone()), true).map(drop)
            }
            EventAttributes::ActivityFailed { error } => self.resolve_response(ev, Err(error.clone()), true).map(drop),
            EventAttributes::TimerFired { .. } => self.resolve_response(ev, Ok(Payload::empty()), true).map(drop),
            EventAttributes::SubWorkflowCompleted { result } => {
                self.resolve_response(ev, Ok(result.clone()), true).map(drop)
            }
            EventAttributes::SubWorkflowFailed { error } => {
                self.resolve_response(ev, Err(error.clone()), true).map(drop)
            }
            EventAttributes::SignalReceived { name, input } => {
                self.state.lock().unwrap().deliver_signal(name, input.clone());
                Ok(())
            }
            EventAttributes::WorkflowExecutionFinished { result, error } => {
                self.terminated = true;
                self.completion = Some(match error {
                    Some(e) => Err(e.clone()),
                    None => Ok(result.clone().unwrap_or_default()),
                });
                Ok(())
            }
            EventAttributes::WorkflowExecutionCanceled => {
                // Terminal cancellation record: settle every open command
                // the way the live run did, then close the execution.
                self.terminated = true;
                self.state.lock().unwrap().cancel();
                self.completion = Some(Err(WorkflowError::canceled()));
                Ok(())
            }
            EventAttributes::WorkflowExecutionTerminated { reason } => {
                self.terminated = true;
                self.completion = Some(Err(WorkflowError::permanent(format!("terminated: {reason}"))));
                Ok(())
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.terminated = true;
                // The ContinueAsNew command of the final bracket matches here.
                let mut state = self.state.lock().unwrap();
                if let Some(cmd) = state
                    .commands
                    .iter_mut()
                    .find(|c| c.state == CommandState::Pending && matches!(c.kind, CommandKind::ContinueAsNew { .. }))
                {
                    cmd.state = CommandState::Committed;
                }
                Ok(())
            }
        }
    }

    /// Apply one newly arrived pending event. Returns false when the event
    /// is dropped as a protocol violation (unknown or duplicate
    /// correlation); dropped events are never committed.
    fn apply_new_event(&mut self, ev: &Event) -> bool {
        match &ev.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => {
                self.start_workflow(ev);
                true
            }
            EventAttributes::SignalReceived { name, input } => {
                self.state.lock().unwrap().deliver_signal(name, input.clone());
                true
            }
            EventAttributes::ActivityCompleted { result } => {
                self.resolve_response(ev, Ok(result.clone()), false).unwrap_or(false)
            }
            EventAttributes::ActivityFailed { error } => {
                self.resolve_response(ev, Err(error.clone()), false).unwrap_or(false)
            }
            EventAttributes::TimerFired { .. } => self.resolve_response(ev, Ok(Payload::empty()), false).unwrap_or(false),
            EventAttributes::SubWorkflowCompleted { result } => {
                self.resolve_response(ev, Ok(result.clone()), false).unwrap_or(false)
            }
            EventAttributes::SubWorkflowFailed { error } => {
                self.resolve_response(ev, Err(error.clone()), false).unwrap_or(false)
            }
            other => {
                warn!(
                    instance = %self.instance.instance_id,
                    event = ?ev.event_type(),
                    "unexpected event in pending queue; dropping: {other:?}"
                );
                false
            }
        }
    }

    /// Initialize the root future from the start event. An unregistered
    /// workflow name fails the instance rather than the worker.
    fn start_workflow(&mut self, ev: &Event) {
        let EventAttributes::WorkflowExecutionStarted {
            name, input, metadata, ..
        } = &ev.attributes
        else {
            return;
        };
        if self.root.is_some() || self.completion.is_some() {
            warn!(instance = %self.instance.instance_id, "duplicate start event ignored");
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.workflow_name = name.clone();
            state.metadata = metadata.clone();
            state.now_ms = ev.timestamp_ms;
        }
        match self.registry.get(name) {
            Some(handler) => {
                let ctx = WorkflowContext {
                    state: self.state.clone(),
                    converter: self.converter.clone(),
                };
                let input = input.clone();
                self.root = Some(Box::pin(async move { handler.invoke(ctx, input).await }));
            }
            None => {
                self.completion = Some(Err(WorkflowError::permanent(format!("workflow not registered: {name}"))));
            }
        }
    }

    /// Match a scheduling event in committed history against the command
    /// the re-run just produced.
    fn match_scheduling_event(&mut self, ev: &Event) -> Result<(), ExecutorError> {
        let Some(sid) = ev.schedule_event_id else {
            return Err(ExecutorError::CorruptHistory(format!(
                "{:?} event without schedule_event_id",
                ev.event_type()
            )));
        };
        self.scheduled_ids.insert(sid);
        let et = ev.event_type();
        let mut state = self.state.lock().unwrap();
        let cmd = match et {
            // Cancellations correlate to the command they cancel, not to
            // their own command id.
            EventType::TimerCanceled => state
                .commands
                .iter_mut()
                .find(|c| matches!(&c.kind, CommandKind::CancelTimer { timer_id } if *timer_id == sid)),
            EventType::SubWorkflowCancellationRequested => state.commands.iter_mut().find(
                |c| matches!(&c.kind, CommandKind::CancelSubWorkflow { sub_workflow_id, .. } if *sub_workflow_id == sid),
            ),
            _ => state.commands.iter_mut().find(|c| c.id == sid),
        };
        let Some(cmd) = cmd else {
            return Err(ExecutorError::NonDeterminism(format!(
                "history has {et:?} (schedule id {sid}) but the workflow produced no matching command"
            )));
        };
        let matched = match (&cmd.kind, &ev.attributes) {
            (CommandKind::ScheduleActivity { name: cn, .. }, EventAttributes::ActivityScheduled { name: en, .. }) => {
                cn == en
            }
            (CommandKind::ScheduleTimer { .. }, EventAttributes::TimerScheduled { .. }) => true,
            (CommandKind::CancelTimer { .. }, EventAttributes::TimerCanceled) => true,
            (
                CommandKind::ScheduleSubWorkflow {
                    name: cn,
                    instance_id: ci,
                    ..
                },
                EventAttributes::SubWorkflowScheduled {
                    name: en,
                    instance_id: ei,
                    ..
                },
            ) => cn == en && ci == ei,
            (CommandKind::CancelSubWorkflow { .. }, EventAttributes::SubWorkflowCancellationRequested { .. }) => true,
            (
                CommandKind::SignalWorkflow {
                    name: cn,
                    instance_id: ci,
                    ..
                },
                EventAttributes::SignalSent {
                    name: en,
                    target_instance_id: ei,
                    ..
                },
            ) => cn == en && ci == ei,
            (CommandKind::SideEffect { .. }, EventAttributes::SideEffectResult { .. }) => true,
            _ => false,
        };
        if !matched {
            return Err(ExecutorError::NonDeterminism(format!(
                "command {} is {} but history records {et:?} for schedule id {sid}",
                cmd.id,
                cmd.kind.name()
            )));
        }
        if cmd.state == CommandState::Pending {
            cmd.state = CommandState::Committed;
        }
        Ok(())
    }

    /// Resolve the future bound to a response event. Returns whether the
    /// event settled a command (and so belongs in committed history).
    /// During replay a response whose scheduling event never appeared is
    /// corrupt history; a live event with an unknown correlation is a
    /// protocol violation, logged and dropped.
    fn resolve_response(
        &mut self,
        ev: &Event,
        outcome: Result<Payload, WorkflowError>,
        replaying: bool,
    ) -> Result<bool, ExecutorError> {
        let et = ev.event_type();
        let Some(sid) = ev.schedule_event_id else {
            if replaying {
                return Err(ExecutorError::CorruptHistory(format!(
                    "{et:?} response without schedule_event_id"
                )));
            }
            warn!(instance = %self.instance.instance_id, "{et:?} without schedule_event_id; dropping");
            return Ok(false);
        };
        if replaying && !self.scheduled_ids.contains(&sid) {
            return Err(ExecutorError::CorruptHistory(format!(
                "{et:?} response correlates to schedule id {sid} with no scheduling event"
            )));
        }
        let resolved = self.state.lock().unwrap().resolve_open(sid, outcome);
        if !resolved {
            warn!(
                instance = %self.instance.instance_id,
                schedule_event_id = sid,
                "{et:?} for unknown or already settled command; dropping"
            );
            return Ok(false);
        }
        Ok(true)
    }
}
