//! The user-facing workflow context: every non-deterministic operation a
//! workflow needs goes through here and is recorded as a command.

use crate::command::{Command, CommandKind, CommandState};
use crate::core::WorkflowInstance;
use crate::error::WorkflowError;
use crate::futures::{ActivityFuture, CommandFuture, FutureCell, SignalFuture, SubWorkflowFuture, TimerFuture};
use crate::payload::{Converter, Metadata, Payload, from_payload, to_payload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutable workflow-run state shared between the context handed to user
/// code and the executor applying history. Guarded by a mutex, but only one
/// task per instance ever runs, so access is effectively single-threaded.
pub(crate) struct ContextState {
    pub(crate) instance: WorkflowInstance,
    pub(crate) workflow_name: String,
    pub(crate) metadata: Metadata,
    pub(crate) next_command_id: u64,
    /// All commands of this execution, in production order.
    pub(crate) commands: Vec<Command>,
    /// Unresolved futures by command id.
    pub(crate) open: HashMap<u64, Arc<FutureCell>>,
    /// Side-effect values recorded in history, indexed before user code runs.
    pub(crate) side_effects: HashMap<u64, Payload>,
    /// Signals that arrived before anyone waited on them.
    pub(crate) signal_buffers: HashMap<String, VecDeque<Payload>>,
    /// Waiters that subscribed before the signal arrived, FIFO per name.
    pub(crate) signal_waiters: HashMap<String, VecDeque<Arc<FutureCell>>>,
    /// Logical time: timestamp of the current task bracket.
    pub(crate) now_ms: u64,
    pub(crate) replaying: bool,
    pub(crate) canceled: bool,
}

impl ContextState {
    pub(crate) fn new(instance: WorkflowInstance, workflow_name: String, metadata: Metadata) -> Self {
        Self {
            instance,
            workflow_name,
            metadata,
            next_command_id: 1,
            commands: Vec::new(),
            open: HashMap::new(),
            side_effects: HashMap::new(),
            signal_buffers: HashMap::new(),
            signal_waiters: HashMap::new(),
            now_ms: 0,
            replaying: false,
            canceled: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub(crate) fn find_command_mut(&mut self, id: u64) -> Option<&mut Command> {
        self.commands.iter_mut().find(|c| c.id == id)
    }

    /// Resolve the open future for command `id` and mark the command done.
    /// Returns false when no open future exists (unknown or duplicate
    /// correlation).
    pub(crate) fn resolve_open(&mut self, id: u64, result: Result<Payload, WorkflowError>) -> bool {
        match self.open.remove(&id) {
            Some(cell) => {
                cell.resolve(result);
                if let Some(cmd) = self.find_command_mut(id) {
                    cmd.done();
                }
                true
            }
            None => false,
        }
    }

    /// Deliver a signal: wake the oldest waiter or buffer the payload.
    pub(crate) fn deliver_signal(&mut self, name: &str, payload: Payload) {
        if let Some(waiters) = self.signal_waiters.get_mut(name)
            && let Some(cell) = waiters.pop_front()
        {
            cell.resolve(Ok(payload));
            return;
        }
        self.signal_buffers.entry(name.to_string()).or_default().push_back(payload);
    }

    /// Instance-level cancellation: resolve every open future and waiter
    /// with a cancellation error. Iteration is by sorted key so the
    /// resolution order is replay-stable.
    pub(crate) fn cancel(&mut self) {
        self.canceled = true;
        let mut ids: Vec<u64> = self.open.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.resolve_open(id, Err(WorkflowError::canceled()));
        }
        let mut names: Vec<String> = self.signal_waiters.keys().cloned().collect();
        names.sort_unstable();
        for name in names {
            if let Some(waiters) = self.signal_waiters.remove(&name) {
                for cell in waiters {
                    cell.resolve(Err(WorkflowError::canceled()));
                }
            }
        }
    }

    /// Children scheduled but not yet resolved, for cascading cancellation.
    pub(crate) fn open_sub_workflows(&self) -> Vec<(u64, String)> {
        self.commands
            .iter()
            .filter(|c| c.state == CommandState::Committed)
            .filter_map(|c| match &c.kind {
                CommandKind::ScheduleSubWorkflow { instance_id, .. } => Some((c.id, instance_id.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Deterministic API surface available to workflow code. Cheap to clone;
/// all clones share the run's state.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) state: Arc<Mutex<ContextState>>,
    pub(crate) converter: Arc<dyn Converter>,
}

impl WorkflowContext {
    /// Record a command and its future. Once the instance is canceled, no
    /// further work is scheduled: the future resolves canceled immediately
    /// and nothing is recorded. The post-cancellation turn therefore leaves
    /// no trace in history beyond the terminal event, and replay does not
    /// need to re-run it.
    fn record<F>(&self, make_kind: F) -> (u64, Arc<FutureCell>)
    where
        F: FnOnce(u64) -> CommandKind,
    {
        let mut state = self.state.lock().unwrap();
        if state.canceled {
            return (0, FutureCell::ready(Err(WorkflowError::canceled())));
        }
        let id = state.next_id();
        let cell = FutureCell::pending();
        state.commands.push(Command::new(id, make_kind(id)));
        state.open.insert(id, cell.clone());
        (id, cell)
    }

    /// Schedule an activity and await its typed result.
    pub fn schedule_activity<I, O>(&self, name: impl Into<String>, input: &I) -> ActivityFuture<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let name = name.into();
        let (id, cell) = match to_payload(self.converter.as_ref(), input) {
            Ok(payload) => {
                let metadata = self.state.lock().unwrap().metadata.clone();
                self.record(|_| CommandKind::ScheduleActivity {
                    name,
                    input: payload,
                    metadata,
                })
            }
            Err(e) => (0, FutureCell::ready(Err(e))),
        };
        CommandFuture {
            id,
            cell,
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }

    /// Schedule a timer that fires after `delay` of logical time.
    pub fn timer(&self, delay: Duration) -> TimerFuture {
        let fire_at_ms = self.now_ms().saturating_add(delay.as_millis() as u64);
        let (id, cell) = self.record(|_| CommandKind::ScheduleTimer { fire_at_ms });
        TimerFuture { id, cell }
    }

    /// Cancel a timer. A timer canceled in the task that scheduled it never
    /// reaches history; a committed timer gets a `TimerCanceled` event and
    /// its parked firing removed. Already-fired timers are left alone.
    pub fn cancel_timer(&self, timer: &TimerFuture) {
        let mut state = self.state.lock().unwrap();
        let Some(cmd_state) = state.commands.iter().find(|c| c.id == timer.id).map(|c| c.state) else {
            return;
        };
        match cmd_state {
            CommandState::Pending => {
                if let Some(cmd) = state.find_command_mut(timer.id) {
                    cmd.done();
                }
                state.open.remove(&timer.id);
                timer.cell.resolve(Err(WorkflowError::canceled()));
            }
            CommandState::Committed if !timer.cell.is_resolved() => {
                if let Some(cmd) = state.find_command_mut(timer.id) {
                    cmd.done();
                }
                state.open.remove(&timer.id);
                let id = state.next_id();
                state
                    .commands
                    .push(Command::new(id, CommandKind::CancelTimer { timer_id: timer.id }));
                timer.cell.resolve(Err(WorkflowError::canceled()));
            }
            _ => {}
        }
    }

    /// Wait for a named signal and decode its payload.
    pub fn wait_signal<T: DeserializeOwned>(&self, name: impl Into<String>) -> SignalFuture<T> {
        let name = name.into();
        let mut state = self.state.lock().unwrap();
        let cell = if let Some(payload) = state.signal_buffers.get_mut(&name).and_then(VecDeque::pop_front) {
            FutureCell::ready(Ok(payload))
        } else if state.canceled {
            FutureCell::ready(Err(WorkflowError::canceled()))
        } else {
            let cell = FutureCell::pending();
            state.signal_waiters.entry(name).or_default().push_back(cell.clone());
            cell
        };
        SignalFuture {
            cell,
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }

    /// Start a sub-workflow and await its typed result.
    pub fn schedule_sub_workflow<I, O>(
        &self,
        name: impl Into<String>,
        options: SubWorkflowOptions,
        input: &I,
    ) -> SubWorkflowFuture<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let name = name.into();
        let (id, cell) = match to_payload(self.converter.as_ref(), input) {
            Ok(payload) => {
                let (parent_id, metadata) = {
                    let state = self.state.lock().unwrap();
                    (state.instance.instance_id.clone(), state.metadata.clone())
                };
                self.record(|id| CommandKind::ScheduleSubWorkflow {
                    instance_id: options
                        .instance_id
                        .unwrap_or_else(|| format!("{parent_id}:{id}")),
                    name,
                    input: payload,
                    metadata,
                })
            }
            Err(e) => (0, FutureCell::ready(Err(e))),
        };
        CommandFuture {
            id,
            cell,
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }

    /// Request cancellation of a scheduled sub-workflow.
    pub fn cancel_sub_workflow<O>(&self, sub_workflow: &SubWorkflowFuture<O>) {
        let mut state = self.state.lock().unwrap();
        let Some(cmd) = state.find_command_mut(sub_workflow.id) else {
            return;
        };
        let CommandKind::ScheduleSubWorkflow { instance_id, .. } = &cmd.kind else {
            return;
        };
        let instance_id = instance_id.clone();
        let sub_workflow_id = sub_workflow.id;
        let id = state.next_id();
        state.commands.push(Command::new(
            id,
            CommandKind::CancelSubWorkflow {
                sub_workflow_id,
                instance_id,
            },
        ));
    }

    /// Send a signal to another workflow instance. Fire-and-forget: the
    /// kernel records the send; delivery failures are logged by the worker.
    /// Dropped silently once the instance is canceled.
    pub fn signal_workflow<I: Serialize>(&self, instance_id: impl Into<String>, name: impl Into<String>, input: &I) {
        let instance_id = instance_id.into();
        let name = name.into();
        if let Ok(payload) = to_payload(self.converter.as_ref(), input) {
            let mut state = self.state.lock().unwrap();
            if state.canceled {
                return;
            }
            let id = state.next_id();
            state.commands.push(Command::new(
                id,
                CommandKind::SignalWorkflow {
                    instance_id,
                    name,
                    input: payload,
                },
            ));
        }
    }

    /// Run a non-deterministic computation once and record its result. On
    /// replay the recorded value is returned and `f` never runs. Fails with
    /// a cancellation error once the instance is canceled.
    pub fn side_effect<T, F>(&self, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let mut state = self.state.lock().unwrap();
        if state.canceled {
            return Err(WorkflowError::canceled());
        }
        let id = state.next_id();
        if let Some(recorded) = state.side_effects.remove(&id) {
            state
                .commands
                .push(Command::new(id, CommandKind::SideEffect { result: recorded.clone() }));
            drop(state);
            return from_payload(self.converter.as_ref(), &recorded);
        }
        if state.replaying {
            return Err(WorkflowError::non_determinism(format!(
                "side effect {id} has no recorded result in history"
            )));
        }
        drop(state);
        let value = f();
        let payload = to_payload(self.converter.as_ref(), &value)?;
        let mut state = self.state.lock().unwrap();
        state.commands.push(Command::new(id, CommandKind::SideEffect { result: payload }));
        Ok(value)
    }

    /// End this execution and start a fresh one with `input`. The current
    /// run should return promptly afterwards; its return value is ignored.
    /// Fails with a cancellation error once the instance is canceled.
    pub fn continue_as_new<I: Serialize>(&self, input: &I) -> Result<(), WorkflowError> {
        let payload = to_payload(self.converter.as_ref(), input)?;
        let mut state = self.state.lock().unwrap();
        if state.canceled {
            return Err(WorkflowError::canceled());
        }
        let id = state.next_id();
        let kind = CommandKind::ContinueAsNew {
            name: state.workflow_name.clone(),
            input: payload,
            metadata: state.metadata.clone(),
        };
        state.commands.push(Command::new(id, kind));
        Ok(())
    }

    /// Logical time: the timestamp of the task bracket being processed.
    pub fn now_ms(&self) -> u64 {
        self.state.lock().unwrap().now_ms
    }

    /// True while committed history is being replayed.
    pub fn is_replaying(&self) -> bool {
        self.state.lock().unwrap().replaying
    }

    /// True once an instance-level cancellation has been observed.
    pub fn is_canceled(&self) -> bool {
        self.state.lock().unwrap().canceled
    }

    pub fn instance(&self) -> WorkflowInstance {
        self.state.lock().unwrap().instance.clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.state.lock().unwrap().metadata.clone()
    }

    /// Replay-gated logging: emitted only when the code is making fresh
    /// progress, so a replayed workflow does not re-log old turns.
    pub fn log_debug(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::debug!(instance = %self.instance().instance_id, "{}", message.as_ref());
        }
    }

    pub fn log_info(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::info!(instance = %self.instance().instance_id, "{}", message.as_ref());
        }
    }

    pub fn log_warn(&self, message: impl AsRef<str>) {
        if !self.is_replaying() {
            tracing::warn!(instance = %self.instance().instance_id, "{}", message.as_ref());
        }
    }
}

/// Options for starting a sub-workflow.
#[derive(Debug, Clone, Default)]
pub struct SubWorkflowOptions {
    /// Child instance id; defaults to `"{parent}:{command_id}"`, which is
    /// unique and replay-stable.
    pub instance_id: Option<String>,
}
