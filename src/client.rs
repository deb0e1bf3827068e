//! Client surface: submit instances, signal, cancel, remove, and read
//! results through a backend.

use crate::backend::Backend;
use crate::core::{WorkflowInstance, now_ms};
use crate::error::{BackendError, ClientError};
use crate::history::{Event, EventAttributes};
use crate::payload::{Metadata, from_payload, to_payload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const WAIT_INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const WAIT_MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Create a workflow instance and seed it with a start event. Fails
    /// with `InstanceAlreadyExists` for duplicate instance ids.
    pub async fn create_workflow_instance<I: Serialize>(
        &self,
        instance_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: &I,
    ) -> Result<WorkflowInstance, ClientError> {
        let payload = to_payload(self.backend.converter().as_ref(), input).map_err(ClientError::Conversion)?;
        let mut metadata = Metadata::default();
        for propagator in self.backend.context_propagators() {
            propagator.inject(&mut metadata);
        }
        let instance = WorkflowInstance::new(instance_id);
        let start_event = Event::new_pending(
            now_ms(),
            EventAttributes::WorkflowExecutionStarted {
                name: workflow_name.into(),
                input: payload,
                metadata,
                parent: None,
            },
        );
        self.backend
            .create_workflow_instance(instance.clone(), start_event)
            .await?;
        debug!(instance = %instance.instance_id, execution = %instance.execution_id, "created workflow instance");
        Ok(instance)
    }

    /// Deliver a signal to the current execution of `instance_id`.
    pub async fn signal_workflow<I: Serialize>(
        &self,
        instance_id: &str,
        name: impl Into<String>,
        input: &I,
    ) -> Result<(), ClientError> {
        let payload = to_payload(self.backend.converter().as_ref(), input).map_err(ClientError::Conversion)?;
        let signal_event = Event::new_pending(
            now_ms(),
            EventAttributes::SignalReceived {
                name: name.into(),
                input: payload,
            },
        );
        self.backend.signal_workflow(instance_id, signal_event).await?;
        Ok(())
    }

    /// Request cancellation of a running instance.
    pub async fn cancel_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), ClientError> {
        let cancel_event = Event::new_pending(now_ms(), EventAttributes::WorkflowExecutionCanceled);
        self.backend.cancel_workflow_instance(instance, cancel_event).await?;
        Ok(())
    }

    /// Remove all stored state of a terminal instance.
    pub async fn remove_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), ClientError> {
        self.backend.remove_workflow_instance(instance).await?;
        Ok(())
    }

    /// Poll until the execution reaches a terminal state. Backoff starts at
    /// 1 ms, multiplies by 1.5, and caps at 1 s; a zero timeout means the
    /// 20 s default.
    pub async fn wait_for_workflow_instance(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let timeout = if timeout.is_zero() { DEFAULT_WAIT_TIMEOUT } else { timeout };
        let deadline = Instant::now() + timeout;
        let mut backoff = WAIT_INITIAL_BACKOFF;
        loop {
            let state = self.backend.get_workflow_instance_state(instance).await?;
            if state.state.is_terminal() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff.mul_f64(1.5)).min(WAIT_MAX_BACKOFF);
        }
    }

    /// Wait for completion and decode the result from the terminal event.
    /// A continued-as-new execution yields its continuation input, matching
    /// the result visible to the execution that requested it.
    pub async fn get_workflow_result<T: DeserializeOwned>(
        &self,
        instance: &WorkflowInstance,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        self.wait_for_workflow_instance(instance, timeout).await?;
        let history = self.backend.get_workflow_instance_history(instance, None).await?;
        let converter = self.backend.converter();
        for event in history.iter().rev() {
            match &event.attributes {
                EventAttributes::WorkflowExecutionFinished { result, error } => {
                    return match error {
                        Some(e) => Err(ClientError::WorkflowFailed(e.clone())),
                        None => from_payload(converter.as_ref(), &result.clone().unwrap_or_default())
                            .map_err(ClientError::Conversion),
                    };
                }
                EventAttributes::WorkflowExecutionContinuedAsNew { input } => {
                    return from_payload(converter.as_ref(), input).map_err(ClientError::Conversion);
                }
                EventAttributes::WorkflowExecutionCanceled => return Err(ClientError::Canceled),
                EventAttributes::WorkflowExecutionTerminated { .. } => return Err(ClientError::Terminated),
                _ => {}
            }
        }
        Err(ClientError::Backend(BackendError::Internal(
            "workflow finished but history has no terminal event".into(),
        )))
    }
}
