//! Error types: the serializable workflow-level failure and the kernel's
//! operational error enums.

use serde::{Deserialize, Serialize};

/// Normalized, serializable failure observed by workflow code. Activity
/// errors, sub-workflow failures, and workflow terminal errors all travel
/// in this form: a stable kind, a message, an optional cause chain, and a
/// retryable flag consulted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkflowError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<Box<WorkflowError>>,
}

impl WorkflowError {
    pub const KIND_APPLICATION: &'static str = "application";
    pub const KIND_CANCELED: &'static str = "canceled";
    pub const KIND_PANIC: &'static str = "panic";
    pub const KIND_CONVERSION: &'static str = "conversion";
    pub const KIND_NON_DETERMINISM: &'static str = "non_determinism";

    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND_APPLICATION.into(),
            message: message.into(),
            retryable: true,
            cause: None,
        }
    }

    /// Application failure that retry policies must not retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::application(message)
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: Self::KIND_CANCELED.into(),
            message: "canceled".into(),
            retryable: false,
            cause: None,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND_PANIC.into(),
            message: message.into(),
            retryable: true,
            cause: None,
        }
    }

    pub fn conversion(err: impl std::fmt::Display) -> Self {
        Self {
            kind: Self::KIND_CONVERSION.into(),
            message: err.to_string(),
            retryable: false,
            cause: None,
        }
    }

    pub fn non_determinism(message: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND_NON_DETERMINISM.into(),
            message: message.into(),
            retryable: false,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: WorkflowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == Self::KIND_CANCELED
    }
}

impl From<&str> for WorkflowError {
    fn from(message: &str) -> Self {
        WorkflowError::application(message)
    }
}

impl From<String> for WorkflowError {
    fn from(message: String) -> Self {
        WorkflowError::application(message)
    }
}

/// Errors returned by backend implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("workflow instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),
    /// The target instance reached a terminal state. Surfaced explicitly so
    /// callers can distinguish a late signal from a bad instance id.
    #[error("workflow instance finished: {0}")]
    InstanceFinished(String),
    #[error("task lease lost: {0}")]
    LeaseLost(String),
    #[error("instance is not in a terminal state: {0}")]
    InstanceNotTerminal(String),
    #[error("backend error: {0}")]
    Internal(String),
}

/// Errors surfaced by the workflow executor to the worker loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// Replay produced commands that do not match committed history. The
    /// worker retries within its budget before failing the instance.
    #[error("non-determinism detected: {0}")]
    NonDeterminism(String),
    /// Gap in sequence ids or a response with no matching scheduling event.
    /// Fatal: the worker does not attempt to continue on corrupt history.
    #[error("corrupt history: {0}")]
    CorruptHistory(String),
}

/// Errors returned by the client surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("workflow canceled")]
    Canceled,
    #[error("workflow terminated")]
    Terminated,
    #[error("workflow did not finish within the timeout")]
    Timeout,
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("conversion failed: {0}")]
    Conversion(WorkflowError),
}
