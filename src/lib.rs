//! Embeddable durable workflow engine with deterministic replay.
//!
//! Workflows are ordinary async Rust functions. Every operation with an
//! effect outside the workflow — activities, timers, signals to other
//! instances, sub-workflows, recorded side effects — goes through the
//! [`WorkflowContext`] and is captured as a command. Committed commands
//! become append-only history events; after a crash or redeployment the
//! engine replays that history to reconstruct in-memory state and resumes
//! exactly where the recorded run suspended.
//!
//! The crate provides:
//!
//! - The deterministic workflow executor and its command/event protocol
//! - A pluggable [`Backend`] contract for storage and task queues, with an
//!   in-memory reference implementation
//! - Workflow and activity worker loops with leases, heartbeats, and
//!   backpressure
//! - A [`Client`] for starting, signaling, canceling, and reading results
//!
//! ```no_run
//! use spindle::{ActivityContext, ActivityRegistry, Client, Worker, WorkflowContext, WorkflowError, WorkflowRegistry};
//! use spindle::backend::memory::MemoryBackend;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move {
//!         Ok::<_, WorkflowError>(format!("Hello, {name}!"))
//!     })
//!     .build();
//!
//! let workflows = WorkflowRegistry::builder()
//!     .register("HelloWorld", |ctx: WorkflowContext, name: String| async move {
//!         ctx.schedule_activity::<_, String>("Greet", &name).await
//!     })
//!     .build();
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let worker = Worker::new(backend.clone(), workflows, activities).start();
//!
//! let client = Client::new(backend);
//! let instance = client.create_workflow_instance("hello-1", "HelloWorld", &"World").await?;
//! let greeting: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await?;
//! assert_eq!(greeting, "Hello, World!");
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod command;
pub mod context;
pub mod core;
pub mod error;
pub mod executor;
pub mod futures;
pub mod history;
pub mod payload;
pub mod registry;
pub mod retry;
pub mod worker;

pub use backend::{ActivityTask, Backend, WorkflowTask, WorkflowTaskResult};
pub use client::Client;
pub use command::{Command, CommandKind, CommandState};
pub use context::{SubWorkflowOptions, WorkflowContext};
pub use core::{InstanceState, ParentRef, WorkflowInstance, WorkflowState};
pub use error::{BackendError, ClientError, ExecutorError, WorkflowError};
pub use executor::WorkflowExecutor;
pub use futures::{ActivityFuture, CommandFuture, SignalFuture, SubWorkflowFuture, TimerFuture};
pub use history::{Event, EventAttributes, EventType};
pub use payload::{ContextPropagator, Converter, JsonConverter, Metadata, Payload};
pub use registry::{ActivityHandler, ActivityRegistry, WorkflowHandler, WorkflowRegistry};
pub use retry::RetryPolicy;
pub use worker::activity::ActivityContext;
pub use worker::{Worker, WorkerHandle, WorkerOptions};
