//! Workflow and activity registries: name → handler maps built once at
//! worker wiring time.

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::payload::{Payload, from_payload, to_payload};
use crate::worker::activity::ActivityContext;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered workflow body. Implemented for you by the typed `register`
/// wrappers; implement directly to work at the payload level.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError>;
}

/// A registered activity body.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError>;
}

struct FnWorkflow<F>(F);

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

struct FnActivity<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, WorkflowError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, WorkflowError> {
        (self.0)(ctx, input).await
    }
}

/// Immutable name → workflow handler map.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn WorkflowHandler>>,
}

impl WorkflowRegistryBuilder {
    /// Register a typed workflow. Input and output are serialized through
    /// the backend's converter at the seam. Panics on a duplicate name:
    /// registration is wiring-time configuration.
    pub fn register<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let wrapper = move |ctx: WorkflowContext, input: Payload| {
            let f = f.clone();
            async move {
                let decoded: In = from_payload(ctx.converter.as_ref(), &input)?;
                let out = f(ctx.clone(), decoded).await?;
                to_payload(ctx.converter.as_ref(), &out)
            }
        };
        let name = name.into();
        if self.map.insert(name.clone(), Arc::new(FnWorkflow(wrapper))).is_some() {
            panic!("duplicate workflow registration: {name}");
        }
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }
}

/// Immutable name → activity handler map.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Register a typed activity. Panics on a duplicate name.
    pub fn register<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input: Payload| {
            let f = f.clone();
            async move {
                let decoded: In = from_payload(ctx.converter.as_ref(), &input)?;
                let out = f(ctx.clone(), decoded).await?;
                to_payload(ctx.converter.as_ref(), &out)
            }
        };
        let name = name.into();
        if self.map.insert(name.clone(), Arc::new(FnActivity(wrapper))).is_some() {
            panic!("duplicate activity registration: {name}");
        }
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
