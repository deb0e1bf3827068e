//! Payloads, the converter contract, and context propagation metadata.

use crate::error::WorkflowError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque serialized value carried through history events and task inputs.
/// The default converter stores JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload(pub String);

impl Payload {
    pub fn empty() -> Self {
        Payload(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Payload codec supplied by the backend. Must be stable across versions for
/// the lifetime of a workflow: replays decode payloads recorded by earlier
/// runs.
///
/// The object-safe surface works on `serde_json::Value`; the typed helpers
/// below bridge to concrete types.
pub trait Converter: Send + Sync {
    fn encode(&self, value: serde_json::Value) -> Result<Payload, WorkflowError>;
    fn decode(&self, payload: &Payload) -> Result<serde_json::Value, WorkflowError>;
}

/// Encode any serializable value through a converter.
pub fn to_payload<T: Serialize>(converter: &dyn Converter, value: &T) -> Result<Payload, WorkflowError> {
    let v = serde_json::to_value(value).map_err(WorkflowError::conversion)?;
    converter.encode(v)
}

/// Decode a payload into a concrete type through a converter.
pub fn from_payload<T: DeserializeOwned>(converter: &dyn Converter, payload: &Payload) -> Result<T, WorkflowError> {
    let v = converter.decode(payload)?;
    serde_json::from_value(v).map_err(WorkflowError::conversion)
}

/// Default JSON converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn encode(&self, value: serde_json::Value) -> Result<Payload, WorkflowError> {
        serde_json::to_string(&value)
            .map(Payload)
            .map_err(WorkflowError::conversion)
    }

    fn decode(&self, payload: &Payload) -> Result<serde_json::Value, WorkflowError> {
        if payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&payload.0).map_err(WorkflowError::conversion)
    }
}

/// String-keyed metadata attached to workflow starts and activity tasks.
/// Sorted map so serialized form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metadata(pub BTreeMap<String, String>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

/// Injects ambient context (trace ids, tenant tags) into metadata on the way
/// into the backend and extracts it on the way out to user code.
pub trait ContextPropagator: Send + Sync {
    fn inject(&self, metadata: &mut Metadata);
    fn extract(&self, metadata: &Metadata);
}

pub type Propagators = Vec<Arc<dyn ContextPropagator>>;
