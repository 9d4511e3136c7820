use std::collections::HashMap;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::errors::{BoxError, BuildError};
use crate::message::MessageData;
use crate::services::ServiceProvider;

pub mod builtin;
pub mod runtime;

pub use runtime::{BoxRuntime, Emitter};

/// Default window for batching boxes that declare a size but no timeout.
pub const DEFAULT_BATCH_TIMEOUT_SECS: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSettings {
    pub max_size: usize,
    pub timeout_seconds: Option<f64>,
}

/// Public contract of a box: which fields it reads, which it writes back,
/// which it attaches to generated children, and how it wants to be scheduled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoxMeta {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    /// Non-empty `emits` is what makes a box a generator; the listed fields
    /// are attached to every child and name the dimension the box opens.
    #[serde(default)]
    pub emits: Vec<String>,
    #[serde(default)]
    pub aggregates: bool,
    #[serde(default)]
    pub batch: Option<BatchSettings>,
    /// Max in-flight messages in the box's inbound queue, default 1.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Mapper,
    Generator,
    Aggregator,
}

impl BoxKind {
    pub fn mode(&self) -> &'static str {
        match self {
            BoxKind::Mapper => "mapper",
            BoxKind::Generator => "generator",
            BoxKind::Aggregator => "aggregator",
        }
    }
}

impl BoxMeta {
    /// The three kinds are mutually exclusive; [`BoxMeta::check`] enforces it
    /// at build time, so classification here can stay simple.
    pub fn kind(&self) -> BoxKind {
        if self.aggregates {
            BoxKind::Aggregator
        } else if !self.emits.is_empty() {
            BoxKind::Generator
        } else {
            BoxKind::Mapper
        }
    }

    pub fn check(&self, box_name: &str) -> Result<(), BuildError> {
        if self.aggregates && !self.emits.is_empty() {
            return Err(BuildError::InvalidMeta {
                box_name: box_name.to_string(),
                reason: "a box cannot both aggregate and emit".into(),
            });
        }
        if self.batch.is_some() && !self.emits.is_empty() {
            return Err(BuildError::InvalidMeta {
                box_name: box_name.to_string(),
                reason: "a batching box cannot be a generator".into(),
            });
        }
        Ok(())
    }
}

/// The user-supplied routine of a box.
///
/// A mapper returns an object holding its `provides` fields and must never
/// call `emit`.  A generator emits child field bags through `emit` (possibly
/// suspending between chunks) and its return value is carried by the closing
/// sentinel.  Batching mappers implement `process_batch` instead, returning
/// one output per input in the same order.
#[async_trait]
pub trait BoxProcessor: Send + Sync {
    async fn process(
        &self,
        services: &ServiceProvider,
        input: MessageData,
        emit: Emitter,
    ) -> Result<Value>;

    async fn process_batch(
        &self,
        _services: &ServiceProvider,
        _batch: Vec<MessageData>,
    ) -> Result<Vec<MessageData>> {
        Err(BoxError::BatchUnsupported {
            box_name: "?".into(),
        }
        .into())
    }
}

/// Factory/definition of a box kind: metadata, parameter validation and
/// instantiation.  Registered by name in a [`BoxRegistry`].
pub trait BoxDefinition: Send + Sync {
    fn name(&self) -> &str;
    fn meta(&self) -> BoxMeta;
    /// Reject run-time parameters the box cannot work with.  Called before
    /// `prepare`, a failure here is fatal at build time.
    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }
    fn prepare(&self, params: Value) -> Result<Arc<dyn BoxProcessor>>;
}

/// Name -> definition lookup used by the DAG builder.
#[derive(Default)]
pub struct BoxRegistry {
    definitions: HashMap<String, Arc<dyn BoxDefinition>>,
}

impl BoxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: Arc<dyn BoxDefinition>) {
        self.definitions
            .insert(definition.name().to_string(), definition);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn BoxDefinition>, BuildError> {
        self.definitions
            .get(name)
            .ok_or_else(|| BuildError::UnknownBox(name.to_string()))
    }

    /// Registry preloaded with the builtin boxes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }
}
