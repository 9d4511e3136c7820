use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};
use crate::boxes::{BoxKind, BoxMeta, BoxProcessor};
use crate::errors::BoxError;
use crate::flow::trace::FlowTracer;
use crate::message::{FlowMessage, Message, MessageData, Sentinel};
use crate::queue::{BatchWorker, MessageSink, QueueWorker};
use crate::services::ServiceProvider;

struct GeneratorSink {
    parent: Arc<Message>,
    emits: Vec<String>,
    output: Arc<dyn MessageSink>,
    tracer: Arc<dyn FlowTracer>,
    emitted: AtomicUsize,
}

struct EmitterInner {
    box_name: String,
    /// `None` for mappers: any emit attempt is an inconsistency.
    sink: Option<GeneratorSink>,
    /// Flipped the instant the generator routine settles.  A clone of the
    /// emitter held by a dangling task then hits a revoked token instead of
    /// a live queue.
    active: AtomicBool,
}

/// Emit handle passed into every box routine.
///
/// For a generator, each `emit` call turns a chunk of raw field bags into
/// fresh child messages (layered over the input message, carrying the
/// `emits` fields) and pushes them downstream immediately, so downstream
/// work starts before the routine returns.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
}

impl Emitter {
    /// Emitter for boxes that must never emit.
    pub(crate) fn inert(box_name: &str) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                box_name: box_name.to_string(),
                sink: None,
                active: AtomicBool::new(false),
            }),
        }
    }

    fn generator(
        box_name: &str,
        parent: Arc<Message>,
        emits: Vec<String>,
        output: Arc<dyn MessageSink>,
        tracer: Arc<dyn FlowTracer>,
    ) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                box_name: box_name.to_string(),
                sink: Some(GeneratorSink {
                    parent,
                    emits,
                    output,
                    tracer,
                    emitted: AtomicUsize::new(0),
                }),
                active: AtomicBool::new(true),
            }),
        }
    }

    fn revoke(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    fn emitted(&self) -> usize {
        match &self.inner.sink {
            Some(sink) => sink.emitted.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Emit one chunk of children.  Fails with
    /// [`BoxError::GeneratorMisbehaved`] once the routine has settled and
    /// with [`BoxError::InconsistentBox`] when the box is not a generator.
    pub fn emit(&self, chunk: Vec<MessageData>, priority: Option<u32>) -> Result<(), BoxError> {
        let sink = self
            .inner
            .sink
            .as_ref()
            .ok_or_else(|| BoxError::InconsistentBox {
                box_name: self.inner.box_name.clone(),
            })?;
        if !self.inner.active.load(Ordering::SeqCst) {
            warn!(box_name = %self.inner.box_name, "emit after the generator routine settled");
            return Err(BoxError::GeneratorMisbehaved {
                box_name: self.inner.box_name.clone(),
            });
        }
        for data in chunk {
            let child = sink.parent.create_child();
            child
                .set_output(&sink.emits, data)
                .map_err(|err| BoxError::Invocation {
                    box_name: self.inner.box_name.clone(),
                    mode: "generator",
                    input: format!("emitted chunk for message {}", sink.parent.id()),
                    source: err.into(),
                })?;
            sink.output
                .push(FlowMessage::Data(child.clone()), priority)
                .map_err(|err| BoxError::Invocation {
                    box_name: self.inner.box_name.clone(),
                    mode: "generator",
                    input: format!("emitted chunk for message {}", sink.parent.id()),
                    source: err.into(),
                })?;
            sink.emitted.fetch_add(1, Ordering::SeqCst);
            sink.tracer
                .message_passed(&self.inner.box_name, child.id(), Some(sink.parent.id()));
        }
        Ok(())
    }
}

/// Engine-side wrapper around a user processor.
///
/// Owns the box's outbound sink, dispatches on the box kind, projects the
/// `requires` fields, enforces the emission rules and contains every failure
/// to the one message that caused it.
pub struct BoxRuntime {
    name: String,
    meta: BoxMeta,
    kind: BoxKind,
    services: Arc<ServiceProvider>,
    processor: Arc<dyn BoxProcessor>,
    output: Arc<dyn MessageSink>,
    tracer: Arc<dyn FlowTracer>,
}

impl BoxRuntime {
    pub fn new(
        name: &str,
        meta: BoxMeta,
        services: Arc<ServiceProvider>,
        processor: Arc<dyn BoxProcessor>,
        output: Arc<dyn MessageSink>,
        tracer: Arc<dyn FlowTracer>,
    ) -> Arc<Self> {
        let kind = meta.kind();
        Arc::new(Self {
            name: name.to_string(),
            meta,
            kind,
            services,
            processor,
            output,
            tracer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &BoxMeta {
        &self.meta
    }

    /// Entry point for the box's inbound queue.  Failures are logged and
    /// swallowed here: one bad message must not take down the queue or the
    /// messages in flight next to it.
    pub async fn process(&self, msg: FlowMessage) {
        let result = match msg {
            FlowMessage::Sentinel(sentinel) => self.forward_sentinel(sentinel),
            FlowMessage::Data(message) => match self.kind {
                BoxKind::Mapper => self.process_mapper(message).await,
                BoxKind::Generator => self.process_generator(message).await,
                BoxKind::Aggregator => Err(BoxError::NotImplemented {
                    box_name: self.name.clone(),
                }),
            },
        };
        if let Err(err) = result {
            error!(box_name = %self.name, error = %err, "box failed, message dropped");
        }
    }

    /// Sentinels are not processed, they pass through unchanged.  The pass
    /// itself is reported: it is how a dimension learns, from any of its
    /// boxes, that no more children will be generated.
    fn forward_sentinel(&self, sentinel: Arc<Sentinel>) -> Result<(), BoxError> {
        let parent_id = sentinel.parent().id();
        self.output
            .push(FlowMessage::Sentinel(sentinel), None)
            .map_err(|err| self.invocation_error("sentinel", err.into()))?;
        self.tracer.sentinel_passed(&self.name, parent_id);
        Ok(())
    }

    async fn process_mapper(&self, message: Arc<Message>) -> Result<(), BoxError> {
        let input = message.get_input(&self.meta.requires);
        let snapshot = Value::Object(input.clone()).to_string();
        let result = self
            .processor
            .process(&self.services, input, Emitter::inert(&self.name))
            .await
            .map_err(|err| self.wrap_invocation("mapper", &snapshot, err))?;
        let output = match result {
            Value::Object(map) => map,
            other => {
                return Err(self.wrap_invocation(
                    "mapper",
                    &snapshot,
                    anyhow::anyhow!("mapper must return an object, got {other}"),
                ));
            }
        };
        message
            .set_output(&self.meta.provides, output)
            .map_err(|err| self.wrap_invocation("mapper", &snapshot, err.into()))?;
        self.output
            .push(FlowMessage::Data(message.clone()), None)
            .map_err(|err| self.wrap_invocation("mapper", &snapshot, err.into()))?;
        self.tracer
            .message_passed(&self.name, message.id(), message.parent_id());
        Ok(())
    }

    async fn process_generator(&self, message: Arc<Message>) -> Result<(), BoxError> {
        let input = message.get_input(&self.meta.requires);
        let emitter = Emitter::generator(
            &self.name,
            message.clone(),
            self.meta.emits.clone(),
            self.output.clone(),
            self.tracer.clone(),
        );
        let settled = self
            .processor
            .process(&self.services, input.clone(), emitter.clone())
            .await;
        // From here on any emit from a dangling callback is a contract
        // violation, not a queue push.
        emitter.revoke();
        let generated = emitter.emitted();

        let result = match settled {
            Ok(value) => Ok(value),
            Err(err) => {
                let snapshot = Value::Object(input).to_string();
                let wrapped = self.wrap_invocation("generator", &snapshot, err);
                error!(box_name = %self.name, error = %wrapped, "generator routine failed");
                Err(wrapped.to_string())
            }
        };

        // Exactly one sentinel per settled invocation, success or not, so
        // the dimension always closes.
        let sentinel = message.create_sentinel(generated, result);
        self.output
            .push(FlowMessage::Sentinel(sentinel), None)
            .map_err(|err| self.invocation_error("generator", err.into()))?;
        self.tracer
            .generation_finished(&self.name, message.id(), generated);
        self.tracer.sentinel_passed(&self.name, message.id());
        debug!(box_name = %self.name, parent = message.id(), generated, "generation finished");
        Ok(())
    }

    /// Entry point for a batching box's inbound queue.
    pub async fn process_batch(&self, batch: Vec<FlowMessage>) {
        let mut data: Vec<Arc<Message>> = Vec::with_capacity(batch.len());
        for msg in batch {
            match msg {
                FlowMessage::Sentinel(sentinel) => {
                    if let Err(err) = self.forward_sentinel(sentinel) {
                        error!(box_name = %self.name, error = %err, "sentinel forward failed");
                    }
                }
                FlowMessage::Data(message) => data.push(message),
            }
        }
        if data.is_empty() {
            return;
        }
        if let Err(err) = self.process_mapper_batch(data).await {
            error!(box_name = %self.name, error = %err, "box failed, batch dropped");
        }
    }

    async fn process_mapper_batch(&self, batch: Vec<Arc<Message>>) -> Result<(), BoxError> {
        if self.kind != BoxKind::Mapper {
            // build rejects batching generators; aggregators land here
            return Err(BoxError::NotImplemented {
                box_name: self.name.clone(),
            });
        }
        let snapshot = format!("batch of {}", batch.len());
        let inputs: Vec<MessageData> = batch
            .iter()
            .map(|m| m.get_input(&self.meta.requires))
            .collect();
        let outputs = self
            .processor
            .process_batch(&self.services, inputs)
            .await
            .map_err(|err| self.wrap_invocation("mapper", &snapshot, err))?;
        if outputs.len() != batch.len() {
            return Err(self.wrap_invocation(
                "mapper",
                &snapshot,
                anyhow::anyhow!(
                    "batch mapper returned {} outputs for {} inputs",
                    outputs.len(),
                    batch.len()
                ),
            ));
        }
        for (message, output) in batch.iter().zip(outputs) {
            message
                .set_output(&self.meta.provides, output)
                .map_err(|err| self.wrap_invocation("mapper", &snapshot, err.into()))?;
            self.output
                .push(FlowMessage::Data(message.clone()), None)
                .map_err(|err| self.wrap_invocation("mapper", &snapshot, err.into()))?;
            self.tracer
                .message_passed(&self.name, message.id(), message.parent_id());
        }
        Ok(())
    }

    fn wrap_invocation(&self, mode: &'static str, input: &str, source: anyhow::Error) -> BoxError {
        BoxError::Invocation {
            box_name: self.name.clone(),
            mode,
            input: input.to_string(),
            source,
        }
    }

    fn invocation_error(&self, mode: &'static str, source: anyhow::Error) -> BoxError {
        BoxError::Invocation {
            box_name: self.name.clone(),
            mode,
            input: String::new(),
            source,
        }
    }
}

#[async_trait]
impl QueueWorker for BoxRuntime {
    async fn run(&self, msg: FlowMessage) {
        self.process(msg).await;
    }
}

#[async_trait]
impl BatchWorker for BoxRuntime {
    async fn run(&self, batch: Vec<FlowMessage>) {
        self.process_batch(batch).await;
    }
}
