use std::sync::Arc;
use crate::errors::QueueError;
use crate::message::{FlowMessage, MessageData};

pub mod joined;
pub mod memory;

pub use joined::{Tee, ZipJoin};
pub use memory::{BatchWorker, MemoryBatchQueue, MemorySingleQueue, QueueWorker};

/// Priority attached to a push when the producer does not care.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Anything a box can push its output into: a worker queue, a Tee, a ZipJoin
/// face, the drain, or nothing at all.
///
/// `push` is non-blocking for the caller.  A higher priority is drained
/// sooner; the value is a soft scheduling hint, never a correctness
/// mechanism.
pub trait MessageSink: Send + Sync {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError>;

    /// Label used in logs and fan-out error reports.
    fn target(&self) -> &str;
}

/// Terminates a graph branch that has no declared consumer.
pub struct NoopQueue;

impl MessageSink for NoopQueue {
    fn push(&self, _msg: FlowMessage, _priority: Option<u32>) -> Result<(), QueueError> {
        Ok(())
    }

    fn target(&self) -> &str {
        "noop"
    }
}

/// Adapts a caller-supplied callback into the drain sink.  Terminal boxes
/// without a declared consumer push here; the callback observes completed
/// field bags, not raw internal messages.  Sentinels are bookkeeping and are
/// not exported.
pub struct CallbackDrain {
    callback: Box<dyn Fn(MessageData) + Send + Sync>,
}

impl CallbackDrain {
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn(MessageData) + Send + Sync + 'static,
    {
        Arc::new(Self {
            callback: Box::new(callback),
        })
    }
}

impl MessageSink for CallbackDrain {
    fn push(&self, msg: FlowMessage, _priority: Option<u32>) -> Result<(), QueueError> {
        if let FlowMessage::Data(m) = msg {
            (self.callback)(m.export());
        }
        Ok(())
    }

    fn target(&self) -> &str {
        "drain"
    }
}

/// Drain that records the generation results carried by sentinels as well.
/// Mostly useful for tooling; the CLI uses it to report failed generators.
pub struct InspectingDrain {
    on_data: Box<dyn Fn(MessageData) + Send + Sync>,
    on_generation_error: Box<dyn Fn(String) + Send + Sync>,
}

impl InspectingDrain {
    pub fn new<D, E>(on_data: D, on_generation_error: E) -> Arc<Self>
    where
        D: Fn(MessageData) + Send + Sync + 'static,
        E: Fn(String) + Send + Sync + 'static,
    {
        Arc::new(Self {
            on_data: Box::new(on_data),
            on_generation_error: Box::new(on_generation_error),
        })
    }
}

impl MessageSink for InspectingDrain {
    fn push(&self, msg: FlowMessage, _priority: Option<u32>) -> Result<(), QueueError> {
        match msg {
            FlowMessage::Data(m) => (self.on_data)(m.export()),
            FlowMessage::Sentinel(s) => {
                if let Err(reason) = s.result() {
                    (self.on_generation_error)(reason.clone());
                }
            }
        }
        Ok(())
    }

    fn target(&self) -> &str {
        "drain"
    }
}
