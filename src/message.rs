use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use serde_json::Value;
use crate::errors::MessageError;

/// The field bag carried by a message.  Keys are field names declared in box
/// metadata (`requires` / `provides` / `emits`).
pub type MessageData = serde_json::Map<String, Value>;

pub type MessageId = u64;

/// Process-wide monotonic id source, shared by data messages and sentinels.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> MessageId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One unit of data flowing through the graph.
///
/// A message holds its own field map plus an optional reference to the parent
/// it was generated from.  Reads check the local map first and then delegate
/// up the parent chain; writes only ever touch the local map, so an ancestor
/// is never mutated by its descendants.  Every field is write-once: providing
/// a key that is already visible anywhere on the chain is a contract
/// violation.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    parent: Option<Arc<Message>>,
    fields: DashMap<String, Value>,
}

impl Message {
    /// A root message entering the graph, carrying the job's initial values.
    pub fn new_root(init: MessageData) -> Arc<Self> {
        let fields = DashMap::new();
        for (k, v) in init {
            fields.insert(k, v);
        }
        Arc::new(Self {
            id: next_id(),
            parent: None,
            fields,
        })
    }

    /// A fresh child layered over `self`.  Parent fields stay visible, writes
    /// land in the child only.
    pub fn create_child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            parent: Some(self.clone()),
            fields: DashMap::new(),
        })
    }

    /// The terminal marker closing one generator invocation on `self`.
    pub fn create_sentinel(
        self: &Arc<Self>,
        generated: usize,
        result: Result<Value, String>,
    ) -> Arc<Sentinel> {
        Arc::new(Sentinel {
            id: next_id(),
            parent: self.clone(),
            generated,
            result,
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Message>> {
        self.parent.as_ref()
    }

    pub fn parent_id(&self) -> Option<MessageId> {
        self.parent.as_ref().map(|p| p.id)
    }

    /// Layered lookup: local map first, then up the parent chain.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.fields.get(key) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(key))
    }

    fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key) || self.parent.as_ref().is_some_and(|p| p.contains(key))
    }

    /// Project the `requires` fields into an input value for a box routine.
    /// Absent fields project to `Null`, mirroring the loose input contract.
    pub fn get_input(&self, requires: &[String]) -> MessageData {
        let mut input = MessageData::new();
        for r in requires {
            input.insert(r.clone(), self.get(r).unwrap_or(Value::Null));
        }
        input
    }

    /// Write exactly the `provides` fields from `output` onto this message.
    /// Keys missing from `output` are stored as `Null`; keys already present
    /// anywhere on the chain fail the whole write without touching anything.
    pub fn set_output(&self, provides: &[String], mut output: MessageData) -> Result<(), MessageError> {
        let conflicts: Vec<String> = provides
            .iter()
            .filter(|p| self.contains(p))
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Err(MessageError::AlreadyProvided { keys: conflicts });
        }
        for p in provides {
            let value = output.remove(p).unwrap_or(Value::Null);
            self.fields.insert(p.clone(), value);
        }
        Ok(())
    }

    /// Flatten the whole chain into one field bag, nearest writer winning.
    /// This is what a drain consumer observes.
    pub fn export(&self) -> MessageData {
        let mut out = match &self.parent {
            Some(p) => p.export(),
            None => MessageData::new(),
        };
        for entry in self.fields.iter() {
            out.insert(entry.key().clone(), entry.value().clone());
        }
        out
    }
}

/// Terminal marker tied to exactly one parent message.  It carries the
/// generator routine's settled result instead of field data and is never
/// field-addressable.
#[derive(Debug)]
pub struct Sentinel {
    id: MessageId,
    parent: Arc<Message>,
    generated: usize,
    result: Result<Value, String>,
}

impl Sentinel {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn parent(&self) -> &Arc<Message> {
        &self.parent
    }

    /// How many children the settled invocation emitted.
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// The routine's return value, or the error it settled with.
    pub fn result(&self) -> &Result<Value, String> {
        &self.result
    }
}

/// What actually travels on queue edges.  Cloning is cheap (Arc inside), so
/// Tee can duplicate a push without copying field data.
#[derive(Debug, Clone)]
pub enum FlowMessage {
    Data(Arc<Message>),
    Sentinel(Arc<Sentinel>),
}

impl FlowMessage {
    pub fn id(&self) -> MessageId {
        match self {
            FlowMessage::Data(m) => m.id(),
            FlowMessage::Sentinel(s) => s.id(),
        }
    }
}
