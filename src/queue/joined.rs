use std::sync::Arc;
use dashmap::DashMap;
use crate::errors::QueueError;
use crate::message::{FlowMessage, MessageId};
use crate::queue::MessageSink;

/// Fan-out: one push is duplicated to every downstream queue, synchronously
/// and in order.  Fan-out is best effort, not transactional: a failing queue
/// does not stop the attempt on the remaining ones, the first failure is
/// re-raised wrapped once all queues have been tried.
pub struct Tee {
    outputs: Vec<Arc<dyn MessageSink>>,
}

impl Tee {
    pub fn new(outputs: Vec<Arc<dyn MessageSink>>) -> Result<Arc<Self>, QueueError> {
        if outputs.is_empty() {
            return Err(QueueError::Rejected {
                queue: "tee".into(),
                reason: "cannot tee into zero queues".into(),
            });
        }
        Ok(Arc::new(Self { outputs }))
    }
}

impl MessageSink for Tee {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError> {
        let mut first_failure = None;
        for output in &self.outputs {
            if let Err(err) = output.push(msg.clone(), priority)
                && first_failure.is_none()
            {
                first_failure = Some(err);
            }
        }
        match first_failure {
            Some(err) => Err(QueueError::FanOut {
                source: Box::new(err),
            }),
            None => Ok(()),
        }
    }

    fn target(&self) -> &str {
        "tee"
    }
}

struct JoinState {
    arrived: Vec<bool>,
    max_priority: Option<u32>,
}

struct ZipInner {
    width: usize,
    output: Arc<dyn MessageSink>,
    /// Per message id: which faces it has arrived on so far, and the folded
    /// priority.  The entry is dropped the moment the message is released.
    pending: DashMap<MessageId, JoinState>,
}

/// Fan-in synchronization point of a fixed width n >= 2.
///
/// Exposes n queue-like input faces.  A message pushed into a face is held
/// until the *same* message (by id) has arrived through every face, then it
/// is pushed downstream exactly once, carrying the maximum priority observed
/// across the faces (absent priorities are ignored).  Correctness depends
/// only on message identity; arrival order across faces is explicitly
/// unordered.
pub struct ZipJoin {
    inner: Arc<ZipInner>,
}

impl ZipJoin {
    pub fn new(output: Arc<dyn MessageSink>, width: usize) -> Result<Self, QueueError> {
        if width < 2 {
            return Err(QueueError::Rejected {
                queue: "zip".into(),
                reason: "not going to join fewer than 2 inputs".into(),
            });
        }
        Ok(Self {
            inner: Arc::new(ZipInner {
                width,
                output,
                pending: DashMap::new(),
            }),
        })
    }

    /// The n input faces, in face order.  Each face is an independent sink
    /// handed to one upstream producer.
    pub fn faces(&self) -> Vec<Arc<dyn MessageSink>> {
        (0..self.inner.width)
            .map(|index| {
                Arc::new(ZipFace {
                    index,
                    inner: self.inner.clone(),
                }) as Arc<dyn MessageSink>
            })
            .collect()
    }
}

struct ZipFace {
    index: usize,
    inner: Arc<ZipInner>,
}

impl MessageSink for ZipFace {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError> {
        let released = {
            let mut state = self
                .inner
                .pending
                .entry(msg.id())
                .or_insert_with(|| JoinState {
                    arrived: vec![false; self.inner.width],
                    max_priority: None,
                });
            state.arrived[self.index] = true;
            if let Some(p) = priority {
                state.max_priority = Some(state.max_priority.map_or(p, |m| m.max(p)));
            }
            if state.arrived.iter().all(|&flag| flag) {
                Some(state.max_priority)
            } else {
                None
            }
        };
        // entry guard released above; only now may we touch the map again
        // and push downstream
        if let Some(max_priority) = released {
            self.inner.pending.remove(&msg.id());
            self.inner.output.push(msg, max_priority)?;
        }
        Ok(())
    }

    fn target(&self) -> &str {
        "zip"
    }
}
