//! The flow itself: a compiled DAG of boxes accepting jobs.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{error, info};
use uuid::Uuid;

use crate::message::{FlowMessage, Message, MessageData, MessageId};
use crate::queue::MessageSink;

pub mod builder;
pub mod schema;
pub mod trace;

pub use self::builder::FlowBuilder;
pub use self::schema::{FlowSchema, load_schema, parse_schema};

use self::trace::{DimensionTree, TracingModel};

/// Artificial node standing for the flow's entry.  It owns the root
/// dimension, so every root message is accounted for the moment it is
/// submitted.
pub const ROOT_NODE: &str = "_root_";

/// A compiled flow.  Submitting a message returns a [`JobHandle`] that
/// resolves once the message and everything generated from it has drained.
pub struct Flow {
    entry: Arc<dyn MessageSink>,
    model: Arc<Mutex<TracingModel>>,
    waiters: Arc<DashMap<MessageId, oneshot::Sender<MessageId>>>,
    tree: Arc<DimensionTree>,
}

/// One submitted job.  Dropping the handle does not cancel anything, the
/// flow keeps draining; it only forfeits the completion signal.
pub struct JobHandle {
    job_id: Uuid,
    root_id: MessageId,
    rx: oneshot::Receiver<MessageId>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Id of the root message this job tracks.
    pub fn message_id(&self) -> MessageId {
        self.root_id
    }

    /// Resolves when the whole job has drained.
    pub async fn finished(self) {
        let _ = self.rx.await;
    }
}

impl Flow {
    pub(crate) fn new(
        entry: Arc<dyn MessageSink>,
        model: Arc<Mutex<TracingModel>>,
        waiters: Arc<DashMap<MessageId, oneshot::Sender<MessageId>>>,
        tree: Arc<DimensionTree>,
    ) -> Self {
        Self {
            entry,
            model,
            waiters,
            tree,
        }
    }

    pub fn dimension_tree(&self) -> &DimensionTree {
        &self.tree
    }

    /// Submits one root message built from `initial` and returns the handle
    /// tracking its completion.  The message is registered with the tracing
    /// model before it enters the first queue, so no completion event can
    /// outrun the registration.
    pub fn submit(&self, initial: MessageData) -> JobHandle {
        let job_id = Uuid::new_v4();
        let root = Message::new_root(initial);
        let root_id = root.id();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(root_id, tx);
        if let Ok(mut model) = self.model.lock() {
            model.add_msg(root_id, None, ROOT_NODE);
        }
        info!(job = %job_id, message = root_id, "job submitted");
        if let Err(err) = self.entry.push(FlowMessage::Data(root), None) {
            error!(job = %job_id, error = %err, "root message rejected");
        }
        JobHandle {
            job_id,
            root_id,
            rx,
        }
    }
}
