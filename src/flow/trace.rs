//! Completion tracing for submitted jobs.
//!
//! The boxes of a flow form a DAG; generators multiply one message into many
//! children that populate a new *dimension* of work.  Dimensions order
//! themselves into a tree rooted at the empty dimension.  A message is done
//! on its dimension iff it has passed every box of that dimension and every
//! sub-dimension it spawned is itself complete (all children generated, via
//! the sentinel) and done (all children done, recursively).  When the root
//! message of a job becomes done, the job-done callback fires exactly once.
//!
//! Events may arrive in any order across branches; the only ordering that
//! can be relied on is that a generator reports its children before its
//! sentinel.  Every new piece of information therefore triggers a fresh
//! completion check, and finished records are deleted eagerly so a scope is
//! "all done" exactly when it is empty.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};
use crate::message::MessageId;

/// An ordered sequence of generator levels accumulated along a path from the
/// root.  Each level is one generator's `emits` list.  The root dimension is
/// the empty sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Dimension(Vec<Vec<String>>);

impl Dimension {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// This dimension with one more generator level appended.
    pub fn extended(&self, emits: &[String]) -> Self {
        let mut levels = self.0.clone();
        levels.push(emits.to_vec());
        Self(levels)
    }

    /// The dimension one level up, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "[]");
        }
        let levels: Vec<String> = self.0.iter().map(|level| level.join("+")).collect();
        write!(f, "[{}]", levels.join("/"))
    }
}

/// Immutable outcome of the builder's dimension analysis: which dimension
/// each box sits in, which boxes populate each dimension, and how dimensions
/// nest.
#[derive(Debug, Default)]
pub struct DimensionTree {
    box_dimension: HashMap<String, Dimension>,
    members: HashMap<Dimension, BTreeSet<String>>,
    children: HashMap<Dimension, Vec<Dimension>>,
}

impl DimensionTree {
    pub fn new(box_dimension: HashMap<String, Dimension>) -> Self {
        let mut members: HashMap<Dimension, BTreeSet<String>> = HashMap::new();
        for (box_name, dim) in &box_dimension {
            members.entry(dim.clone()).or_default().insert(box_name.clone());
        }
        let mut children: HashMap<Dimension, Vec<Dimension>> = HashMap::new();
        for dim in members.keys() {
            if let Some(parent) = dim.parent() {
                let siblings = children.entry(parent).or_default();
                if !siblings.contains(dim) {
                    siblings.push(dim.clone());
                }
            }
        }
        Self {
            box_dimension,
            members,
            children,
        }
    }

    pub fn dimension_of(&self, box_name: &str) -> Option<&Dimension> {
        self.box_dimension.get(box_name)
    }

    pub fn boxes_of(&self, dim: &Dimension) -> Option<&BTreeSet<String>> {
        self.members.get(dim)
    }

    pub fn subdimensions(&self, dim: &Dimension) -> &[Dimension] {
        self.children.get(dim).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Observer of box-level events, injected into every
/// [`BoxRuntime`](crate::boxes::BoxRuntime) at build time.  One
/// implementation per flow instance; no global emitter anywhere.
pub trait FlowTracer: Send + Sync {
    /// `box_name` pushed message `msg_id` (child of `parent`) onward.
    fn message_passed(&self, box_name: &str, msg_id: MessageId, parent: Option<MessageId>);

    /// `box_name` pushed a sentinel whose parent is `parent_msg_id` onward:
    /// no further children of that parent will be generated in `box_name`'s
    /// dimension.  Duplicate reports from sibling boxes are expected.
    fn sentinel_passed(&self, box_name: &str, parent_msg_id: MessageId);

    /// A generator invocation on `parent_msg_id` settled after emitting
    /// `generated` children.
    fn generation_finished(&self, box_name: &str, parent_msg_id: MessageId, generated: usize);
}

/// Tracer that discards everything.  Used when a box runtime is exercised
/// outside a flow.
pub struct NoopTracer;

impl FlowTracer for NoopTracer {
    fn message_passed(&self, _: &str, _: MessageId, _: Option<MessageId>) {}
    fn sentinel_passed(&self, _: &str, _: MessageId) {}
    fn generation_finished(&self, _: &str, _: MessageId, _: usize) {}
}

/// Scope key: the parent message a record hangs under, `None` being the
/// artificial parent of root messages.
type ParentKey = Option<MessageId>;

/// Which boxes of its dimension has this message already passed?
struct MsgTrace {
    boxes: HashMap<String, bool>,
}

/// State of one sub-dimension under one parent message.
struct DimTrace {
    /// All children have been generated (sentinel seen).
    complete: bool,
    /// All children are done.  Kept for parity with the completion
    /// definition; a done dimension is deleted right away.
    done: bool,
    /// Parent of my own parent message, needed to resume the completion
    /// check one level up.
    super_parent: ParentKey,
}

/// The nested completion bookkeeping: message records grouped as
/// `parent -> dimension -> message`, dimension records as
/// `parent message -> dimension`.  Done records are deleted eagerly, so
/// "every message done" reads as "scope empty".
///
/// All mutation goes through one `Mutex` (see [`ModelTracer`]); two
/// completion checks racing on the same scope is the principal correctness
/// hazard of this model.
pub struct TracingModel {
    tree: Arc<DimensionTree>,
    msg_store: HashMap<ParentKey, HashMap<Dimension, HashMap<MessageId, MsgTrace>>>,
    dim_store: HashMap<ParentKey, HashMap<Dimension, DimTrace>>,
    job_done: Box<dyn Fn(MessageId) + Send>,
}

impl TracingModel {
    pub fn new<F>(tree: Arc<DimensionTree>, job_done: F) -> Self
    where
        F: Fn(MessageId) + Send + 'static,
    {
        let mut msg_store: HashMap<ParentKey, HashMap<Dimension, HashMap<MessageId, MsgTrace>>> =
            HashMap::new();
        msg_store
            .entry(None)
            .or_default()
            .insert(Dimension::root(), HashMap::new());
        let mut dim_store: HashMap<ParentKey, HashMap<Dimension, DimTrace>> = HashMap::new();
        dim_store.entry(None).or_default().insert(
            Dimension::root(),
            DimTrace {
                complete: false,
                done: false,
                super_parent: None,
            },
        );
        Self {
            tree,
            msg_store,
            dim_store,
            job_done: Box::new(job_done),
        }
    }

    /// Record that `msg_id` (child of `parent`) has passed `box_name`, then
    /// re-check completion of its scope.
    pub fn add_msg(&mut self, msg_id: MessageId, parent: ParentKey, box_name: &str) {
        let Some(dim) = self.tree.dimension_of(box_name).cloned() else {
            warn!(box_name, "trace event from a box outside the dimension tree");
            return;
        };
        let tracked = self
            .msg_store
            .get(&parent)
            .and_then(|scopes| scopes.get(&dim))
            .is_some_and(|msgs| msgs.contains_key(&msg_id));
        if tracked {
            if let Some(record) = self
                .msg_store
                .get_mut(&parent)
                .and_then(|scopes| scopes.get_mut(&dim))
                .and_then(|msgs| msgs.get_mut(&msg_id))
            {
                record.boxes.insert(box_name.to_string(), true);
            }
        } else {
            self.insert_new_msg(&dim, box_name, parent, msg_id);
        }
        self.check_msg_finish(msg_id, parent, &dim);
    }

    /// Record that no more children of `parent_msg_id` will be generated in
    /// `box_name`'s dimension, then re-check that dimension.  Idempotent:
    /// the generator reports first and every downstream box of the
    /// dimension repeats the signal.
    pub fn set_dimension_complete(&mut self, parent_msg_id: MessageId, box_name: &str) {
        let Some(dim) = self.tree.dimension_of(box_name).cloned() else {
            warn!(box_name, "sentinel from a box outside the dimension tree");
            return;
        };
        // The scope may already be gone: the children can have drained and
        // completed the whole sub-tree before this (redundant) signal.
        let Some(record) = self
            .dim_store
            .get_mut(&Some(parent_msg_id))
            .and_then(|dims| dims.get_mut(&dim))
        else {
            return;
        };
        record.complete = true;
        self.check_dimension_finish(Some(parent_msg_id), &dim);
    }

    fn insert_new_msg(
        &mut self,
        dim: &Dimension,
        box_name: &str,
        parent: ParentKey,
        msg_id: MessageId,
    ) {
        let Some(members) = self.tree.boxes_of(dim) else {
            warn!(%dim, "message in a dimension with no boxes");
            return;
        };
        // the box the message arrived from is already passed
        let boxes: HashMap<String, bool> = members
            .iter()
            .map(|b| (b.clone(), b == box_name))
            .collect();
        self.msg_store
            .entry(parent)
            .or_default()
            .entry(dim.clone())
            .or_default()
            .insert(msg_id, MsgTrace { boxes });

        let subdims = self.tree.subdimensions(dim).to_vec();
        if !subdims.is_empty() {
            let msg_scopes = self.msg_store.entry(Some(msg_id)).or_default();
            for sub in &subdims {
                msg_scopes.insert(sub.clone(), HashMap::new());
            }
            let dim_scopes = self.dim_store.entry(Some(msg_id)).or_default();
            for sub in &subdims {
                dim_scopes.insert(
                    sub.clone(),
                    DimTrace {
                        complete: false,
                        done: false,
                        super_parent: parent,
                    },
                );
            }
        }
    }

    fn check_msg_finish(&mut self, msg_id: MessageId, parent: ParentKey, dim: &Dimension) {
        let boxes_done = self
            .msg_store
            .get(&parent)
            .and_then(|scopes| scopes.get(dim))
            .and_then(|msgs| msgs.get(&msg_id))
            .is_some_and(|record| record.boxes.values().all(|&passed| passed));
        if !boxes_done {
            return;
        }

        // sub-dimensions with no activity yet vacuously pass
        let subdims_done = match self.dim_store.get(&Some(msg_id)) {
            None => true,
            Some(dims) => dims.values().all(|d| d.complete && d.done),
        };
        if !subdims_done {
            return;
        }

        // the message is done: drop its record and its whole child space
        if let Some(msgs) = self
            .msg_store
            .get_mut(&parent)
            .and_then(|scopes| scopes.get_mut(dim))
        {
            msgs.remove(&msg_id);
        }
        self.dim_store.remove(&Some(msg_id));
        self.msg_store.remove(&Some(msg_id));

        if dim.is_root() {
            debug!(msg_id, "root message drained, job done");
            (self.job_done)(msg_id);
            return;
        }
        trace!(msg_id, %dim, "message done");
        self.check_dimension_finish(parent, dim);
    }

    fn check_dimension_finish(&mut self, parent: ParentKey, dim: &Dimension) {
        // the dimension may not even have started: its first message can
        // still be inside its first box
        let started = self
            .msg_store
            .get(&parent)
            .is_some_and(|scopes| scopes.contains_key(dim));
        if !started {
            return;
        }
        let (complete, super_parent) = match self
            .dim_store
            .get(&parent)
            .and_then(|dims| dims.get(dim))
        {
            Some(record) => (record.complete, record.super_parent),
            None => return,
        };
        if !complete {
            return;
        }
        let all_children_done = self
            .msg_store
            .get(&parent)
            .and_then(|scopes| scopes.get(dim))
            .is_some_and(HashMap::is_empty);
        if !all_children_done {
            return;
        }

        if let Some(record) = self
            .dim_store
            .get_mut(&parent)
            .and_then(|dims| dims.get_mut(dim))
        {
            record.done = true;
        }
        if let Some(scopes) = self.msg_store.get_mut(&parent) {
            scopes.remove(dim);
        }
        trace!(%dim, "dimension done");

        // resume the completion check one level up: my parent message, in its
        // own dimension, under its own parent
        let (Some(parent_msg), Some(parent_dim)) = (parent, dim.parent()) else {
            return;
        };
        self.check_msg_finish(parent_msg, super_parent, &parent_dim);
    }
}

/// [`FlowTracer`] implementation that linearizes every event into one
/// [`TracingModel`] behind a single lock.
pub struct ModelTracer {
    model: Arc<Mutex<TracingModel>>,
}

impl ModelTracer {
    pub fn new(model: Arc<Mutex<TracingModel>>) -> Arc<Self> {
        Arc::new(Self { model })
    }
}

impl FlowTracer for ModelTracer {
    fn message_passed(&self, box_name: &str, msg_id: MessageId, parent: Option<MessageId>) {
        trace!(box_name, msg_id, ?parent, "message passed");
        if let Ok(mut model) = self.model.lock() {
            model.add_msg(msg_id, parent, box_name);
        }
    }

    fn sentinel_passed(&self, box_name: &str, parent_msg_id: MessageId) {
        trace!(box_name, parent_msg_id, "sentinel passed");
        if let Ok(mut model) = self.model.lock() {
            model.set_dimension_complete(parent_msg_id, box_name);
        }
    }

    fn generation_finished(&self, box_name: &str, parent_msg_id: MessageId, generated: usize) {
        debug!(box_name, parent_msg_id, generated, "generation finished");
    }
}
