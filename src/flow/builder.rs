//! Compiles a [`FlowSchema`] into a runnable [`Flow`].
//!
//! Two passes over the schema.  The first one walks the nested process
//! declaration and produces a graph: dependency edges (stored reversed, from
//! dependent to dependency), a deterministic discovery order and the
//! dimension of every box.  Every structural error is caught here, before a
//! single box is instantiated.  The second pass folds the topological order
//! and wires actual queues: each box's outbound sink feeds the inbound
//! queues of its dependents, so dependents are built first and the source
//! end of the graph last.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::boxes::{BoxKind, BoxMeta, BoxRegistry, BoxRuntime, DEFAULT_BATCH_TIMEOUT_SECS};
use crate::errors::BuildError;
use crate::flow::schema::{ConcurrentGroup, FlowSchema, SchemaComponent};
use crate::flow::trace::{Dimension, DimensionTree, ModelTracer, TracingModel};
use crate::flow::{Flow, ROOT_NODE};
use crate::message::MessageId;
use crate::queue::joined::{Tee, ZipJoin};
use crate::queue::memory::{MemoryBatchQueue, MemorySingleQueue};
use crate::queue::{MessageSink, NoopQueue};
use crate::services::ServiceProvider;

/// First-pass outcome.  `deps` maps a box to the boxes it consumes from,
/// `dependents` is the same relation reversed; `order` records first
/// discovery, which keeps the topological sort deterministic.
#[derive(Default)]
struct GraphAnalysis {
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
    order: Vec<String>,
    dimensions: HashMap<String, Dimension>,
    metas: HashMap<String, BoxMeta>,
}

impl GraphAnalysis {
    fn add_edge(&mut self, dependent: &str, dependency: &str) {
        let deps = self.deps.entry(dependent.to_string()).or_default();
        if !deps.iter().any(|d| d == dependency) {
            deps.push(dependency.to_string());
        }
        let back = self.dependents.entry(dependency.to_string()).or_default();
        if !back.iter().any(|d| d == dependent) {
            back.push(dependent.to_string());
        }
    }
}

/// Base dimension shared by a concurrent group: the dimension all the boxes
/// feeding it sit in.  Disagreement among them is a schema bug.
fn base_dimension(
    group: &ConcurrentGroup,
    previous: &[String],
    g: &GraphAnalysis,
) -> Result<Dimension, BuildError> {
    let first = group
        .first()
        .and_then(|c| c.name().ok())
        .unwrap_or_default()
        .to_string();
    let mut base: Option<&Dimension> = None;
    for prev in previous {
        let Some(dim) = g.dimensions.get(prev) else {
            continue;
        };
        match base {
            None => base = Some(dim),
            Some(seen) if seen == dim => {}
            Some(_) => {
                return Err(BuildError::InconsistentDependencies {
                    box_name: first,
                    dependencies: previous.to_vec(),
                });
            }
        }
    }
    base.cloned().ok_or_else(|| {
        BuildError::MalformedSchema(format!(
            "group containing '{first}' follows a group with no mapper to feed it"
        ))
    })
}

fn analyze(
    process: &[ConcurrentGroup],
    previous: &[String],
    registry: &BoxRegistry,
    g: &mut GraphAnalysis,
) -> Result<(), BuildError> {
    let Some((group, rest)) = process.split_first() else {
        return Ok(());
    };
    let base = base_dimension(group, previous, g)?;

    for component in group {
        let name = component.name()?.to_string();
        let meta = registry.get(&name)?.meta();
        meta.check(&name)?;
        let kind = meta.kind();

        match (component, kind) {
            (SchemaComponent::Plain(_), BoxKind::Generator) => {
                return Err(BuildError::MalformedSchema(format!(
                    "generator '{name}' must nest the process consuming its children"
                )));
            }
            (SchemaComponent::Generator(_), k) if k != BoxKind::Generator => {
                return Err(BuildError::MalformedSchema(format!(
                    "box '{name}' does not emit and cannot head a nested process"
                )));
            }
            _ => {}
        }

        let dim = match kind {
            BoxKind::Mapper => base.clone(),
            BoxKind::Generator => base.extended(&meta.emits),
            BoxKind::Aggregator => base
                .parent()
                .ok_or_else(|| BuildError::AggregateBelowRoot(name.clone()))?,
        };
        match g.dimensions.get(&name) {
            Some(seen) if *seen != dim => {
                return Err(BuildError::DimensionMismatch {
                    box_name: name,
                    expected: seen.to_string(),
                    found: dim.to_string(),
                });
            }
            Some(_) => {}
            None => {
                g.dimensions.insert(name.clone(), dim);
                g.metas.insert(name.clone(), meta);
                g.order.push(name.clone());
            }
        }
        for prev in previous {
            g.add_edge(&name, prev);
        }
    }

    for component in group {
        if let Some(nested) = component.nested() {
            let name = component.name()?.to_string();
            analyze(nested, std::slice::from_ref(&name), registry, g)?;
        }
    }

    let next_previous: Vec<String> = group
        .iter()
        .filter_map(|component| match component {
            SchemaComponent::Plain(name) => Some(name.clone()),
            SchemaComponent::Generator(_) => None,
        })
        .collect();
    analyze(rest, &next_previous, registry, g)
}

/// Order in which boxes get instantiated: every dependent strictly before
/// its dependencies, ties broken by discovery order.
fn topo_sort(g: &GraphAnalysis) -> Result<Vec<String>, BuildError> {
    let mut pending: HashMap<&str, usize> = g
        .order
        .iter()
        .map(|name| {
            (
                name.as_str(),
                g.dependents.get(name).map_or(0, Vec::len),
            )
        })
        .collect();
    let mut emitted: HashSet<&str> = HashSet::new();
    let mut result = Vec::with_capacity(g.order.len());
    while result.len() < g.order.len() {
        let next = g.order.iter().find(|name| {
            !emitted.contains(name.as_str()) && pending.get(name.as_str()) == Some(&0)
        });
        let Some(next) = next else {
            return Err(BuildError::MalformedSchema(
                "the process graph contains a cycle".into(),
            ));
        };
        emitted.insert(next.as_str());
        for dep in g.deps.get(next.as_str()).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dep.as_str()) {
                *count -= 1;
            }
        }
        result.push(next.clone());
    }
    Ok(result)
}

fn fan_out(mut outputs: Vec<Arc<dyn MessageSink>>) -> Result<Arc<dyn MessageSink>, BuildError> {
    if outputs.len() == 1 {
        return Ok(outputs.remove(0));
    }
    let tee = Tee::new(outputs).map_err(|err| BuildError::MalformedSchema(err.to_string()))?;
    Ok(tee as Arc<dyn MessageSink>)
}

pub struct FlowBuilder {
    services: Arc<ServiceProvider>,
    drain: Option<Arc<dyn MessageSink>>,
}

impl FlowBuilder {
    pub fn new(services: Arc<ServiceProvider>) -> Self {
        Self {
            services,
            drain: None,
        }
    }

    /// Sink receiving messages from boxes nothing depends on.  Without one
    /// they are dropped.
    pub fn with_drain(mut self, drain: Arc<dyn MessageSink>) -> Self {
        self.drain = Some(drain);
        self
    }

    pub fn build(&self, schema: &FlowSchema, registry: &BoxRegistry) -> Result<Flow, BuildError> {
        schema.validate()?;

        let mut g = GraphAnalysis::default();
        g.dimensions.insert(ROOT_NODE.to_string(), Dimension::root());
        g.order.push(ROOT_NODE.to_string());
        analyze(
            &schema.process,
            std::slice::from_ref(&ROOT_NODE.to_string()),
            registry,
            &mut g,
        )?;
        for box_name in schema.parameters.keys() {
            if !g.metas.contains_key(box_name) {
                return Err(BuildError::MalformedSchema(format!(
                    "parameters given for box '{box_name}' which the process never uses"
                )));
            }
        }
        // a join releases a message once it arrived through every face, and
        // faces match by message id; children of two different generators
        // have disjoint ids, so a box fed by more than one generator would
        // hold every message forever
        for (name, deps) in &g.deps {
            let generators: Vec<&str> = deps
                .iter()
                .filter(|dep| {
                    g.metas
                        .get(dep.as_str())
                        .is_some_and(|meta| meta.kind() == BoxKind::Generator)
                })
                .map(String::as_str)
                .collect();
            if generators.len() > 1 {
                return Err(BuildError::MalformedSchema(format!(
                    "box '{name}' consumes children of several generators ({}); \
                     those messages can never pair up",
                    generators.join(", ")
                )));
            }
        }
        let topo = topo_sort(&g)?;
        debug!(order = ?topo, "instantiation order");

        let tree = Arc::new(DimensionTree::new(g.dimensions.clone()));
        let waiters: Arc<DashMap<MessageId, oneshot::Sender<MessageId>>> =
            Arc::new(DashMap::new());
        let on_done = {
            let waiters = waiters.clone();
            move |msg_id: MessageId| {
                if let Some((_, tx)) = waiters.remove(&msg_id) {
                    let _ = tx.send(msg_id);
                }
            }
        };
        let model = Arc::new(Mutex::new(TracingModel::new(tree.clone(), on_done)));
        let tracer = ModelTracer::new(model.clone());

        // outbound edge queues keyed (dependent, dependency); a dependent is
        // always built before the boxes feeding it
        let mut edges: HashMap<(String, String), Arc<dyn MessageSink>> = HashMap::new();
        let mut entry: Option<Arc<dyn MessageSink>> = None;

        for name in &topo {
            let dependents = g.dependents.get(name).cloned().unwrap_or_default();
            let mut outputs: Vec<Arc<dyn MessageSink>> = Vec::with_capacity(dependents.len());
            for dependent in &dependents {
                let sink = edges
                    .get(&(dependent.clone(), name.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        BuildError::MalformedSchema(format!(
                            "no queue wired from '{name}' to '{dependent}'"
                        ))
                    })?;
                outputs.push(sink);
            }
            let output: Arc<dyn MessageSink> = if outputs.is_empty() {
                match &self.drain {
                    Some(drain) => drain.clone(),
                    None => Arc::new(NoopQueue),
                }
            } else {
                fan_out(outputs)?
            };

            if name == ROOT_NODE {
                entry = Some(output);
                continue;
            }

            let Some(meta) = g.metas.get(name).cloned() else {
                return Err(BuildError::UnknownBox(name.clone()));
            };
            let definition = registry.get(name)?;
            let params = schema
                .parameters
                .get(name)
                .cloned()
                .unwrap_or(Value::Null);
            definition
                .validate(&params)
                .map_err(|source| BuildError::InvalidParameters {
                    box_name: name.clone(),
                    source,
                })?;
            let processor =
                definition
                    .prepare(params)
                    .map_err(|source| BuildError::Instantiation {
                        box_name: name.clone(),
                        source,
                    })?;
            let runtime = BoxRuntime::new(
                name,
                meta.clone(),
                self.services.clone(),
                processor,
                output,
                tracer.clone(),
            );
            let concurrency = meta.concurrency.unwrap_or(1);
            let inbound: Arc<dyn MessageSink> = match &meta.batch {
                Some(batch) => {
                    let timeout = Duration::from_secs_f64(
                        batch.timeout_seconds.unwrap_or(DEFAULT_BATCH_TIMEOUT_SECS),
                    );
                    MemoryBatchQueue::new(runtime, concurrency, batch.max_size, timeout, name)
                }
                None => MemorySingleQueue::new(runtime, concurrency, name),
            };

            let deps = g.deps.get(name).cloned().unwrap_or_default();
            if deps.len() <= 1 {
                for dep in deps {
                    edges.insert((name.clone(), dep), inbound.clone());
                }
            } else {
                let zip = ZipJoin::new(inbound, deps.len())
                    .map_err(|err| BuildError::MalformedSchema(err.to_string()))?;
                for (face, dep) in zip.faces().into_iter().zip(deps) {
                    edges.insert((name.clone(), dep), face);
                }
            }
        }

        let entry = entry.ok_or_else(|| {
            BuildError::MalformedSchema("the process graph has no entry point".into())
        })?;
        Ok(Flow::new(entry, model, waiters, tree))
    }
}
