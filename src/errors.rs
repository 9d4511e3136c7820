use thiserror::Error;

/// Raised while compiling a schema into a runnable graph.  Every variant is
/// fatal: a flow that fails to build never accepts a message.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("box '{0}' is not registered")]
    UnknownBox(String),

    #[error(
        "box '{box_name}' derives dimension {found} but was previously derived as {expected}"
    )]
    DimensionMismatch {
        box_name: String,
        expected: String,
        found: String,
    },

    #[error("boxes {dependencies:?} feeding '{box_name}' disagree on dimension")]
    InconsistentDependencies {
        box_name: String,
        dependencies: Vec<String>,
    },

    #[error("aggregator '{0}' would aggregate below the root dimension")]
    AggregateBelowRoot(String),

    #[error("box '{box_name}' has invalid metadata: {reason}")]
    InvalidMeta { box_name: String, reason: String },

    #[error("parameters for box '{box_name}' were rejected")]
    InvalidParameters {
        box_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("box '{box_name}' failed to instantiate")]
    Instantiation {
        box_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("schema is malformed: {0}")]
    MalformedSchema(String),
}

/// Raised at the box boundary while a message is being processed.  These are
/// contained to the affected message: they are logged and the message is
/// dropped, the rest of the flow keeps running.
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("box '{box_name}' in {mode} mode failed on input {input}")]
    Invocation {
        box_name: String,
        mode: &'static str,
        input: String,
        #[source]
        source: anyhow::Error,
    },

    /// The generator's routine already settled, yet something (typically a
    /// dangling spawned task) tried to emit.  A systemic bug in the box,
    /// more severe than a data problem.
    #[error("generator '{box_name}' emitted messages after its routine had settled")]
    GeneratorMisbehaved { box_name: String },

    #[error("box '{box_name}' invoked emit but its metadata declares no 'emits'")]
    InconsistentBox { box_name: String },

    #[error("box '{box_name}': aggregator has not been implemented yet")]
    NotImplemented { box_name: String },

    #[error("box '{box_name}' does not support batching")]
    BatchUnsupported { box_name: String },
}

/// Raised by queue plumbing (fan-out in particular).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("push into a downstream queue failed during fan-out")]
    FanOut {
        #[source]
        source: Box<QueueError>,
    },

    #[error("queue '{queue}' rejected a push: {reason}")]
    Rejected { queue: String, reason: String },
}

/// Raised when a write-once field invariant is violated on a message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error(
        "cannot provide some data because the message already contains following results {keys:?}"
    )]
    AlreadyProvided { keys: Vec<String> },
}
