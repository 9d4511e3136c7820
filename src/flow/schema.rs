//! Declarative flow schemas.
//!
//! A schema is a list of concurrent groups executed serially. Each group
//! holds box names that may run in parallel; a generator entry is a
//! single-key mapping from the generator's name to a nested process that
//! consumes its children.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BuildError;

/// Boxes that may run concurrently on the same message.
pub type ConcurrentGroup = Vec<SchemaComponent>;

/// A serial list of concurrent groups.
pub type Process = Vec<ConcurrentGroup>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaComponent {
    /// A mapper or aggregator, referenced by name.
    Plain(String),
    /// A generator with the process consuming its children nested under it.
    Generator(BTreeMap<String, Process>),
}

impl SchemaComponent {
    /// Name of the box this entry instantiates.
    pub fn name(&self) -> Result<&str, BuildError> {
        match self {
            SchemaComponent::Plain(name) => Ok(name),
            SchemaComponent::Generator(map) => {
                if map.len() != 1 {
                    return Err(BuildError::MalformedSchema(format!(
                        "a generator entry must have exactly one key, found {}",
                        map.len()
                    )));
                }
                map.keys()
                    .next()
                    .map(String::as_str)
                    .ok_or_else(|| BuildError::MalformedSchema("empty generator entry".into()))
            }
        }
    }

    pub fn nested(&self) -> Option<&Process> {
        match self {
            SchemaComponent::Plain(_) => None,
            SchemaComponent::Generator(map) => map.values().next(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSchema {
    pub process: Process,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl FlowSchema {
    /// Structural checks that do not need the box registry.
    pub fn validate(&self) -> Result<(), BuildError> {
        validate_process(&self.process)
    }
}

fn validate_process(process: &Process) -> Result<(), BuildError> {
    if process.is_empty() {
        return Err(BuildError::MalformedSchema(
            "a process must contain at least one concurrent group".into(),
        ));
    }
    for group in process {
        if group.is_empty() {
            return Err(BuildError::MalformedSchema(
                "a concurrent group must not be empty".into(),
            ));
        }
        for component in group {
            component.name()?;
            if let Some(nested) = component.nested() {
                validate_process(nested)?;
            }
        }
    }
    Ok(())
}

/// Parses a schema from YAML (or JSON, which YAML subsumes).
pub fn parse_schema(text: &str) -> anyhow::Result<FlowSchema> {
    let schema: FlowSchema = serde_yaml::from_str(text).context("failed to parse flow schema")?;
    schema.validate()?;
    Ok(schema)
}

/// Reads and parses a schema file.
pub fn load_schema(path: impl AsRef<Path>) -> anyhow::Result<FlowSchema> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow schema {}", path.display()))?;
    parse_schema(&text)
}
