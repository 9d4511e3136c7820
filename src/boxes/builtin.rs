//! Builtin boxes: a hello-world generator and a handful of small text
//! mappers, enough to exercise a flow end to end from the CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::boxes::{
    BatchSettings, BoxDefinition, BoxMeta, BoxProcessor, BoxRegistry, Emitter,
};
use crate::message::MessageData;
use crate::services::ServiceProvider;

pub fn register_all(registry: &mut BoxRegistry) {
    registry.register(Arc::new(HelloWorldDefinition));
    registry.register(Arc::new(WordCountDefinition));
    registry.register(Arc::new(PunctCountDefinition));
    registry.register(Arc::new(ChecksumDefinition));
    registry.register(Arc::new(WordBatchCountDefinition));
    registry.register(Arc::new(PrintDefinition));
}

fn msg_bag(text: &str) -> MessageData {
    let mut data = MessageData::new();
    data.insert("msg".into(), Value::from(text));
    data
}

fn count_words(msg: &str) -> usize {
    msg.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .count()
}

/// Generator greeting the world in several languages, in two chunks with a
/// pause in between, the way a paged upstream source would.
struct HelloWorldDefinition;

struct HelloWorld;

#[async_trait]
impl BoxProcessor for HelloWorld {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        emit: Emitter,
    ) -> Result<Value> {
        emit.emit(vec![msg_bag("Hello World!"), msg_bag("Yellow World!")], None)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        emit.emit(vec![msg_bag("Ola Mundo!")], None)?;
        Ok(Value::Null)
    }
}

impl BoxDefinition for HelloWorldDefinition {
    fn name(&self) -> &str {
        "helloworld"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            emits: vec!["msg".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(HelloWorld))
    }
}

struct WordCountDefinition;

struct WordCount;

#[async_trait]
impl BoxProcessor for WordCount {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
        Ok(json!({"words": count_words(msg)}))
    }
}

impl BoxDefinition for WordCountDefinition {
    fn name(&self) -> &str {
        "wordcount"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["msg".into()],
            provides: vec!["words".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(WordCount))
    }
}

struct PunctCountDefinition;

struct PunctCount;

#[async_trait]
impl BoxProcessor for PunctCount {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
        let punct = msg.chars().filter(|c| c.is_ascii_punctuation()).count();
        Ok(json!({"punct": punct}))
    }
}

impl BoxDefinition for PunctCountDefinition {
    fn name(&self) -> &str {
        "punctcount"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["msg".into()],
            provides: vec!["punct".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(PunctCount))
    }
}

/// Combines the two counts into `sqrt(factor) * words + punct`; the factor
/// comes from the schema's `parameters` and defaults to 2.
struct ChecksumDefinition;

struct Checksum {
    factor: f64,
}

#[async_trait]
impl BoxProcessor for Checksum {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let words = input
            .get("words")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("'words' is missing or not a number"))?;
        let punct = input
            .get("punct")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("'punct' is missing or not a number"))?;
        Ok(json!({"checksum": self.factor.sqrt() * words + punct}))
    }
}

impl BoxDefinition for ChecksumDefinition {
    fn name(&self) -> &str {
        "checksum"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["words".into(), "punct".into()],
            provides: vec!["checksum".into()],
            ..BoxMeta::default()
        }
    }

    fn validate(&self, params: &Value) -> Result<()> {
        match params {
            Value::Null => Ok(()),
            Value::Number(n) if n.as_f64().is_some_and(|f| f >= 0.0) => Ok(()),
            other => bail!("checksum expects a non-negative number, got {other}"),
        }
    }

    fn prepare(&self, params: Value) -> Result<Arc<dyn BoxProcessor>> {
        let factor = match params {
            Value::Null => 2.0,
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow!("checksum factor does not fit a float"))?,
            other => bail!("checksum expects a number, got {other}"),
        };
        Ok(Arc::new(Checksum { factor }))
    }
}

/// Batching variant of `wordcount`: waits for up to 3 messages (or 0.3 s)
/// and counts them in one go.
struct WordBatchCountDefinition;

struct WordBatchCount;

#[async_trait]
impl BoxProcessor for WordBatchCount {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
        Ok(json!({"words": count_words(msg)}))
    }

    async fn process_batch(
        &self,
        _services: &ServiceProvider,
        batch: Vec<MessageData>,
    ) -> Result<Vec<MessageData>> {
        Ok(batch
            .iter()
            .map(|input| {
                let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
                let mut out = MessageData::new();
                out.insert("words".into(), Value::from(count_words(msg)));
                out
            })
            .collect())
    }
}

impl BoxDefinition for WordBatchCountDefinition {
    fn name(&self) -> &str {
        "wordbatchcount"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["msg".into()],
            provides: vec!["words".into()],
            batch: Some(BatchSettings {
                max_size: 3,
                timeout_seconds: Some(0.3),
            }),
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(WordBatchCount))
    }
}

/// Logs whatever passes through it.  Writes nothing back.
struct PrintDefinition;

struct Print;

#[async_trait]
impl BoxProcessor for Print {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let rendered = Value::Object(input);
        info!(message = %rendered, "print");
        Ok(json!({}))
    }
}

impl BoxDefinition for PrintDefinition {
    fn name(&self) -> &str {
        "print"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["msg".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(Print))
    }
}
