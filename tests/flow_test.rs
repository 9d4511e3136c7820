use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bakeflow::boxes::{BoxDefinition, BoxMeta, BoxProcessor, BoxRegistry, Emitter};
use bakeflow::flow::{Flow, FlowBuilder, parse_schema};
use bakeflow::message::MessageData;
use bakeflow::queue::{CallbackDrain, InspectingDrain, MessageSink};
use bakeflow::services::ServiceProvider;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

struct SplitWordsDefinition;

struct SplitWords;

#[async_trait]
impl BoxProcessor for SplitWords {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        emit: Emitter,
    ) -> Result<Value> {
        let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
        for word in msg.split_whitespace() {
            let mut bag = MessageData::new();
            bag.insert("word".into(), json!(word));
            emit.emit(vec![bag], None)?;
        }
        Ok(Value::Null)
    }
}

impl BoxDefinition for SplitWordsDefinition {
    fn name(&self) -> &str {
        "splitwords"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["msg".into()],
            emits: vec!["word".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(SplitWords))
    }
}

struct WordLenDefinition;

struct WordLen;

#[async_trait]
impl BoxProcessor for WordLen {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let word = input.get("word").and_then(Value::as_str).unwrap_or("");
        Ok(json!({"len": word.chars().count()}))
    }
}

impl BoxDefinition for WordLenDefinition {
    fn name(&self) -> &str {
        "wordlen"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            requires: vec!["word".into()],
            provides: vec!["len".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(WordLen))
    }
}

/// Generator whose source is gone: emits nothing and fails right away.
struct BrokenSourceDefinition;

struct BrokenSource;

#[async_trait]
impl BoxProcessor for BrokenSource {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        Err(anyhow!("upstream refused the connection"))
    }
}

impl BoxDefinition for BrokenSourceDefinition {
    fn name(&self) -> &str {
        "brokensource"
    }

    fn meta(&self) -> BoxMeta {
        BoxMeta {
            emits: vec!["msg".into()],
            ..BoxMeta::default()
        }
    }

    fn prepare(&self, _params: Value) -> Result<Arc<dyn BoxProcessor>> {
        Ok(Arc::new(BrokenSource))
    }
}

fn registry() -> BoxRegistry {
    let mut registry = BoxRegistry::with_builtins();
    registry.register(Arc::new(SplitWordsDefinition));
    registry.register(Arc::new(WordLenDefinition));
    registry.register(Arc::new(BrokenSourceDefinition));
    registry
}

type Exports = Arc<Mutex<Vec<MessageData>>>;

fn build_flow(yaml: &str) -> (Flow, Exports) {
    let exports: Exports = Arc::new(Mutex::new(Vec::new()));
    let drain = {
        let exports = exports.clone();
        CallbackDrain::new(move |fields| exports.lock().unwrap().push(fields))
    };
    let schema = parse_schema(yaml).expect("schema must parse");
    let flow = FlowBuilder::new(Arc::new(ServiceProvider::new()))
        .with_drain(drain)
        .build(&schema, &registry())
        .expect("build must succeed");
    (flow, exports)
}

async fn finish(flow: &Flow, initial: MessageData) {
    let job = flow.submit(initial);
    timeout(Duration::from_secs(5), job.finished())
        .await
        .expect("the job must drain");
}

#[tokio::test]
async fn test_fanout_join_flow_drains_and_checksums() {
    let (flow, exports) = build_flow(
        r#"
process:
  - - helloworld:
        - [wordcount, punctcount]
        - [checksum]
parameters:
  checksum: 4
"#,
    );

    finish(&flow, MessageData::new()).await;

    let exports = exports.lock().unwrap();
    assert_eq!(exports.len(), 3);
    for fields in exports.iter() {
        // every greeting has two words and one bang: sqrt(4) * 2 + 1
        assert_eq!(fields.get("words"), Some(&json!(2)));
        assert_eq!(fields.get("punct"), Some(&json!(1)));
        assert_eq!(fields.get("checksum"), Some(&json!(5.0)));
        assert!(fields.get("msg").is_some());
    }
}

#[tokio::test]
async fn test_nested_generators_complete() {
    let (flow, exports) = build_flow(
        r#"
process:
  - - helloworld:
        - - splitwords:
              - [wordlen]
"#,
    );

    finish(&flow, MessageData::new()).await;

    let exports = exports.lock().unwrap();
    // three greetings of two words each
    assert_eq!(exports.len(), 6);
    for fields in exports.iter() {
        let word = fields.get("word").and_then(Value::as_str).expect("word");
        assert_eq!(fields.get("len"), Some(&json!(word.chars().count())));
    }
}

#[tokio::test]
async fn test_initial_fields_feed_the_first_group() {
    let (flow, exports) = build_flow(
        r#"
process:
  - [wordcount, punctcount]
"#,
    );

    let mut initial = MessageData::new();
    initial.insert("msg".into(), json!("no punctuation here"));
    finish(&flow, initial).await;

    let exports = exports.lock().unwrap();
    // one export per terminal branch of the tee
    assert_eq!(exports.len(), 2);
    for fields in exports.iter() {
        assert!(fields.get("words") == Some(&json!(3)) || fields.get("punct") == Some(&json!(0)));
    }
}

#[tokio::test]
async fn test_batching_box_in_a_flow() {
    let (flow, exports) = build_flow(
        r#"
process:
  - [wordbatchcount]
"#,
    );

    let mut initial = MessageData::new();
    initial.insert("msg".into(), json!("one two three"));
    finish(&flow, initial).await;

    let exports = exports.lock().unwrap();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].get("words"), Some(&json!(3)));
}

#[tokio::test]
async fn test_failed_generation_still_finishes_the_job() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let drain = {
        let errors = errors.clone();
        InspectingDrain::new(
            |_fields| {},
            move |reason| errors.lock().unwrap().push(reason),
        )
    };
    let schema = parse_schema(
        r#"
process:
  - - brokensource:
        - [wordcount]
"#,
    )
    .expect("schema must parse");
    let flow = FlowBuilder::new(Arc::new(ServiceProvider::new()))
        .with_drain(drain as Arc<dyn MessageSink>)
        .build(&schema, &registry())
        .expect("build must succeed");

    finish(&flow, MessageData::new()).await;

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("brokensource"));
}

#[tokio::test]
async fn test_jobs_complete_independently() {
    let (flow, exports) = build_flow(
        r#"
process:
  - - helloworld:
        - [wordcount, punctcount]
        - [checksum]
"#,
    );

    let first = flow.submit(MessageData::new());
    let second = flow.submit(MessageData::new());
    timeout(Duration::from_secs(5), first.finished())
        .await
        .expect("first job must drain");
    timeout(Duration::from_secs(5), second.finished())
        .await
        .expect("second job must drain");

    assert_eq!(exports.lock().unwrap().len(), 6);
}
