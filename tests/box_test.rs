use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bakeflow::boxes::{BoxMeta, BoxProcessor, BoxRegistry, BoxRuntime, Emitter};
use bakeflow::errors::QueueError;
use bakeflow::flow::trace::NoopTracer;
use bakeflow::message::{FlowMessage, Message, MessageData};
use bakeflow::queue::MessageSink;
use bakeflow::services::ServiceProvider;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct RecordingSink {
    pushes: Mutex<Vec<FlowMessage>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pushes(&self) -> Vec<FlowMessage> {
        self.pushes.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn push(&self, msg: FlowMessage, _priority: Option<u32>) -> Result<(), QueueError> {
        self.pushes.lock().unwrap().push(msg);
        Ok(())
    }

    fn target(&self) -> &str {
        "recording"
    }
}

fn runtime_with(
    name: &str,
    meta: BoxMeta,
    processor: Arc<dyn BoxProcessor>,
) -> (Arc<BoxRuntime>, Arc<RecordingSink>) {
    let sink = RecordingSink::new();
    let runtime = BoxRuntime::new(
        name,
        meta,
        Arc::new(ServiceProvider::new()),
        processor,
        sink.clone(),
        Arc::new(NoopTracer),
    );
    (runtime, sink)
}

fn root_with_msg(text: &str) -> Arc<Message> {
    let mut init = MessageData::new();
    init.insert("msg".into(), json!(text));
    Message::new_root(init)
}

fn mapper_meta() -> BoxMeta {
    BoxMeta {
        requires: vec!["msg".into()],
        provides: vec!["upper".into()],
        ..BoxMeta::default()
    }
}

struct Upper;

#[async_trait]
impl BoxProcessor for Upper {
    async fn process(
        &self,
        _services: &ServiceProvider,
        input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        let msg = input.get("msg").and_then(Value::as_str).unwrap_or("");
        Ok(json!({"upper": msg.to_uppercase()}))
    }
}

struct NotAnObject;

#[async_trait]
impl BoxProcessor for NotAnObject {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        Ok(json!(42))
    }
}

/// Generator splitting `msg` into one child per word.
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
        Ok(json!("split"))
    }
}

fn generator_meta() -> BoxMeta {
    BoxMeta {
        requires: vec!["msg".into()],
        emits: vec!["word".into()],
        ..BoxMeta::default()
    }
}

#[tokio::test]
async fn test_mapper_writes_provides_and_forwards() {
    let (runtime, sink) = runtime_with("upper", mapper_meta(), Arc::new(Upper));
    let msg = root_with_msg("hello there");

    runtime.process(FlowMessage::Data(msg.clone())).await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].id(), msg.id());
    assert_eq!(msg.get("upper"), Some(json!("HELLO THERE")));
}

#[tokio::test]
async fn test_print_box_forwards_unchanged() {
    let registry = BoxRegistry::with_builtins();
    let definition = registry.get("print").expect("print is a builtin");
    let processor = definition.prepare(Value::Null).expect("prepare");
    let (runtime, sink) = runtime_with("print", definition.meta(), processor);
    let msg = root_with_msg("Hello World!");

    runtime.process(FlowMessage::Data(msg.clone())).await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].id(), msg.id());
    assert_eq!(msg.get("msg"), Some(json!("Hello World!")));
}

#[tokio::test]
async fn test_mapper_result_must_be_an_object() {
    let (runtime, sink) = runtime_with("upper", mapper_meta(), Arc::new(NotAnObject));
    let msg = root_with_msg("hello");

    runtime.process(FlowMessage::Data(msg.clone())).await;

    // the bad message is dropped, not forwarded half-written
    assert!(sink.pushes().is_empty());
    assert_eq!(msg.get("upper"), None);
}

#[tokio::test]
async fn test_generator_emits_children_then_sentinel() {
    let (runtime, sink) = runtime_with("split", generator_meta(), Arc::new(SplitWords));
    let parent = root_with_msg("one two three");

    runtime.process(FlowMessage::Data(parent.clone())).await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 4);
    for push in &pushes[..3] {
        let FlowMessage::Data(child) = push else {
            panic!("children must precede the sentinel");
        };
        assert_eq!(child.parent().map(|p| p.id()), Some(parent.id()));
        assert!(child.get("word").is_some());
        // inherited through the layered lookup
        assert_eq!(child.get("msg"), Some(json!("one two three")));
    }
    let FlowMessage::Sentinel(sentinel) = &pushes[3] else {
        panic!("the last push must be the sentinel");
    };
    assert_eq!(sentinel.parent().id(), parent.id());
    assert_eq!(sentinel.generated(), 3);
    assert_eq!(sentinel.result(), &Ok(json!("split")));
}

struct FailsAfterOne;

#[async_trait]
impl BoxProcessor for FailsAfterOne {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        emit: Emitter,
    ) -> Result<Value> {
        let mut bag = MessageData::new();
        bag.insert("word".into(), json!("only"));
        emit.emit(vec![bag], None)?;
        Err(anyhow!("source went away"))
    }
}

#[tokio::test]
async fn test_failed_generator_still_sends_the_sentinel() {
    let (runtime, sink) = runtime_with("split", generator_meta(), Arc::new(FailsAfterOne));
    let parent = root_with_msg("whatever");

    runtime.process(FlowMessage::Data(parent.clone())).await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 2);
    let FlowMessage::Sentinel(sentinel) = &pushes[1] else {
        panic!("the dimension must still be closed");
    };
    assert_eq!(sentinel.generated(), 1);
    let Err(reason) = sentinel.result() else {
        panic!("the sentinel must carry the failure");
    };
    assert!(reason.contains("split"));
}

struct EmitsFromMapper;

#[async_trait]
impl BoxProcessor for EmitsFromMapper {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        emit: Emitter,
    ) -> Result<Value> {
        emit.emit(vec![MessageData::new()], None)?;
        Ok(json!({}))
    }
}

#[tokio::test]
async fn test_mapper_cannot_emit() {
    let (runtime, sink) = runtime_with("upper", mapper_meta(), Arc::new(EmitsFromMapper));

    runtime
        .process(FlowMessage::Data(root_with_msg("hello")))
        .await;

    assert!(sink.pushes().is_empty());
}

struct EmitsLate;

#[async_trait]
impl BoxProcessor for EmitsLate {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        emit: Emitter,
    ) -> Result<Value> {
        let mut bag = MessageData::new();
        bag.insert("word".into(), json!("early"));
        emit.emit(vec![bag], None)?;
        let dangling = emit.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            let mut bag = MessageData::new();
            bag.insert("word".into(), json!("late"));
            let _ = dangling.emit(vec![bag], None);
        });
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_emit_after_settling_is_refused() {
    let (runtime, sink) = runtime_with("split", generator_meta(), Arc::new(EmitsLate));
    let parent = root_with_msg("whatever");

    runtime.process(FlowMessage::Data(parent)).await;
    sleep(Duration::from_millis(200)).await;

    // one child and the sentinel; the late emit bounced off the revoked token
    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 2);
    assert!(matches!(pushes[1], FlowMessage::Sentinel(_)));
}

#[tokio::test]
async fn test_aggregator_is_not_implemented() {
    let meta = BoxMeta {
        aggregates: true,
        ..BoxMeta::default()
    };
    let (runtime, sink) = runtime_with("collect", meta, Arc::new(Upper));

    runtime
        .process(FlowMessage::Data(root_with_msg("hello")))
        .await;

    assert!(sink.pushes().is_empty());
}

#[tokio::test]
async fn test_sentinels_pass_through_untouched() {
    let (runtime, sink) = runtime_with("upper", mapper_meta(), Arc::new(Upper));
    let parent = root_with_msg("hello");
    let sentinel = parent.create_sentinel(2, Ok(Value::Null));

    runtime
        .process(FlowMessage::Sentinel(sentinel.clone()))
        .await;

    let pushes = sink.pushes();
    assert_eq!(pushes.len(), 1);
    let FlowMessage::Sentinel(passed) = &pushes[0] else {
        panic!("sentinel must stay a sentinel");
    };
    assert_eq!(passed.id(), sentinel.id());
}

struct BatchUpper;

#[async_trait]
impl BoxProcessor for BatchUpper {
    async fn process(
        &self,
        _services: &ServiceProvider,
        _input: MessageData,
        _emit: Emitter,
    ) -> Result<Value> {
        Err(anyhow!("batch boxes are never invoked one by one"))
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
                out.insert("upper".into(), json!(msg.to_uppercase()));
                out
            })
            .collect())
    }
}

#[tokio::test]
async fn test_batch_mapper_writes_every_message() {
    let meta = BoxMeta {
        requires: vec!["msg".into()],
        provides: vec!["upper".into()],
        ..BoxMeta::default()
    };
    let (runtime, sink) = runtime_with("batchupper", meta, Arc::new(BatchUpper));

    let a = root_with_msg("aa");
    let b = root_with_msg("bb");
    let sentinel = a.create_sentinel(0, Ok(Value::Null));
    runtime
        .process_batch(vec![
            FlowMessage::Data(a.clone()),
            FlowMessage::Sentinel(sentinel),
            FlowMessage::Data(b.clone()),
        ])
        .await;

    assert_eq!(a.get("upper"), Some(json!("AA")));
    assert_eq!(b.get("upper"), Some(json!("BB")));
    // the sentinel went through on its own, the data messages after their
    // batch settled
    assert_eq!(sink.pushes().len(), 3);
}
