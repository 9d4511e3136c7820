use bakeflow::errors::QueueError;
use bakeflow::message::{FlowMessage, Message, MessageData, MessageId};
use bakeflow::queue::{MessageSink, Tee, ZipJoin};
use std::sync::{Arc, Mutex};

fn data_msg() -> FlowMessage {
    FlowMessage::Data(Message::new_root(MessageData::new()))
}

#[derive(Default)]
struct RecordingSink {
    pushes: Mutex<Vec<(MessageId, Option<u32>)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pushes(&self) -> Vec<(MessageId, Option<u32>)> {
        self.pushes.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError> {
        self.pushes.lock().unwrap().push((msg.id(), priority));
        Ok(())
    }

    fn target(&self) -> &str {
        "recording"
    }
}

struct FailingSink;

impl MessageSink for FailingSink {
    fn push(&self, _msg: FlowMessage, _priority: Option<u32>) -> Result<(), QueueError> {
        Err(QueueError::Rejected {
            queue: "failing".into(),
            reason: "always".into(),
        })
    }

    fn target(&self) -> &str {
        "failing"
    }
}

#[test]
fn test_tee_duplicates_every_push() {
    let left = RecordingSink::new();
    let right = RecordingSink::new();
    let tee = Tee::new(vec![
        left.clone() as Arc<dyn MessageSink>,
        right.clone() as Arc<dyn MessageSink>,
    ])
    .expect("tee failed");

    let msg = data_msg();
    tee.push(msg.clone(), Some(7)).expect("push failed");

    assert_eq!(left.pushes(), vec![(msg.id(), Some(7))]);
    assert_eq!(right.pushes(), vec![(msg.id(), Some(7))]);
}

#[test]
fn test_tee_rejects_empty_fanout() {
    assert!(Tee::new(vec![]).is_err());
}

#[test]
fn test_tee_keeps_going_past_a_failed_branch() {
    let survivor = RecordingSink::new();
    let tee = Tee::new(vec![
        Arc::new(FailingSink) as Arc<dyn MessageSink>,
        survivor.clone(),
    ])
    .expect("tee failed");

    let msg = data_msg();
    let err = tee.push(msg.clone(), None).expect_err("fan-out must report");
    assert!(matches!(err, QueueError::FanOut { .. }));

    // the healthy branch got the message anyway
    assert_eq!(survivor.pushes(), vec![(msg.id(), None)]);
}

#[test]
fn test_zip_needs_at_least_two_faces() {
    let out = RecordingSink::new();
    assert!(ZipJoin::new(out, 1).is_err());
}

#[test]
fn test_zip_releases_once_per_message() {
    let out = RecordingSink::new();
    let zip = ZipJoin::new(out.clone(), 2).expect("zip failed");
    let faces = zip.faces();

    let msg = data_msg();
    faces[0].push(msg.clone(), Some(3)).expect("push failed");
    assert!(out.pushes().is_empty());

    faces[1].push(msg.clone(), Some(7)).expect("push failed");
    // released exactly once, carrying the max priority seen on any face
    assert_eq!(out.pushes(), vec![(msg.id(), Some(7))]);
}

#[test]
fn test_zip_is_face_order_independent() {
    let out = RecordingSink::new();
    let zip = ZipJoin::new(out.clone(), 3).expect("zip failed");
    let faces = zip.faces();

    let msg = data_msg();
    faces[2].push(msg.clone(), None).expect("push failed");
    faces[0].push(msg.clone(), Some(4)).expect("push failed");
    assert!(out.pushes().is_empty());
    faces[1].push(msg.clone(), None).expect("push failed");

    assert_eq!(out.pushes(), vec![(msg.id(), Some(4))]);
}

#[test]
fn test_zip_holds_distinct_messages_apart() {
    let out = RecordingSink::new();
    let zip = ZipJoin::new(out.clone(), 2).expect("zip failed");
    let faces = zip.faces();

    faces[0].push(data_msg(), None).expect("push failed");
    faces[1].push(data_msg(), None).expect("push failed");

    assert!(out.pushes().is_empty());
}
