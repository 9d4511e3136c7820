use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use tracing::warn;
use crate::errors::QueueError;
use crate::message::FlowMessage;
use crate::queue::{DEFAULT_PRIORITY, MessageSink};

/// Drains one message at a time out of a [`MemorySingleQueue`].
#[async_trait]
pub trait QueueWorker: Send + Sync {
    async fn run(&self, msg: FlowMessage);
}

/// Drains whole batches out of a [`MemoryBatchQueue`].
#[async_trait]
pub trait BatchWorker: Send + Sync {
    async fn run(&self, batch: Vec<FlowMessage>);
}

struct Entry<T> {
    priority: u32,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority first, ties broken by arrival order
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RunnerState<T> {
    heap: BinaryHeap<Entry<T>>,
    running: usize,
    next_seq: u64,
}

impl<T> RunnerState<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            running: 0,
            next_seq: 0,
        }
    }

    fn enqueue(&mut self, priority: u32, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq,
            payload,
        });
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared heap + worker-slot accounting.  `schedule` enqueues a payload and,
/// when a concurrency slot is free, spawns a drainer task that keeps pulling
/// the highest-priority entry until the heap is empty.
struct Runner<T: Send + 'static> {
    concurrency: usize,
    state: Mutex<RunnerState<T>>,
}

impl<T: Send + 'static> Runner<T> {
    fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            concurrency: concurrency.max(1),
            state: Mutex::new(RunnerState::new()),
        })
    }

    fn schedule<F, Fut>(self: &Arc<Self>, priority: u32, payload: T, work: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let start_drainer = {
            let mut state = lock_unpoisoned(&self.state);
            state.enqueue(priority, payload);
            if state.running < self.concurrency {
                state.running += 1;
                true
            } else {
                false
            }
        };
        if start_drainer {
            let runner = self.clone();
            tokio::spawn(async move {
                loop {
                    let payload = {
                        let mut state = lock_unpoisoned(&runner.state);
                        match state.heap.pop() {
                            Some(entry) => entry.payload,
                            None => {
                                state.running -= 1;
                                return;
                            }
                        }
                    };
                    work(payload).await;
                }
            });
        }
    }

}

/// Priority-ordered task runner with bounded concurrency.
///
/// `push` enqueues and returns immediately; up to `concurrency` drainer tasks
/// pull the highest-priority entry and run the worker on it.  Backpressure is
/// only the unbounded in-memory growth of the heap.
pub struct MemorySingleQueue {
    name: String,
    worker: Arc<dyn QueueWorker>,
    runner: Arc<Runner<FlowMessage>>,
}

impl MemorySingleQueue {
    pub fn new(worker: Arc<dyn QueueWorker>, concurrency: usize, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            worker,
            runner: Runner::new(concurrency),
        })
    }
}

impl MessageSink for MemorySingleQueue {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError> {
        let worker = self.worker.clone();
        self.runner
            .schedule(priority.unwrap_or(DEFAULT_PRIORITY), msg, move |msg| {
                let worker = worker.clone();
                async move { worker.run(msg).await }
            });
        Ok(())
    }

    fn target(&self) -> &str {
        &self.name
    }
}

struct BatchState {
    pending: Vec<FlowMessage>,
    // bumped on every flush so a stale timeout task recognizes it has
    // nothing left to do
    generation: u64,
}

struct BatchInner {
    name: String,
    max_size: usize,
    timeout: Duration,
    worker: Arc<dyn BatchWorker>,
    batch: Mutex<BatchState>,
    runner: Arc<Runner<Vec<FlowMessage>>>,
}

impl BatchInner {
    /// Move the pending batch into the runner heap.  No-op when the pending
    /// buffer is already empty (e.g. flushed by size just before the timer).
    fn flush(self: &Arc<Self>, priority: u32) {
        let batch = {
            let mut guard = lock_unpoisoned(&self.batch);
            if guard.pending.is_empty() {
                return;
            }
            guard.generation += 1;
            std::mem::take(&mut guard.pending)
        };
        let worker = self.worker.clone();
        self.runner.schedule(priority, batch, move |batch| {
            let worker = worker.clone();
            async move { worker.run(batch).await }
        });
    }
}

enum PushAction {
    FlushNow,
    ArmTimer(u64),
    Nothing,
}

/// Size/time batching variant of the queue.
///
/// Pushed messages accumulate until either `max_size` are pending or
/// `timeout` has elapsed since the first item of the current batch arrived.
/// The whole batch is then scheduled as one task at the priority of the
/// triggering push.
pub struct MemoryBatchQueue {
    inner: Arc<BatchInner>,
}

impl MemoryBatchQueue {
    pub fn new(
        worker: Arc<dyn BatchWorker>,
        concurrency: usize,
        max_size: usize,
        timeout: Duration,
        name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(BatchInner {
                name: name.to_string(),
                max_size: max_size.max(1),
                timeout,
                worker,
                batch: Mutex::new(BatchState {
                    pending: Vec::new(),
                    generation: 0,
                }),
                runner: Runner::new(concurrency),
            }),
        })
    }
}

impl MessageSink for MemoryBatchQueue {
    fn push(&self, msg: FlowMessage, priority: Option<u32>) -> Result<(), QueueError> {
        let priority = priority.unwrap_or(DEFAULT_PRIORITY);
        let action = {
            let mut guard = lock_unpoisoned(&self.inner.batch);
            guard.pending.push(msg);
            if guard.pending.len() >= self.inner.max_size {
                PushAction::FlushNow
            } else if guard.pending.len() == 1 {
                PushAction::ArmTimer(guard.generation)
            } else {
                PushAction::Nothing
            }
        };
        match action {
            PushAction::FlushNow => self.inner.flush(priority),
            PushAction::ArmTimer(generation) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(inner.timeout).await;
                    let stale = lock_unpoisoned(&inner.batch).generation != generation;
                    if !stale {
                        inner.flush(priority);
                    }
                });
            }
            PushAction::Nothing => {}
        }
        Ok(())
    }

    fn target(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for MemoryBatchQueue {
    fn drop(&mut self) {
        let pending = lock_unpoisoned(&self.inner.batch).pending.len();
        if pending > 0 {
            warn!(queue = %self.inner.name, pending, "batch queue dropped with pending messages");
        }
    }
}
