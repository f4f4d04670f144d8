//! The scheduler: drives the sealed graph with bounded concurrency.
//!
//! Ready tasks stream out of the dependency-ordered walker into a weighted
//! priority queue; heavier tasks dispatch first so long critical paths start
//! early. The visitor on the other end of the channel performs the actual
//! leaf lifecycle and answers each message's callback; answering with
//! [`StopExecution`] cancels the remaining queue while in-flight tasks
//! finish.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    time::Instant,
};

use futures::{stream::FuturesUnordered, StreamExt};
use sail_graph_utils::Walker;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::trace;

use crate::{Built, Engine, TaskId, TaskNode};

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("the task visitor exited before the walk finished")]
    VisitorDropped,
    #[error("scheduler task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Returned through a message callback to cancel the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopExecution;

/// One schedulable task handed to the visitor. The callback must be answered
/// once the task has a terminal status; dependents are unblocked only then.
#[derive(Debug)]
pub struct Message {
    pub task_id: TaskId,
    pub callback: oneshot::Sender<Result<(), StopExecution>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

/// A ready task waiting for a dispatch slot.
struct Queued {
    weight: u64,
    seq: u64,
    task_id: TaskId,
    done: oneshot::Sender<()>,
    queued_at: Instant,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}
impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: heavier first, then FIFO among equal weights.
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// `Stop` and `VisitorGone` carry the walker's completion callback unsent:
/// the engine cancels the walk first, then releases dependents, so nothing
/// new is emitted in between.
enum DispatchOutcome {
    Completed,
    Stop(oneshot::Sender<()>),
    VisitorGone(oneshot::Sender<()>),
}

impl Engine<Built> {
    /// Executes the graph, streaming ready tasks to `visitor`.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message>,
    ) -> Result<(), ExecuteError> {
        let (mut walker, mut ready) = Walker::new(self.task_graph()).walk();
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut heap: BinaryHeap<Queued> = BinaryHeap::new();
        let mut running = FuturesUnordered::new();
        let mut walk_open = true;
        let mut cancelled = false;
        let mut visitor_gone = false;
        let mut seq = 0u64;

        loop {
            // Fill every free slot with the heaviest queued task.
            while heap.peek().is_some() {
                match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let queued = heap.pop().expect("peeked entry exists");
                        trace!(
                            target: "sail::task::queue",
                            task = %queued.task_id,
                            weight = queued.weight,
                            queued_ms = queued.queued_at.elapsed().as_millis() as u64,
                            "dispatching"
                        );
                        running.push(Self::dispatch(
                            queued,
                            permit,
                            visitor.clone(),
                            cancelled || visitor_gone,
                        ));
                    }
                    Err(_) => break,
                }
            }

            tokio::select! {
                message = ready.recv(), if walk_open => {
                    match message {
                        Some(emitted) => {
                            self.enqueue(emitted, &mut heap, &mut seq);
                            // Let the rest of the ready burst land so the
                            // weight ordering sees the whole set.
                            tokio::task::yield_now().await;
                            while let Ok(emitted) = ready.try_recv() {
                                self.enqueue(emitted, &mut heap, &mut seq);
                            }
                        }
                        None => walk_open = false,
                    }
                }
                Some(outcome) = running.next() => {
                    match outcome {
                        DispatchOutcome::Completed => {}
                        DispatchOutcome::Stop(done) => {
                            if !cancelled {
                                cancelled = true;
                                walker.cancel().ok();
                            }
                            done.send(()).ok();
                        }
                        DispatchOutcome::VisitorGone(done) => {
                            visitor_gone = true;
                            if !cancelled {
                                cancelled = true;
                                walker.cancel().ok();
                            }
                            done.send(()).ok();
                        }
                    }
                }
                else => break,
            }
        }

        walker.wait().await?;
        if visitor_gone {
            return Err(ExecuteError::VisitorDropped);
        }
        Ok(())
    }

    fn enqueue(
        &self,
        (node, done): sail_graph_utils::WalkMessage<petgraph::graph::NodeIndex>,
        heap: &mut BinaryHeap<Queued>,
        seq: &mut u64,
    ) {
        match &self.task_graph()[node] {
            // The synthetic root completes immediately.
            TaskNode::Root => {
                done.send(()).ok();
            }
            TaskNode::Task(task_id) => {
                trace!(target: "sail::task::queue", task = %task_id, "queued");
                heap.push(Queued {
                    weight: self.weight(task_id),
                    seq: *seq,
                    task_id: task_id.clone(),
                    done,
                    queued_at: Instant::now(),
                });
                *seq += 1;
            }
        }
    }

    async fn dispatch(
        queued: Queued,
        permit: tokio::sync::OwnedSemaphorePermit,
        visitor: mpsc::Sender<Message>,
        skip: bool,
    ) -> DispatchOutcome {
        let Queued { task_id, done, .. } = queued;

        // Cancelled tasks never reach the visitor; dependents are unblocked
        // so the walk can drain.
        if skip {
            done.send(()).ok();
            return DispatchOutcome::Completed;
        }

        let (callback, response) = oneshot::channel();
        if visitor.send(Message { task_id, callback }).await.is_err() {
            return DispatchOutcome::VisitorGone(done);
        }
        let outcome = match response.await {
            Ok(Ok(())) => DispatchOutcome::Completed,
            Ok(Err(StopExecution)) => return DispatchOutcome::Stop(done),
            Err(_) => return DispatchOutcome::VisitorGone(done),
        };
        // The task has a terminal status recorded by the visitor; only now
        // may dependents observe it.
        done.send(()).ok();
        drop(permit);
        outcome
    }
}
