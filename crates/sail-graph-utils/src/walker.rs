use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// A node handed to the caller together with the channel used to mark it
/// finished.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

pub struct Start;
pub struct Walking;

/// Walks a DAG, emitting each node only once every node it depends on
/// (outgoing edges) has been marked finished by the caller.
///
/// The graph must not be modified after the walker is created; emitted node
/// ids would otherwise dangle. Petgraph node ids are `Copy + Eq`, so the
/// extra `Hash + Send + 'static` bounds cost callers nothing.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    emitted: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);

        // One single-shot broadcast channel per node; a node's task completes
        // the channel exactly once, and each dependent holds a subscription.
        let mut finish_txs = HashMap::new();
        let mut finish_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            let (tx, rx) = broadcast::channel::<()>(1);
            finish_txs.insert(node, tx);
            finish_rxs.insert(node, rx);
        }

        // Every node is emitted at most once, so a buffer of node-count never
        // blocks a sender. The buffer must be non-empty even for an empty
        // graph or the channel constructor panics.
        let (ready_tx, ready_rx) = mpsc::channel(std::cmp::max(finish_txs.len(), 1));

        let join_handles = FuturesUnordered::new();
        for node in graph.node_identifiers() {
            let finish_tx = finish_txs
                .remove(&node)
                .expect("every node has a finish sender");
            let deps_rx = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finish_rxs
                        .get(&dep)
                        .expect("every node has a finish receiver")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            join_handles.push(tokio::spawn(Self::node_future(
                node,
                deps_rx,
                finish_tx,
                ready_tx.clone(),
                cancel_rx.clone(),
            )));
        }

        debug_assert!(finish_txs.is_empty(), "all senders moved into node tasks");

        Self {
            marker: std::marker::PhantomData,
            cancel,
            emitted: Some(ready_rx),
            join_handles,
        }
    }

    /// Waits for the node's dependencies, emits it, waits for the caller's
    /// callback, then signals the node's own completion to dependents.
    async fn node_future(
        node: N,
        mut deps_rx: Vec<broadcast::Receiver<()>>,
        finish_tx: broadcast::Sender<()>,
        ready_tx: mpsc::Sender<WalkMessage<N>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let deps_done = join_all(deps_rx.iter_mut().map(|rx| rx.recv()));

        tokio::select! {
            // When cancellation and dependency completion are both ready,
            // prefer the cancellation so no extra node is emitted.
            biased;
            _ = cancel_rx.changed() => {
                // Either cancel() flipped the flag or the walker was dropped;
                // both mean this node must not run.
            }
            results = deps_done => {
                for res in results {
                    match res {
                        Ok(()) => (),
                        // The dependency's task exited without signalling
                        // completion. That only happens when a cancel races
                        // with the dependency, so treat it as a cancel.
                        Err(broadcast::error::RecvError::Closed) => return,
                        // A single-capacity channel cannot lag unless a node
                        // finished twice; carry on but record it.
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug_assert!(false, "node finished {n} extra times");
                            trace!("node finished {n} extra times");
                        }
                    }
                }

                let (callback_tx, callback_rx) = oneshot::channel::<()>();
                if ready_tx.send((node, callback_tx)).await.is_err() {
                    // The receiving end was dropped without cancelling; there
                    // is nobody left to process this node.
                    trace!("walk receiver dropped before the walk finished");
                    return;
                }
                if callback_rx.await.is_err() {
                    // Caller dropped the callback without signalling; treat
                    // the node as processed so the walk can drain.
                    trace!("node callback dropped without a finish signal");
                }
                // A send error here means no dependents are listening, which
                // is expected for terminal nodes.
                finish_tx.send(()).ok();
            }
        }
    }

    /// Starts the walk. The receiver yields nodes whose dependencies have all
    /// finished; the caller must complete each node's oneshot to unblock its
    /// dependents.
    pub fn walk(mut self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let emitted = self
            .emitted
            .take()
            .expect("walker can only start walking once");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel: self.cancel,
                emitted: None,
                join_handles: self.join_handles,
            },
            emitted,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already queued for emission are still
    /// delivered.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for every node task to wind down. Used after a cancel to make
    /// sure nothing is left running.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_dependency_order() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (walker, mut ready) = Walker::new(&g).walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let (mut walker, mut ready) = Walker::new(&g).walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            walker.cancel().unwrap();
            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);

        // Give the node tasks a chance to observe the cancel.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let Walker { join_handles, .. } = walker;
        for join_handle in join_handles {
            assert!(join_handle.is_finished());
        }
    }

    #[tokio::test]
    async fn test_unrelated_branches_proceed_independently() {
        // a -- b -- c
        //   \
        //    - d -- e
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        // Hold e's completion until b is done; c and b must still flow.
        let (walker, mut ready) = Walker::new(&g).walk();
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (b_done_tx, b_done_rx) = oneshot::channel::<()>();
        let mut b_done_tx = Some(b_done_tx);
        let mut b_done_rx = Some(b_done_rx);
        while let Some((index, done)) = ready.recv().await {
            if index == e {
                let gate = b_done_rx.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    gate.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                if index == b {
                    b_done_tx.take().unwrap().send(()).unwrap();
                }
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }
}
