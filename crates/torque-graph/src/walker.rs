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
use tracing::log::trace;

/// Message emitted for each walked node: the node id and a callback the
/// consumer must fire once it is done processing the node. Dependents are
/// held back until the callback fires.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Walks a DAG, emitting a node only after every node it depends on
/// (outgoing edges) has been marked done.
///
/// The graph must not be modified once a walker has been built over it: the
/// walker captures node ids and edges at construction time.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

pub struct Start;
pub struct Walking;

// The bounds mirror what petgraph node ids already satisfy (Copy + Eq), so
// requiring Hash + Send + 'static on top costs callers nothing.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let mut txs = HashMap::new();
        let mut rxs = HashMap::new();
        for node in graph.node_identifiers() {
            // A node finishes at most once, so capacity 1 suffices.
            let (tx, rx) = broadcast::channel::<()>(1);
            txs.insert(node, tx);
            rxs.insert(node, rx);
        }
        // At most txs.len() nodes will ever be emitted, so sends never block.
        // The minimum of 1 keeps the channel constructor from panicking on an
        // empty graph.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(txs.len(), 1));
        let join_handles = FuturesUnordered::new();
        for node in graph.node_identifiers() {
            let tx = txs.remove(&node).expect("every node got a sender");
            let mut cancel_rx = cancel_rx.clone();
            let node_tx = node_tx.clone();
            let mut deps_rx = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    rxs.get(&dep)
                        .expect("every node got a receiver")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            join_handles.push(tokio::spawn(async move {
                let deps_fut = join_all(deps_rx.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // When a cancel races a node becoming ready, take the
                    // cancel.
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either cancel was set to true (its only transition)
                        // or the sender was dropped. Both mean exit.
                    }
                    results = deps_fut => {
                        for res in results {
                            match res {
                                Ok(()) => (),
                                // A dependency dropped its sender without
                                // finishing. Happens when a cancel races the
                                // dependency tasks, so treat it as a cancel.
                                Err(broadcast::error::RecvError::Closed) => {
                                    return;
                                }
                                // A dependency finished more than once, which
                                // the capacity-1 channel is supposed to rule
                                // out. The payload is (), so continuing is
                                // safe, but it is unexpected.
                                Err(broadcast::error::RecvError::Lagged(x)) => {
                                    debug_assert!(false, "node finished {x} extra times");
                                    trace!("node finished {x} extra times");
                                }
                            }
                        }

                        let (callback_tx, callback_rx) = oneshot::channel::<()>();
                        if node_tx.send((node, callback_tx)).await.is_err() {
                            // The consumer hung up without cancelling. There
                            // is no way to mark this node done, so behave as
                            // if cancelled.
                            trace!("walk consumer dropped before walk finished");
                            return;
                        }
                        if callback_rx.await.is_err() {
                            // Dropped callback counts as done; the consumer
                            // has nothing more to tell us.
                            trace!("done callback dropped without firing");
                        }
                        // A send error just means no dependents are
                        // listening.
                        tx.send(()).ok();
                    }
                }
            }));
        }

        debug_assert!(txs.is_empty(), "every sender moved into its node task");

        Self {
            cancel,
            node_events: Some(node_rx),
            join_handles,
            marker: std::marker::PhantomData,
        }
    }

    /// Starts the walk, returning the channel that yields nodes as they
    /// become ready. The caller owns firing each node's done callback.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            join_handles,
            ..
        } = self;
        let node_events = node_events
            .take()
            .expect("walk may only be started once");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                join_handles,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already queued for emission will
    /// still be delivered.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for all node tasks to wind down. Mostly useful after a cancel.
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
    async fn test_ordering() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (mut walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            // Cancel as soon as the first node arrives.
            walker.cancel().unwrap();

            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);
        let Walker { join_handles, .. } = walker;
        // Yield so the node tasks get a chance to observe the cancel.
        tokio::time::sleep(Duration::from_millis(1)).await;

        for join_handle in join_handles {
            assert!(join_handle.is_finished());
        }
    }

    #[tokio::test]
    async fn test_dependencies_block_dependents() {
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

        // Hold e's done callback until b has finished to pin a total order.
        let walker = Walker::new(&g);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (walker, mut node_emitter) = walker.walk();
        let (b_done, is_b_done) = oneshot::channel::<()>();
        let mut b_done = Some(b_done);
        let mut is_b_done = Some(is_b_done);
        while let Some((index, done)) = node_emitter.recv().await {
            if index == e {
                let is_b_done = is_b_done.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    is_b_done.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else if index == b {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                b_done.take().unwrap().send(()).unwrap();
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }
}
