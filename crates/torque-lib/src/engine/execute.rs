use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use torque_graph::Walker;
use tracing::debug;

use super::{Engine, TaskNode};
use crate::task_id::TaskId;

/// A unit of work handed to the visitor, paired with the callback the
/// visitor uses to report the task's result.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(_: mpsc::error::SendError<Message<VisitorData, VisitorResult>>) -> Self {
        ExecuteError::Visitor
    }
}

/// Returned by a visitor to stop any further scheduling. Tasks already
/// running are left to finish.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walks the task graph, sending each task to the visitor once all of
    /// its dependencies have succeeded, with at most `concurrency` tasks in
    /// flight (unbounded when `parallel` is set).
    ///
    /// Nodes that become ready together are dispatched in task-ID order, so
    /// the issue order for a given graph is reproducible.
    ///
    /// Error handling lives in the visitor; all the engine reacts to is the
    /// [`StopExecution`] sentinel, which cancels the walk.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::new(&self.task_graph).walk();
        let walker = Arc::new(Mutex::new(walker));

        let mut batch = Vec::new();
        while nodes.recv_many(&mut batch, usize::MAX).await > 0 {
            // recv_many drains whatever is ready; sorting the batch by node
            // weight gives simultaneously-ready tasks a deterministic
            // dispatch order.
            batch.sort_by(|(a, _), (b, _)| self.task_graph[*a].cmp(&self.task_graph[*b]));

            for (node_id, done) in batch.drain(..) {
                let visitor = visitor.clone();
                let sema = sema.clone();
                let walker = walker.clone();
                let this = self.clone();

                tasks.push(tokio::spawn(async move {
                    let TaskNode::Task(task_id) = this
                        .task_graph
                        .node_weight(node_id)
                        .expect("node id comes from the walked graph")
                    else {
                        // The root node is a synchronization point, not a
                        // task; nothing to visit.
                        if done.send(()).is_err() {
                            debug!("walker done callback receiver dropped before send");
                        }
                        return Ok(());
                    };

                    // Bounded concurrency unless the caller forced
                    // unbounded parallelism.
                    let _permit = match parallel {
                        false => Some(sema.acquire().await?),
                        true => None,
                    };

                    let (message, result) = Message::new(task_id.clone());
                    visitor.send(message).await?;

                    if let Err(StopExecution) = result.await.unwrap_or_else(|_| {
                        // A dropped callback counts as a completed task.
                        tracing::trace!("visitor dropped callback without sending a result");
                        Ok(())
                    }) {
                        if walker
                            .lock()
                            .expect("walker mutex poisoned")
                            .cancel()
                            .is_err()
                        {
                            debug!("unable to cancel graph walk");
                        }
                    }
                    if done.send(()).is_err() {
                        debug!("walker done callback receiver dropped before send");
                    }
                    Ok(())
                }));
            }
        }

        while let Some(res) = tasks.next().await {
            res.expect("task node panicked")?;
        }

        Ok(())
    }
}
