#![deny(clippy::all)]

//! Child process supervision.
//!
//! Every command the run starts goes through a single [`ProcessManager`],
//! which owns the set of live children. Shutting the manager down forwards a
//! signal to every child and flips the manager into a closing state in which
//! further spawns are refused, so a cancelled run cannot leak orphans.

mod child;
mod command;

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;
use futures::Future;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// How long a child gets to react to SIGINT before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

/// Owns every child process in the run. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a child for the given command and registers it with the
    /// manager.
    ///
    /// Returns `None` when the manager is already closing: the caller must
    /// treat that as "the run is shutting down", not as a task failure.
    pub fn spawn(&self, command: Command, stop_timeout: Duration) -> Option<io::Result<Child>> {
        let mut lock = self.state.lock().expect("process manager lock poisoned");
        if lock.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(stop_timeout));
        if let Ok(child) = &child {
            lock.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every live child (SIGINT, then kill after the grace period) and
    /// refuses new spawns from this point on.
    pub async fn stop(&self) {
        self.close(|mut child| async move { child.stop().await })
            .await
    }

    /// Waits for every live child to finish on its own, refusing new spawns.
    /// Unlike [`ProcessManager::stop`] no signal is sent.
    pub async fn wait(&self) {
        self.close(|mut child| async move { child.wait().await })
            .await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C + Send + Copy + 'static,
        C: Future<Output = Option<ChildExit>> + Send + 'static,
    {
        let mut set = JoinSet::new();

        {
            let mut lock = self.state.lock().expect("process manager lock poisoned");
            lock.is_closing = true;
            for child in lock.children.iter() {
                let child = child.clone();
                set.spawn(async move { callback(child).await });
            }
        }

        debug!("waiting for {} processes to exit", set.len());

        while let Some(out) = set.join_next().await {
            trace!("process exited: {:?}", out);
        }

        {
            let mut lock = self.state.lock().expect("process manager lock poisoned");
            lock.children.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sleep_cmd() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.args(["1"]);
        cmd
    }

    #[tokio::test]
    async fn test_basic() {
        let manager = ProcessManager::new();
        manager.spawn(sleep_cmd(), STOP_TIMEOUT).unwrap().unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_multiple() {
        let manager = ProcessManager::new();

        manager.spawn(sleep_cmd(), STOP_TIMEOUT).unwrap().unwrap();
        manager.spawn(sleep_cmd(), STOP_TIMEOUT).unwrap().unwrap();
        manager.spawn(sleep_cmd(), STOP_TIMEOUT).unwrap().unwrap();

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_spawns() {
        let manager = ProcessManager::new();
        manager.spawn(sleep_cmd(), STOP_TIMEOUT).unwrap().unwrap();
        manager.stop().await;

        assert!(manager.spawn(sleep_cmd(), STOP_TIMEOUT).is_none());
    }

    #[tokio::test]
    async fn test_stop_interrupts_children() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(
                {
                    let mut cmd = Command::new("sleep");
                    cmd.args(["10"]);
                    cmd
                },
                Duration::from_millis(200),
            )
            .unwrap()
            .unwrap();

        manager.stop().await;

        let exit = child.wait().await;
        assert!(
            matches!(exit, Some(ChildExit::Interrupted) | Some(ChildExit::Killed)),
            "{exit:?}"
        );
    }

    #[tokio::test]
    async fn test_wait_lets_children_finish() {
        let manager = ProcessManager::new();
        let mut child = manager
            .spawn(
                {
                    let mut cmd = Command::new("sh");
                    cmd.args(["-c", "exit 0"]);
                    cmd
                },
                STOP_TIMEOUT,
            )
            .unwrap()
            .unwrap();

        manager.wait().await;

        let exit = child.wait().await;
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
    }
}
