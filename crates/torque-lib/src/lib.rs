#![deny(clippy::all)]

//! The task execution engine for a monorepo task runner.
//!
//! Given an already-discovered package set and a resolved pipeline, the
//! engine computes content-addressed fingerprints per task, gates each task
//! on a local (and optionally remote) cache, and runs misses under a process
//! supervisor with DAG-ordered, concurrency-bounded scheduling.
//!
//! The front half of the product — flag parsing, workspace discovery,
//! pipeline file loading, remote transports — lives upstream and hands its
//! results in via [`Run`], [`RunSpec`], [`WorkspaceCatalog`], and
//! [`Pipeline`].

mod engine;
mod globwalk;
mod opts;
mod package_manager;
mod run;
mod signal;
mod task_graph;
mod task_hash;
mod task_id;
mod workspace_catalog;

pub use engine::{Building, BuilderError, Built, Engine, ExecutionOptions, StopExecution, TaskNode};
pub use opts::{Opts, ResolvedLogPrefix, RunCacheOpts, RunOpts};
pub use package_manager::PackageManager;
pub use run::{
    summary::{RunSummary, RunTracker, SummaryState, TaskSummary},
    Error, Pipeline, Run, RunCache, RunSpec, TaskCache,
};
pub use signal::{get_signal, SignalHandler, SignalSubscriber};
pub use task_graph::{
    CommandFactory, CommandProvider, OutputLogsMode, PackageGraphCommandProvider, TaskDefinition,
    TaskError, TaskErrorCause, TaskOutputs, TaskWarning, Visitor,
};
pub use task_hash::{PackageInputsHashes, TaskHashTracker, TaskHasher};
pub use task_id::{TaskId, ROOT_PKG_NAME, TASK_DELIMITER};
pub use workspace_catalog::{PackageName, WorkspaceCatalog, WorkspaceInfo};
