//! The run summary: per-task records collected as tasks finish, the footer
//! printed at the end of the run, and the machine-readable JSON document.

mod execution;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Local};
pub use execution::{
    ExecutionState, ExecutionSummary, ExecutionTracker, SummaryState, TaskExecutionSummary,
    TaskTracker,
};
use serde::Serialize;
use thiserror::Error;
use torque_cache::{CacheHitMetadata, CacheSource};
use torque_ui::ColorConfig;
use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};
use tracing::debug;

use crate::task_id::TaskId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to aggregate execution summary: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to serialize run summary: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write run summary: {0}")]
    Write(#[from] std::io::Error),
}

/// What the cache knew about a task, as recorded in its summary.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheSummary {
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    pub time_saved: u64,
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    #[default]
    Miss,
}

impl From<Option<CacheHitMetadata>> for TaskCacheSummary {
    fn from(value: Option<CacheHitMetadata>) -> Self {
        match value {
            Some(metadata) => TaskCacheSummary {
                local: metadata.source == CacheSource::Local,
                remote: metadata.source == CacheSource::Remote,
                status: CacheStatus::Hit,
                time_saved: metadata.time_saved,
            },
            None => TaskCacheSummary::default(),
        }
    }
}

/// Everything the run records about one task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub inputs: std::collections::BTreeMap<RelativeUnixPathBuf, String>,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub resolved_outputs: Vec<AnchoredSystemPathBuf>,
    pub env_vars: Vec<String>,
    pub framework: String,
    pub cache: TaskCacheSummary,
    pub execution: TaskExecutionSummary,
}

/// The parts of a task's summary known before it executes. The executor
/// completes it with the cache state, the execution record, and whatever
/// outputs materialized.
#[derive(Debug)]
pub struct TaskSummaryBase {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub inputs: std::collections::BTreeMap<RelativeUnixPathBuf, String>,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub env_vars: Vec<String>,
    pub framework: String,
}

impl TaskSummaryBase {
    pub fn into_summary(
        self,
        cache: TaskCacheSummary,
        execution: TaskExecutionSummary,
        resolved_outputs: Vec<AnchoredSystemPathBuf>,
    ) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id,
            task: self.task,
            package: self.package,
            hash: self.hash,
            inputs: self.inputs,
            command: self.command,
            outputs: self.outputs,
            excluded_outputs: self.excluded_outputs,
            log_file: self.log_file,
            dependencies: self.dependencies,
            dependents: self.dependents,
            resolved_outputs,
            env_vars: self.env_vars,
            framework: self.framework,
            cache,
            execution,
        }
    }
}

/// The single JSON document describing a run. Field names are stable.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub exit_code: i32,
    pub tasks: Vec<TaskSummary>,
}

/// Records task summaries as executors produce them. Each task ID is
/// recorded at most once; the scheduler visits each node once, so a
/// duplicate is a bug.
#[derive(Clone)]
pub struct TaskSummarySink {
    task_summaries: Arc<Mutex<HashMap<TaskId<'static>, TaskSummary>>>,
}

impl TaskSummarySink {
    pub fn record(&self, summary: TaskSummary) {
        let mut summaries = self
            .task_summaries
            .lock()
            .expect("task summary lock poisoned");
        let previous = summaries.insert(summary.task_id.clone(), summary);
        debug_assert!(
            previous.is_none(),
            "task recorded more than one summary: {}",
            previous.expect("just checked").task_id
        );
    }
}

/// Collects task summaries and execution events for the duration of a run.
pub struct RunTracker {
    started_at: DateTime<Local>,
    command: String,
    execution_tracker: ExecutionTracker,
    // The only write-shared structure besides the hash tracker; guarded by
    // one mutex, writes are single struct pushes.
    task_summaries: Arc<Mutex<HashMap<TaskId<'static>, TaskSummary>>>,
}

impl RunTracker {
    pub fn new(started_at: DateTime<Local>, command: String) -> Self {
        Self {
            started_at,
            command,
            execution_tracker: ExecutionTracker::new(),
            task_summaries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn track_task(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        self.execution_tracker.tracker(task_id)
    }

    /// A cloneable handle task executors use to record their summary.
    pub fn summary_sink(&self) -> TaskSummarySink {
        TaskSummarySink {
            task_summaries: self.task_summaries.clone(),
        }
    }

    /// Closes the run: prints the footer and, when requested, writes the
    /// summary document. Consumes the tracker, so it cannot be closed twice.
    pub async fn finish(
        self,
        exit_code: i32,
        color_config: ColorConfig,
        repo_root: &AbsoluteSystemPath,
        summarize: bool,
    ) -> Result<SummaryState, Error> {
        let RunTracker {
            started_at,
            command,
            execution_tracker,
            task_summaries,
        } = self;
        debug!("finishing run of `{command}`");

        let state = execution_tracker.finish().await?;

        let mut tasks: Vec<TaskSummary> = Arc::into_inner(task_summaries)
            .expect("all task summary holders dropped by end of run")
            .into_inner()
            .expect("task summary lock poisoned")
            .into_values()
            .collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let failed_tasks: Vec<String> = tasks
            .iter()
            .filter(|task| matches!(task.execution.state, ExecutionState::BuildFailed { .. }))
            .map(|task| task.task_id.to_string())
            .collect();

        let summary = ExecutionSummary {
            state,
            start_time: started_at,
            end_time: Local::now(),
        };
        summary.print(color_config, failed_tasks);

        if summarize {
            let run_summary = RunSummary { exit_code, tasks };
            let path = repo_root.join_components(&[
                ".turbo",
                "runs",
                &format!("{}.json", started_at.timestamp_millis()),
            ]);
            path.ensure_dir()?;
            path.create_with_contents(serde_json::to_string_pretty(&run_summary)?)?;
        }

        Ok(state)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use chrono::Local;
    use tempfile::tempdir;

    use super::*;

    fn task_summary(
        tracker_outcome: TaskExecutionSummary,
        cache: TaskCacheSummary,
    ) -> TaskSummary {
        TaskSummary {
            task_id: TaskId::new("util", "build").into_owned(),
            task: "build".to_string(),
            package: "util".to_string(),
            hash: "1234567890abcdef".to_string(),
            inputs: Default::default(),
            command: "echo build".to_string(),
            outputs: vec!["dist/**".to_string()],
            excluded_outputs: vec![],
            log_file: "packages/util/.turbo/turbo-build.log".to_string(),
            dependencies: vec![],
            dependents: vec![],
            resolved_outputs: vec![],
            env_vars: vec![],
            framework: String::new(),
            cache,
            execution: tracker_outcome,
        }
    }

    #[tokio::test]
    async fn test_summary_document_shape() -> Result<()> {
        let dir = tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;

        let run_tracker = RunTracker::new(Local::now(), "turbo run build".to_string());
        let tracker = run_tracker
            .track_task(TaskId::new("util", "build").into_owned())
            .start()
            .await;
        let execution = tracker.build_succeeded(0).await;
        run_tracker
            .summary_sink()
            .record(task_summary(execution, TaskCacheSummary::default()));

        let state = run_tracker
            .finish(0, ColorConfig::new(true), repo_root, true)
            .await?;
        assert_eq!(state.attempted, 1);
        assert_eq!(state.success, 1);

        let runs_dir = repo_root.join_components(&[".turbo", "runs"]);
        let entries: Vec<_> = std::fs::read_dir(runs_dir.as_std_path())?.collect();
        assert_eq!(entries.len(), 1);
        let contents = std::fs::read_to_string(entries[0].as_ref().unwrap().path())?;
        let doc: serde_json::Value = serde_json::from_str(&contents)?;
        assert_eq!(doc["exitCode"], 0);
        assert_eq!(doc["tasks"][0]["taskId"], "util#build");
        assert_eq!(doc["tasks"][0]["cache"]["status"], "MISS");
        assert_eq!(doc["tasks"][0]["execution"]["state"]["status"], "built");
        Ok(())
    }

    #[test]
    fn test_cache_summary_from_hit() {
        let summary = TaskCacheSummary::from(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: 90,
        }));
        assert!(summary.local);
        assert!(!summary.remote);
        assert_eq!(summary.status, CacheStatus::Hit);
        assert_eq!(summary.time_saved, 90);
    }
}
