use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::sync::oneshot;
use torque_process::{ChildExit, Command, ProcessManager, STOP_TIMEOUT};
use torque_ui::{ColorConfig, PrefixedUI};
use tracing::warn;

use super::{StdWriter, TaskError, TaskErrorCause, TaskWarning};
use crate::{
    engine::StopExecution,
    run::{
        cache::TaskCache,
        summary::{TaskSummaryBase, TaskSummarySink, TaskTracker},
    },
    task_hash::TaskHashTracker,
    task_id::TaskId,
};

/// Everything one task needs to execute, owned so the whole thing can move
/// onto its own tokio task.
pub(crate) struct ExecContext {
    pub task_id: TaskId<'static>,
    pub cmd: Option<Command>,
    pub task_cache: TaskCache,
    pub hash_tracker: TaskHashTracker,
    pub manager: ProcessManager,
    pub errors: Arc<Mutex<Vec<TaskError>>>,
    pub warnings: Arc<Mutex<Vec<TaskWarning>>>,
    pub continue_on_error: bool,
    pub pretty_prefix: String,
    pub color_config: ColorConfig,
    pub base: TaskSummaryBase,
    /// Failed tasks and their descendants; a failure here makes downstream
    /// tasks unreachable.
    pub unreachable: Arc<Mutex<HashSet<TaskId<'static>>>>,
}

enum ExecOutcome {
    // All clear, the task ran to completion.
    Success,
    // The task failed; the run may continue.
    Task(TaskErrorCause),
    // The run is shutting down around us.
    Shutdown,
}

impl ExecContext {
    /// Runs the fixed per-task sequence: cache probe, skip-or-restore,
    /// execute, store, record. Exactly one summary is recorded per call,
    /// and the callback always fires before this returns.
    pub(crate) async fn execute(
        mut self,
        tracker: TaskTracker<()>,
        callback: oneshot::Sender<Result<(), StopExecution>>,
        sink: TaskSummarySink,
    ) {
        let mut prefixed_ui = self.prefixed_ui();

        // Probe the cache up front so the summary records the state even
        // for tasks that end up skipped.
        let cache_status = match self.task_cache.exists().await {
            Ok(status) => status,
            Err(err) => {
                warn!("failed to check cache for {}: {err}", self.task_id);
                None
            }
        };

        // No command means there is nothing to do.
        let Some(cmd) = self.cmd.take() else {
            let execution = tracker.skipped();
            sink.record(self.base.into_summary(cache_status.into(), execution, Vec::new()));
            callback.send(Ok(())).ok();
            return;
        };

        let tracker = tracker.start().await;

        match self.task_cache.restore_outputs(&mut prefixed_ui).await {
            Ok(Some(hit)) => {
                let resolved = self.task_cache.expanded_outputs().to_vec();
                self.hash_tracker
                    .insert_expanded_outputs(self.task_id.clone(), resolved.clone());
                let execution = tracker.cached().await;
                sink.record(self.base.into_summary(Some(hit).into(), execution, resolved));
                callback.send(Ok(())).ok();
                return;
            }
            Ok(None) => (),
            // Read trouble is a miss, not a failure.
            Err(err) => warn!("failed to restore outputs for {}: {err}", self.task_id),
        }

        let started = Instant::now();
        let outcome = self.run_command(cmd, &mut prefixed_ui, started).await;

        match outcome {
            ExecOutcome::Success => {
                let resolved = self.task_cache.expanded_outputs().to_vec();
                self.hash_tracker
                    .insert_expanded_outputs(self.task_id.clone(), resolved.clone());
                let execution = tracker.build_succeeded(0).await;
                sink.record(self.base.into_summary(cache_status.into(), execution, resolved));
                callback.send(Ok(())).ok();
            }
            ExecOutcome::Task(cause) => {
                let exit_code = match &cause {
                    TaskErrorCause::Exit { exit_code } => *exit_code,
                    _ => 1,
                };
                let execution = tracker.build_failed(exit_code, &cause).await;
                sink.record(self.base.into_summary(cache_status.into(), execution, Vec::new()));
                self.errors
                    .lock()
                    .expect("error collector lock poisoned")
                    .push(TaskError::new(self.task_id.clone(), cause.clone()));
                self.unreachable
                    .lock()
                    .expect("unreachable set lock poisoned")
                    .insert(self.task_id.clone());

                if self.continue_on_error {
                    self.warnings
                        .lock()
                        .expect("warning collector lock poisoned")
                        .push(TaskWarning::new(
                            self.task_id.clone(),
                            format!("command finished with error, but continuing... ({cause})"),
                        ));
                    prefixed_ui.warn("command finished with error, but continuing...");
                    callback.send(Ok(())).ok();
                } else {
                    prefixed_ui.error(format!("command finished with error: {cause}"));
                    // Failing the run: stop siblings that haven't started
                    // and tell the engine to stop scheduling.
                    self.manager.stop().await;
                    callback.send(Err(StopExecution)).ok();
                }
            }
            ExecOutcome::Shutdown => {
                let execution = tracker.cancel();
                sink.record(self.base.into_summary(cache_status.into(), execution, Vec::new()));
                // The run is already shutting down; not a task failure.
                callback.send(Ok(())).ok();
            }
        }
    }

    fn prefixed_ui(&self) -> PrefixedUI<StdWriter> {
        PrefixedUI::new(
            self.color_config,
            StdWriter::Out(std::io::stdout()),
            StdWriter::Err(std::io::stderr()),
        )
        .with_output_prefix(self.pretty_prefix.clone())
        .with_warn_prefix(self.pretty_prefix.clone())
        .with_error_prefix(format!("{}ERROR: ", self.pretty_prefix))
    }

    async fn run_command(
        &mut self,
        cmd: Command,
        prefixed_ui: &mut PrefixedUI<StdWriter>,
        started: Instant,
    ) -> ExecOutcome {
        let mut child = match self.manager.spawn(cmd, STOP_TIMEOUT) {
            Some(Ok(child)) => child,
            Some(Err(err)) => {
                return ExecOutcome::Task(TaskErrorCause::Spawn {
                    msg: err.to_string(),
                })
            }
            // The manager is closing; the spawn refusal is not a failure.
            None => return ExecOutcome::Shutdown,
        };

        let log_writer = match self.task_cache.output_writer(prefixed_ui.output_prefixed_writer())
        {
            Ok(writer) => writer,
            // A broken output writer fails this task; the run finalizes
            // normally around it.
            Err(err) => {
                return ExecOutcome::Task(TaskErrorCause::Logs {
                    msg: err.to_string(),
                })
            }
        };

        let exit = match child.wait_with_piped_outputs(log_writer).await {
            Ok(exit) => exit,
            Err(err) => {
                return ExecOutcome::Task(TaskErrorCause::Logs {
                    msg: err.to_string(),
                })
            }
        };

        match exit {
            Some(ChildExit::Finished(Some(0))) => {
                let duration = started.elapsed().as_millis() as u64;
                // Only successful exits are stored; a store failure costs a
                // future cache hit, not this task.
                if let Err(err) = self.task_cache.save_outputs(duration).await {
                    warn!("error caching output for {}: {err}", self.task_id);
                }
                ExecOutcome::Success
            }
            Some(ChildExit::Finished(Some(exit_code))) => {
                if let Err(err) = self.task_cache.on_error(prefixed_ui) {
                    warn!("failed to replay logs for {}: {err}", self.task_id);
                }
                ExecOutcome::Task(TaskErrorCause::Exit { exit_code })
            }
            Some(ChildExit::Interrupted) | Some(ChildExit::Killed) => ExecOutcome::Shutdown,
            Some(ChildExit::KilledExternal)
            | Some(ChildExit::Finished(None))
            | Some(ChildExit::Failed)
            | None => ExecOutcome::Task(TaskErrorCause::Killed),
        }
    }
}
