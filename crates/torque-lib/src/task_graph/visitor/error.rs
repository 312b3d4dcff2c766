use std::fmt;

use thiserror::Error;

use crate::task_id::TaskId;

/// A task-level failure. Collected, never propagated as a run abort; the
/// run's exit code is aggregated from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    task_id: TaskId<'static>,
    cause: TaskErrorCause,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskErrorCause {
    #[error("unable to spawn child process: {msg}")]
    Spawn { msg: String },
    #[error("command exited ({exit_code})")]
    Exit { exit_code: i32 },
    #[error("unable to determine task hash: {msg}")]
    Hash { msg: String },
    #[error("unable to capture task output: {msg}")]
    Logs { msg: String },
    #[error("task was killed")]
    Killed,
}

impl TaskError {
    pub fn new(task_id: TaskId<'static>, cause: TaskErrorCause) -> Self {
        Self { task_id, cause }
    }

    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }

    /// The child's exit code, when the failure was a non-zero exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self.cause {
            TaskErrorCause::Exit { exit_code } => Some(exit_code),
            _ => None,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task_id, self.cause)
    }
}

/// A task-level condition worth surfacing without failing the run, e.g. a
/// failure demoted by `continue_on_error`.
#[derive(Debug, Clone)]
pub struct TaskWarning {
    task_id: TaskId<'static>,
    message: String,
}

impl TaskWarning {
    pub fn new(task_id: TaskId<'static>, message: String) -> Self {
        Self { task_id, message }
    }
}

impl fmt::Display for TaskWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task_id, self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_code_only_for_child_exits() {
        let exit = TaskError::new(
            TaskId::new("util", "build").into_owned(),
            TaskErrorCause::Exit { exit_code: 3 },
        );
        assert_eq!(exit.exit_code(), Some(3));

        let spawn = TaskError::new(
            TaskId::new("util", "build").into_owned(),
            TaskErrorCause::Spawn {
                msg: "no such file".to_string(),
            },
        );
        assert_eq!(spawn.exit_code(), None);
    }

    #[test]
    fn test_display_includes_task_id() {
        let err = TaskError::new(
            TaskId::new("util", "build").into_owned(),
            TaskErrorCause::Exit { exit_code: 1 },
        );
        assert_eq!(err.to_string(), "util#build: command exited (1)");
    }
}
