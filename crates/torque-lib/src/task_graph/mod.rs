mod visitor;

use serde::Serialize;
pub use visitor::{
    CommandFactory, CommandProvider, Error as VisitorError, PackageGraphCommandProvider,
    TaskError, TaskErrorCause, TaskWarning, Visitor,
};

use crate::task_id::TaskId;

/// Output globs for a task, relative to its package directory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    /// The globs as they enter the hash: the captured log is always part of
    /// the artifact, and both lists are sorted so declaration order cannot
    /// change the fingerprint.
    pub fn hashable_outputs(&self, task_name: &str) -> TaskOutputs {
        let mut inclusions = self.inclusions.clone();
        inclusions.push(log_file_glob(task_name));
        inclusions.sort();

        let mut exclusions = self.exclusions.clone();
        exclusions.sort();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }
}

/// Where a task's captured log lives, relative to its package directory.
pub fn task_log_filename(task_name: &str) -> String {
    format!(".turbo/turbo-{task_name}.log")
}

fn log_file_glob(task_name: &str) -> String {
    task_log_filename(task_name)
}

/// How much of a task's output reaches the terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    Full,
    #[default]
    HashOnly,
    None,
    ErrorsOnly,
}

/// A task's resolved pipeline rule. Upstream task IDs are already concrete;
/// translating `dependsOn` shorthand into them is a configuration concern
/// that happens before the engine sees anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,
    pub env: Vec<String>,
    pub pass_through_env: Vec<String>,
    pub inputs: Vec<String>,
    pub output_logs: OutputLogsMode,
    pub task_dependencies: Vec<TaskId<'static>>,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            env: Vec::new(),
            pass_through_env: Vec::new(),
            inputs: Vec::new(),
            output_logs: OutputLogsMode::default(),
            task_dependencies: Vec::new(),
        }
    }
}

impl TaskDefinition {
    pub fn hashable_outputs(&self, task_id: &TaskId) -> TaskOutputs {
        self.outputs.hashable_outputs(task_id.task())
    }

    /// The canonical serialization of this rule used for the pristine
    /// pipeline in the global hash.
    pub fn pristine(&self) -> String {
        serde_json::to_string(self).expect("task definitions always serialize")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hashable_outputs_include_log_and_sort() {
        let outputs = TaskOutputs {
            inclusions: vec!["dist/**".to_string(), "build/**".to_string()],
            exclusions: vec!["dist/cache/**".to_string()],
        };
        let hashable = outputs.hashable_outputs("build");
        assert_eq!(
            hashable.inclusions,
            vec![".turbo/turbo-build.log", "build/**", "dist/**"]
        );
        assert_eq!(hashable.exclusions, vec!["dist/cache/**"]);
    }

    #[test]
    fn test_pristine_is_stable() {
        let definition = TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec![],
            },
            ..TaskDefinition::default()
        };
        assert_eq!(definition.pristine(), definition.clone().pristine());
        assert!(definition.pristine().contains("\"outputs\""));
    }
}
