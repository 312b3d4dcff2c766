use std::{borrow::Cow, fmt};

use serde::Serialize;

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

/// A task identifier: the owning package plus the task name, written
/// `package#task`. Tasks on the repo root use the reserved `//` package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

impl TaskId<'static> {
    /// Parses a `package#task` string. Returns `None` when no delimiter is
    /// present or either side is empty.
    pub fn parse(input: &str) -> Option<TaskId<'static>> {
        let (package, task) = input.split_once(TASK_DELIMITER)?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(TaskId::new(package, task).into_owned())
    }
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        // Guard against a task name that is itself already package-scoped.
        let task = task
            .rsplit_once(TASK_DELIMITER)
            .map(|(_, task)| task)
            .unwrap_or(task);
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn in_workspace(&self, workspace: &str) -> bool {
        self.package == workspace
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("app", "build", "app#build" ; "package task")]
    #[test_case("//", "build", "//#build" ; "root task")]
    fn test_display(package: &str, task: &str, expected: &str) {
        assert_eq!(TaskId::new(package, task).to_string(), expected);
    }

    #[test]
    fn test_parse_round_trip() {
        let id = TaskId::parse("util#build").unwrap();
        assert_eq!(id.package(), "util");
        assert_eq!(id.task(), "build");
        assert_eq!(TaskId::parse("build"), None);
    }

    #[test]
    fn test_new_strips_existing_package() {
        let id = TaskId::new("app", "app#build");
        assert_eq!(id.task(), "build");
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut ids = vec![
            TaskId::new("web", "build"),
            TaskId::new("app", "lint"),
            TaskId::new("app", "build"),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["app#build", "app#lint", "web#build"]
        );
    }
}
