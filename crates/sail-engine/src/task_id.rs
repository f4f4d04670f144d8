//! Task naming.
//!
//! A [`TaskId`] is the pair (package, task) rendered as `pkg#task`; it is the
//! stable string identity used as a cache-key component. A [`TaskName`] is a
//! raw selector as written in configuration: a bare task name, a
//! package-qualified `pkg#task`, or a topological `^task`.

use std::fmt;

pub const TASK_DELIMITER: char = '#';
pub const TOPOLOGICAL_PREFIX: char = '^';

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId {
    package: String,
    task: String,
}

impl TaskId {
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
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
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.package, TASK_DELIMITER, self.task)
    }
}

/// A task selector as written in `dependsOn` or on the command line.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `^task`: a dependency on the task in each workspace dependency
    /// package.
    pub fn is_topological(&self) -> bool {
        self.0.starts_with(TOPOLOGICAL_PREFIX)
    }

    /// The task name with any `^` marker removed.
    pub fn strip_topological(&self) -> TaskName {
        TaskName(
            self.0
                .strip_prefix(TOPOLOGICAL_PREFIX)
                .unwrap_or(&self.0)
                .to_owned(),
        )
    }

    /// `pkg#task` resolves to a concrete id without a package context.
    pub fn task_id(&self) -> Option<TaskId> {
        let (package, task) = self.0.split_once(TASK_DELIMITER)?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(TaskId::new(package, task))
    }

    /// The task portion: everything after `#`, or the whole selector.
    pub fn task(&self) -> &str {
        self.0
            .split_once(TASK_DELIMITER)
            .map(|(_, task)| task)
            .unwrap_or(&self.0)
    }

    /// Resolves this selector within the given package.
    pub fn resolve_in(&self, package: &str) -> TaskId {
        self.task_id()
            .unwrap_or_else(|| TaskId::new(package, self.task()))
    }
}

impl From<&str> for TaskName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::new("alpha", "compile").to_string(), "alpha#compile");
    }

    #[test_case("compile", false ; "bare_name")]
    #[test_case("^compile", true ; "topological")]
    fn test_topological_marker(raw: &str, expected: bool) {
        assert_eq!(TaskName::from(raw).is_topological(), expected);
    }

    #[test]
    fn test_package_qualified_name() {
        let name = TaskName::from("lib#compile");
        assert_eq!(name.task_id(), Some(TaskId::new("lib", "compile")));
        assert_eq!(name.task(), "compile");
    }

    #[test]
    fn test_resolve_in_package() {
        assert_eq!(
            TaskName::from("compile").resolve_in("alpha"),
            TaskId::new("alpha", "compile")
        );
        // An explicit package wins over the context package.
        assert_eq!(
            TaskName::from("lib#compile").resolve_in("alpha"),
            TaskId::new("lib", "compile")
        );
    }

    #[test]
    fn test_strip_topological() {
        assert_eq!(
            TaskName::from("^compile").strip_topological(),
            TaskName::from("compile")
        );
    }
}
