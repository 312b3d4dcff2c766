use serde::Serialize;

/// The package manager a task's command runs through. Only what the
/// executor's argv construction needs; detecting which one a repo uses is a
/// discovery concern and happens upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    pub fn command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }

    /// The separator inserted between the task name and pass-through args,
    /// when the package manager needs one.
    pub fn arg_separator(&self, user_args: &[String]) -> Option<&'static str> {
        match self {
            PackageManager::Npm if !user_args.is_empty() => Some("--"),
            _ => None,
        }
    }

    pub fn specfile(&self) -> &'static str {
        "package.json"
    }

    pub fn lockfile(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Yarn => "yarn.lock",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_npm_needs_separator_for_user_args() {
        let args = vec!["--watch".to_string()];
        assert_eq!(PackageManager::Npm.arg_separator(&args), Some("--"));
        assert_eq!(PackageManager::Npm.arg_separator(&[]), None);
        assert_eq!(PackageManager::Pnpm.arg_separator(&args), None);
    }
}
