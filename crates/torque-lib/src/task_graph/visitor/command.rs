use torque_env::EnvironmentVariableMap;
use torque_process::Command;
use torquepath::AbsoluteSystemPath;

use super::Error;
use crate::{
    package_manager::PackageManager,
    task_id::TaskId,
    workspace_catalog::{PackageName, WorkspaceCatalog},
};

/// Something that can turn a task id into a runnable command. Returning
/// `Ok(None)` means the provider knows the task and it has nothing to run.
pub trait CommandProvider {
    fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error>;
}

impl<T: CommandProvider + ?Sized> CommandProvider for &T {
    fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error> {
        (**self).command(task_id, environment)
    }
}

/// Aggregates command providers; the first provider that produces a command
/// wins.
#[derive(Default)]
pub struct CommandFactory<'a> {
    providers: Vec<Box<dyn CommandProvider + Send + Sync + 'a>>,
}

impl<'a> CommandFactory<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, provider: impl CommandProvider + Send + Sync + 'a) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error> {
        for provider in &self.providers {
            let cmd = provider.command(task_id, environment.clone())?;
            if cmd.is_some() {
                return Ok(cmd);
            }
        }
        Ok(None)
    }
}

/// The standard provider: run the task's script through the repo's package
/// manager, from the package's directory.
pub struct PackageGraphCommandProvider<'a> {
    repo_root: &'a AbsoluteSystemPath,
    workspaces: &'a WorkspaceCatalog,
    package_manager: PackageManager,
    pass_through_args: &'a [String],
}

impl<'a> PackageGraphCommandProvider<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        workspaces: &'a WorkspaceCatalog,
        package_manager: PackageManager,
        pass_through_args: &'a [String],
    ) -> Self {
        Self {
            repo_root,
            workspaces,
            package_manager,
            pass_through_args,
        }
    }
}

impl CommandProvider for PackageGraphCommandProvider<'_> {
    fn command(
        &self,
        task_id: &TaskId,
        environment: EnvironmentVariableMap,
    ) -> Result<Option<Command>, Error> {
        let package_name = PackageName::from(task_id.package());
        let workspace = self
            .workspaces
            .workspace_info(&package_name)
            .ok_or_else(|| Error::MissingPackage {
                package_name: package_name.clone(),
                task_id: task_id.clone().into_owned(),
            })?;

        // No script, nothing to run. The caller records the task as skipped.
        if workspace
            .command(task_id.task())
            .map_or(true, str::is_empty)
        {
            return Ok(None);
        }

        let mut cmd = Command::new(self.package_manager.command());
        let mut args = vec!["run".to_string(), task_id.task().to_string()];
        if !self.pass_through_args.is_empty() {
            if let Some(separator) = self.package_manager.arg_separator(self.pass_through_args) {
                args.push(separator.to_string());
            }
            args.extend(self.pass_through_args.iter().cloned());
        }
        cmd.args(args);
        cmd.current_dir(self.repo_root.resolve(&workspace.package_dir));
        cmd.env_clear();
        cmd.envs(environment.iter());

        Ok(Some(cmd))
    }
}

#[cfg(test)]
mod test {
    use torquepath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

    use super::*;
    use crate::workspace_catalog::WorkspaceInfo;

    fn catalog() -> WorkspaceCatalog {
        let mut catalog = WorkspaceCatalog::default();
        catalog.insert(
            PackageName::from("util"),
            WorkspaceInfo {
                package_dir: AnchoredSystemPathBuf::from_raw("packages/util").unwrap(),
                scripts: [("build".to_string(), "tsc".to_string())].into_iter().collect(),
                ..WorkspaceInfo::default()
            },
        );
        catalog
    }

    #[test]
    fn test_missing_script_yields_no_command() {
        let repo_root = AbsoluteSystemPathBuf::new("/repo").unwrap();
        let catalog = catalog();
        let provider = PackageGraphCommandProvider::new(&repo_root, &catalog, PackageManager::Npm, &[]);

        let cmd = provider
            .command(
                &TaskId::new("util", "lint"),
                EnvironmentVariableMap::default(),
            )
            .unwrap();
        assert!(cmd.is_none());
    }

    #[test]
    fn test_argv_shape() {
        let repo_root = AbsoluteSystemPathBuf::new("/repo").unwrap();
        let catalog = catalog();
        let pass_through = vec!["--watch".to_string()];
        let provider =
            PackageGraphCommandProvider::new(&repo_root, &catalog, PackageManager::Npm, &pass_through);

        let cmd = provider
            .command(
                &TaskId::new("util", "build"),
                EnvironmentVariableMap::default(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd.label(),
            "(/repo/packages/util) npm run build -- --watch"
        );
    }

    #[test]
    fn test_unknown_package_is_an_error() {
        let repo_root = AbsoluteSystemPathBuf::new("/repo").unwrap();
        let catalog = catalog();
        let provider = PackageGraphCommandProvider::new(&repo_root, &catalog, PackageManager::Npm, &[]);

        let result = provider.command(
            &TaskId::new("ghost", "build"),
            EnvironmentVariableMap::default(),
        );
        assert!(matches!(result, Err(Error::MissingPackage { .. })));
    }
}
