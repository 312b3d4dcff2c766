//! Orchestrates a single run: builds the task graph from the resolved
//! invocation, computes the global hash, drives the visitor, and aggregates
//! the exit code.

pub mod cache;
pub(crate) mod global_hash;
pub mod summary;

use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    sync::Arc,
};

pub use cache::{RunCache, TaskCache};
use chrono::Local;
use itertools::Itertools;
use thiserror::Error;
use torque_cache::AsyncCache;
use torque_env::EnvironmentVariableMap;
use torque_hash::PristinePipeline;
use torque_process::ProcessManager;
use torque_ui::{cprint, cprintln, ColorConfig, ColorSelector, BOLD_GREY, GREY};
use torquepath::AbsoluteSystemPathBuf;
use tracing::debug;

use crate::{
    engine::{Building, BuilderError, Engine},
    globwalk,
    opts::Opts,
    package_manager::PackageManager,
    run::{global_hash::get_global_hash_inputs, summary::RunTracker},
    signal::SignalSubscriber,
    task_graph::{TaskDefinition, TaskError, Visitor, VisitorError},
    task_hash::{PackageInputsHashes, TaskHasher},
    task_id::TaskId,
    workspace_catalog::{PackageName, WorkspaceCatalog},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not find task `{0}` in project")]
    MissingTask(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Visitor(#[from] VisitorError),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Cache(#[from] torque_cache::CacheError),
    #[error(transparent)]
    Walk(#[from] globwalk::WalkError),
    #[error(transparent)]
    Summary(#[from] summary::Error),
}

/// The resolved pipeline configuration handed to the engine. Keys are task
/// names (`build`) or package-scoped task ids (`web#build`); the scoped form
/// wins. `dependsOn` shorthand is already resolved to concrete upstream
/// task ids by the configuration layer.
#[derive(Debug, Default, Clone)]
pub struct Pipeline {
    pub tasks: BTreeMap<String, TaskDefinition>,
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Vec<String>,
}

impl Pipeline {
    pub fn task_definition(&self, task_id: &TaskId) -> Option<&TaskDefinition> {
        self.tasks
            .get(&task_id.to_string())
            .or_else(|| self.tasks.get(task_id.task()))
    }

    /// The canonical form fed into the global hash.
    pub fn pristine(&self) -> PristinePipeline {
        PristinePipeline(
            self.tasks
                .iter()
                .map(|(name, definition)| (name.clone(), definition.pristine()))
                .collect(),
        )
    }
}

/// A resolved invocation: which tasks, in which packages, with which knobs.
/// Produced by the CLI layer, consumed here.
#[derive(Debug, Default)]
pub struct RunSpec {
    pub targets: Vec<String>,
    pub filtered_pkgs: HashSet<PackageName>,
    pub opts: Opts,
}

/// A configured runner for one repository.
pub struct Run {
    repo_root: AbsoluteSystemPathBuf,
    workspaces: WorkspaceCatalog,
    pipeline: Pipeline,
    package_manager: PackageManager,
    color_config: ColorConfig,
    processes: ProcessManager,
    remote_client: Option<Arc<dyn torque_cache::remote::RemoteClient>>,
}

impl Run {
    pub fn new(
        repo_root: AbsoluteSystemPathBuf,
        workspaces: WorkspaceCatalog,
        pipeline: Pipeline,
        package_manager: PackageManager,
        color_config: ColorConfig,
    ) -> Self {
        Self {
            repo_root,
            workspaces,
            pipeline,
            package_manager,
            color_config,
            processes: ProcessManager::new(),
            remote_client: None,
        }
    }

    pub fn with_remote_client(
        mut self,
        client: Arc<dyn torque_cache::remote::RemoteClient>,
    ) -> Self {
        self.remote_client = Some(client);
        self
    }

    /// Wires the interrupt signal to the process supervisor: on signal the
    /// supervisor flips to closing and forwards it to every live child.
    pub fn connect_signal(&self, subscriber: SignalSubscriber) {
        let manager = self.processes.clone();
        tokio::spawn(async move {
            let _guard = subscriber.listen().await;
            manager.stop().await;
        });
    }

    pub fn process_manager(&self) -> ProcessManager {
        self.processes.clone()
    }

    /// Executes the run and returns the process exit code: `0` on success,
    /// the maximum child exit code when tasks failed, `1` when any
    /// non-child error occurred.
    pub async fn run(&self, spec: &RunSpec) -> Result<i32, Error> {
        let started_at = Local::now();
        let env_at_execution_start = EnvironmentVariableMap::infer();
        let opts = &spec.opts;

        let engine = Arc::new(self.build_engine(spec)?);

        self.print_run_prelude(spec);

        let async_cache = AsyncCache::new(
            &opts.cache_opts,
            &self.repo_root,
            self.remote_client.clone(),
        )?;

        let root_external_deps_hash = self.workspaces.root_external_deps_hash();
        let global_hash_inputs = get_global_hash_inputs(
            &self.repo_root,
            root_external_deps_hash,
            self.package_manager,
            !root_external_deps_hash.is_empty(),
            &self.pipeline.global_deps,
            &env_at_execution_start,
            &self.pipeline.global_env,
            &self.pipeline.global_pass_through_env,
            &self.pipeline,
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash_from_inputs();

        let run_cache = Arc::new(RunCache::new(
            async_cache,
            &self.repo_root,
            &opts.run_cache_opts,
            ColorSelector::default(),
        ));

        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            engine.tasks(),
            &self.workspaces,
            engine.task_definitions(),
            &self.repo_root,
        )?;
        let task_hasher = TaskHasher::new(
            package_inputs_hashes,
            &opts.run_opts,
            &env_at_execution_start,
            &global_hash,
        );

        let run_tracker = RunTracker::new(started_at, opts.run_opts.synthesize_command());

        let visitor = Visitor::new(
            &self.workspaces,
            run_cache.clone(),
            run_tracker,
            &opts.run_opts,
            self.package_manager,
            task_hasher,
            &env_at_execution_start,
            self.color_config,
            self.processes.clone(),
            &self.repo_root,
        );

        // we look for this log line to mark the start of the run
        // in benchmarks, so please don't remove it
        debug!("running visitor");

        let errors = visitor.visit(engine.clone()).await?;

        let exit_code = aggregate_exit_code(&errors);

        for err in &errors {
            writeln!(std::io::stderr(), "{err}").ok();
        }

        run_cache.shutdown_cache().await;

        visitor.finish(exit_code, opts.run_opts.summarize).await?;

        Ok(exit_code)
    }

    fn print_run_prelude(&self, spec: &RunSpec) {
        let targets_list = spec.targets.join(", ");
        if spec.opts.run_opts.single_package {
            cprint!(self.color_config, GREY, "{}", "• Running");
            cprint!(self.color_config, BOLD_GREY, " {}\n", targets_list);
        } else {
            let packages = spec
                .filtered_pkgs
                .iter()
                .map(|workspace| workspace.to_string())
                .sorted()
                .join(", ");
            cprintln!(self.color_config, GREY, "• Packages in scope: {}", packages);
            cprint!(self.color_config, GREY, "{} ", "• Running");
            cprint!(self.color_config, BOLD_GREY, "{}", targets_list);
            cprint!(
                self.color_config,
                GREY,
                " in {} packages\n",
                spec.filtered_pkgs.len()
            );
        }

        let use_remote_cache = !spec.opts.cache_opts.skip_remote;
        if use_remote_cache {
            cprintln!(self.color_config, GREY, "• Remote caching enabled");
        } else {
            cprintln!(self.color_config, GREY, "• Remote caching disabled");
        }
    }

    /// Builds the task graph for the invocation: entry tasks for every
    /// filtered package, plus the transitive closure of their declared
    /// upstream tasks. Cycles and unknown references are rejected before
    /// anything runs.
    fn build_engine(&self, spec: &RunSpec) -> Result<Engine, Error> {
        let mut engine = Engine::<Building>::new();
        let mut queue: Vec<TaskId<'static>> = Vec::new();

        for target in &spec.targets {
            let mut found = false;
            for package in spec.filtered_pkgs.iter().sorted() {
                let package_name = package.to_string();
                let task_id = TaskId::new(&package_name, target).into_owned();
                if self.pipeline.task_definition(&task_id).is_none() {
                    continue;
                }
                if self.workspaces.workspace_info(package).is_none() {
                    continue;
                }
                found = true;
                engine.connect_to_root(&task_id);
                queue.push(task_id);
            }
            if !found {
                return Err(Error::MissingTask(target.clone()));
            }
        }

        while let Some(task_id) = queue.pop() {
            let Some(definition) = self.pipeline.task_definition(&task_id) else {
                return Err(Error::MissingTask(task_id.to_string()));
            };
            if engine
                .add_definition(task_id.clone(), definition.clone())
                .is_some()
            {
                // Already expanded this task.
                continue;
            }
            for dependency in &definition.task_dependencies {
                engine.add_dependency(&task_id, dependency);
                queue.push(dependency.clone());
            }
        }

        Ok(engine.seal()?)
    }
}

/// Exit-code aggregation: the maximum child exit code wins; any non-child
/// error forces at least `1`.
fn aggregate_exit_code(errors: &[TaskError]) -> i32 {
    if errors.is_empty() {
        return 0;
    }
    errors
        .iter()
        .filter_map(|err| err.exit_code())
        .max()
        .unwrap_or(1)
        .max(if errors.iter().any(|err| err.exit_code().is_none()) {
            1
        } else {
            0
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_graph::TaskErrorCause;

    fn exit_error(code: i32) -> TaskError {
        TaskError::new(
            TaskId::new("util", "build").into_owned(),
            TaskErrorCause::Exit { exit_code: code },
        )
    }

    fn spawn_error() -> TaskError {
        TaskError::new(
            TaskId::new("util", "build").into_owned(),
            TaskErrorCause::Spawn {
                msg: "spawn failed".to_string(),
            },
        )
    }

    #[test]
    fn test_exit_code_aggregation() {
        assert_eq!(aggregate_exit_code(&[]), 0);
        assert_eq!(aggregate_exit_code(&[exit_error(3), exit_error(2)]), 3);
        assert_eq!(aggregate_exit_code(&[spawn_error()]), 1);
        // A non-child error can never lower the exit code below a child's.
        assert_eq!(aggregate_exit_code(&[exit_error(5), spawn_error()]), 5);
    }

    #[test]
    fn test_pipeline_scoped_entry_wins() {
        let mut pipeline = Pipeline::default();
        pipeline
            .tasks
            .insert("build".to_string(), TaskDefinition::default());
        pipeline.tasks.insert(
            "web#build".to_string(),
            TaskDefinition {
                cache: false,
                ..TaskDefinition::default()
            },
        );

        let generic = pipeline
            .task_definition(&TaskId::new("util", "build"))
            .unwrap();
        assert!(generic.cache);

        let scoped = pipeline
            .task_definition(&TaskId::new("web", "build"))
            .unwrap();
        assert!(!scoped.cache);
    }

    #[test]
    fn test_build_engine_rejects_unknown_target() {
        let repo_root = AbsoluteSystemPathBuf::new("/repo").unwrap();
        let mut workspaces = WorkspaceCatalog::default();
        workspaces.insert(
            PackageName::from("util"),
            crate::workspace_catalog::WorkspaceInfo::default(),
        );
        let run = Run::new(
            repo_root,
            workspaces,
            Pipeline::default(),
            PackageManager::Npm,
            ColorConfig::new(true),
        );

        let spec = RunSpec {
            targets: vec!["build".to_string()],
            filtered_pkgs: [PackageName::from("util")].into_iter().collect(),
            opts: Opts::default(),
        };
        assert!(matches!(
            run.build_engine(&spec),
            Err(Error::MissingTask(_))
        ));
    }

    #[test]
    fn test_build_engine_expands_dependencies() {
        let repo_root = AbsoluteSystemPathBuf::new("/repo").unwrap();
        let mut workspaces = WorkspaceCatalog::default();
        workspaces.insert(
            PackageName::from("util"),
            crate::workspace_catalog::WorkspaceInfo::default(),
        );

        let mut pipeline = Pipeline::default();
        pipeline.tasks.insert(
            "build".to_string(),
            TaskDefinition {
                task_dependencies: vec![TaskId::new("util", "codegen").into_owned()],
                ..TaskDefinition::default()
            },
        );
        pipeline.tasks.insert(
            "util#codegen".to_string(),
            TaskDefinition::default(),
        );

        let run = Run::new(
            repo_root,
            workspaces,
            pipeline,
            PackageManager::Npm,
            ColorConfig::new(true),
        );
        let spec = RunSpec {
            targets: vec!["build".to_string()],
            filtered_pkgs: [PackageName::from("util")].into_iter().collect(),
            opts: Opts::default(),
        };

        let engine = run.build_engine(&spec).unwrap();
        let build = TaskId::new("util", "build").into_owned();
        let codegen = TaskId::new("util", "codegen").into_owned();
        let deps = engine.dependencies(&build).unwrap();
        assert!(deps.contains(&crate::engine::TaskNode::Task(codegen)));
    }
}
