mod command;
mod error;
mod exec;

use std::{
    borrow::Cow,
    collections::HashSet,
    io::Write,
    sync::{Arc, Mutex, OnceLock},
};

pub use command::{CommandFactory, CommandProvider, PackageGraphCommandProvider};
pub use error::{TaskError, TaskErrorCause, TaskWarning};
use exec::ExecContext;
use futures::{stream::FuturesUnordered, StreamExt};
use itertools::Itertools;
use regex::Regex;
use tokio::sync::mpsc;
use torque_env::EnvironmentVariableMap;
use torque_process::ProcessManager;
use torque_ui::{ColorConfig, ColorSelector};
use torquepath::AbsoluteSystemPath;
use tracing::debug;

use crate::{
    engine::{Engine, ExecutionOptions, Message, StopExecution},
    opts::{ResolvedLogPrefix, RunOpts},
    package_manager::PackageManager,
    run::{
        cache::RunCache,
        summary::{RunTracker, SummaryState, TaskCacheSummary, TaskSummaryBase},
    },
    task_graph::{task_log_filename, TaskDefinition},
    task_hash::TaskHasher,
    task_id::{TaskId, ROOT_PKG_NAME},
    workspace_catalog::{PackageName, WorkspaceCatalog, WorkspaceInfo},
};

/// Drives the task graph: computes hashes, consults the cache, launches
/// commands, and records per-task summaries. This is the only place that
/// knows about both the cache and the process supervisor.
pub struct Visitor<'a> {
    color_cache: ColorSelector,
    color_config: ColorConfig,
    command_providers: Vec<Box<dyn CommandProvider + Send + Sync + 'a>>,
    env_at_execution_start: &'a EnvironmentVariableMap,
    manager: ProcessManager,
    package_manager: PackageManager,
    repo_root: &'a AbsoluteSystemPath,
    run_cache: Arc<RunCache>,
    run_opts: &'a RunOpts,
    run_tracker: RunTracker,
    task_hasher: TaskHasher<'a>,
    warnings: Arc<Mutex<Vec<TaskWarning>>>,
    workspaces: &'a WorkspaceCatalog,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error(
        "root task {task_name} ({command}) looks like it invokes turbo and might cause a loop"
    )]
    RecursiveTurbo { task_name: String, command: String },
    #[error("Could not find definition for task")]
    MissingDefinition,
    #[error("error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
    #[error(transparent)]
    Summary(#[from] crate::run::summary::Error),
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspaces: &'a WorkspaceCatalog,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        run_opts: &'a RunOpts,
        package_manager: PackageManager,
        task_hasher: TaskHasher<'a>,
        env_at_execution_start: &'a EnvironmentVariableMap,
        color_config: ColorConfig,
        manager: ProcessManager,
        repo_root: &'a AbsoluteSystemPath,
    ) -> Self {
        Self {
            color_cache: ColorSelector::default(),
            color_config,
            command_providers: Vec::new(),
            env_at_execution_start,
            manager,
            package_manager,
            repo_root,
            run_cache,
            run_opts,
            run_tracker,
            task_hasher,
            warnings: Default::default(),
            workspaces,
        }
    }

    /// Registers a command provider consulted before the standard
    /// package-manager one.
    pub fn add_command_provider(
        &mut self,
        provider: impl CommandProvider + Send + Sync + 'a,
    ) -> &mut Self {
        self.command_providers.push(Box::new(provider));
        self
    }

    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        // Assign colors in sorted order so reruns color tasks the same way.
        for task_id in self.sorted_task_ids(&engine) {
            self.color_cache.color_for_key(&task_id);
        }

        let concurrency = self.run_opts.concurrency.max(1) as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency),
                node_sender,
            ))
        };
        let mut tasks = FuturesUnordered::new();
        let errors: Arc<Mutex<Vec<TaskError>>> = Arc::new(Mutex::new(Vec::new()));
        // Failed tasks and everything downstream of them; consulted before a
        // task is hashed so unreachable descendants are skipped, not run.
        let unreachable: Arc<Mutex<HashSet<TaskId<'static>>>> =
            Arc::new(Mutex::new(HashSet::new()));
        let mut visited: HashSet<TaskId<'static>> = HashSet::new();

        let package_graph_provider = PackageGraphCommandProvider::new(
            self.repo_root,
            self.workspaces,
            self.package_manager,
            &self.run_opts.pass_through_args,
        );
        let mut factory = CommandFactory::new();
        for provider in &self.command_providers {
            factory.add_provider(provider.as_ref());
        }
        factory.add_provider(&package_graph_provider);

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            visited.insert(info.clone().into_owned());

            let package_name = PackageName::from(info.package());
            let workspace_info = self
                .workspaces
                .workspace_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: info.clone().into_owned(),
                })?;

            let command = workspace_info.command(info.task()).map(str::to_string);
            if let Some(cmd) = &command {
                if info.package() == ROOT_PKG_NAME && turbo_regex().is_match(cmd) {
                    return Err(Error::RecursiveTurbo {
                        task_name: info.to_string(),
                        command: cmd.to_string(),
                    });
                }
            }

            let task_definition = engine
                .task_definition(&info)
                .ok_or(Error::MissingDefinition)?;
            let dependency_set = engine.dependencies(&info).ok_or(Error::MissingDefinition)?;

            // A failed (or unreachable) dependency makes this task
            // unreachable too: record it as skipped and keep the walk moving
            // for unrelated subtrees.
            let has_failed_dependency = {
                let unreachable = unreachable.lock().expect("unreachable set lock poisoned");
                dependency_set.iter().any(|node| match node {
                    crate::engine::TaskNode::Task(dep) => unreachable.contains(dep),
                    crate::engine::TaskNode::Root => false,
                })
            };
            if has_failed_dependency {
                debug!("skipping {info}: upstream task failed");
                unreachable
                    .lock()
                    .expect("unreachable set lock poisoned")
                    .insert(info.clone().into_owned());
                let tracker = self.run_tracker.track_task(info.clone().into_owned());
                let execution = tracker.skipped();
                self.run_tracker.summary_sink().record(
                    self.summary_base(&engine, &info, workspace_info, task_definition, command.as_deref(), "")
                        .into_summary(TaskCacheSummary::default(), execution, Vec::new()),
                );
                callback.send(Ok(())).ok();
                continue;
            }

            let task_hash = match self.task_hasher.calculate_task_hash(
                &info,
                task_definition,
                workspace_info,
                dependency_set,
            ) {
                Ok(hash) => hash,
                // A hash failure fails this task, never the whole run, and
                // the cache is not consulted with a bogus key.
                Err(err) => {
                    let cause = TaskErrorCause::Hash {
                        msg: err.to_string(),
                    };
                    let tracker = self.run_tracker.track_task(info.clone().into_owned());
                    let tracker = tracker.start().await;
                    let execution = tracker.build_failed(1, &cause).await;
                    self.run_tracker.summary_sink().record(
                        self.summary_base(&engine, &info, workspace_info, task_definition, command.as_deref(), "")
                            .into_summary(TaskCacheSummary::default(), execution, Vec::new()),
                    );
                    errors
                        .lock()
                        .expect("error collector lock poisoned")
                        .push(TaskError::new(info.clone().into_owned(), cause));
                    unreachable
                        .lock()
                        .expect("unreachable set lock poisoned")
                        .insert(info.clone().into_owned());
                    let result = if self.run_opts.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    };
                    callback.send(result).ok();
                    continue;
                }
            };

            debug!("task {} hash is {}", info, task_hash);

            let task_cache = self.run_cache.task_cache(
                task_definition,
                &workspace_info.package_dir,
                info.clone().into_owned(),
                &task_hash,
            );

            // Always last so it overrides anything user-configured.
            let mut execution_env = self.env_at_execution_start.clone();
            execution_env.insert("TURBO_HASH".to_owned(), task_hash.clone());

            let cmd = factory.command(&info, execution_env)?;

            let base = self.summary_base(
                &engine,
                &info,
                workspace_info,
                task_definition,
                command.as_deref(),
                &task_hash,
            );

            let exec_context = ExecContext {
                task_id: info.clone().into_owned(),
                cmd,
                task_cache,
                hash_tracker: self.task_hasher.task_hash_tracker(),
                manager: self.manager.clone(),
                errors: errors.clone(),
                warnings: self.warnings.clone(),
                continue_on_error: self.run_opts.continue_on_error,
                pretty_prefix: self
                    .color_cache
                    .prefix_with_color(&info.to_string(), &self.prefix(&info)),
                color_config: self.color_config,
                base,
                unreachable: unreachable.clone(),
            };

            let tracker = self.run_tracker.track_task(info.into_owned());
            let sink = self.run_tracker.summary_sink();
            tasks.push(tokio::spawn(async move {
                exec_context.execute(tracker, callback, sink).await;
            }));
        }

        // The engine finishing closes the node stream; then drain our tasks.
        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.expect("task executor panicked");
        }

        // Anything never emitted by the walker was cancelled out from under
        // us; record it so the summary covers the whole graph.
        for task_id in engine.task_ids() {
            if !visited.contains(task_id) {
                let tracker = self.run_tracker.track_task(task_id.clone());
                let execution = tracker.skipped();
                self.run_tracker.summary_sink().record(
                    TaskSummaryBase {
                        task_id: task_id.clone(),
                        task: task_id.task().to_string(),
                        package: task_id.package().to_string(),
                        hash: String::new(),
                        inputs: Default::default(),
                        command: String::new(),
                        outputs: Vec::new(),
                        excluded_outputs: Vec::new(),
                        log_file: String::new(),
                        dependencies: Vec::new(),
                        dependents: Vec::new(),
                        env_vars: Vec::new(),
                        framework: String::new(),
                    }
                    .into_summary(
                        TaskCacheSummary::default(),
                        execution,
                        Vec::new(),
                    ),
                );
            }
        }

        let errors = Arc::into_inner(errors)
            .expect("only one strong reference to errors remains")
            .into_inner()
            .expect("error collector lock poisoned");

        Ok(errors)
    }

    /// Closes out the run: prints collected warnings and the footer, and
    /// writes the summary document when requested.
    pub async fn finish(self, exit_code: i32, summarize: bool) -> Result<SummaryState, Error> {
        let warnings = self
            .warnings
            .lock()
            .expect("warning collector lock poisoned")
            .clone();
        if !warnings.is_empty() {
            eprintln!();
            for warning in &warnings {
                let _ = writeln!(std::io::stderr(), "{warning}");
            }
        }

        Ok(self
            .run_tracker
            .finish(exit_code, self.color_config, self.repo_root, summarize)
            .await?)
    }

    fn summary_base(
        &self,
        engine: &Engine,
        task_id: &TaskId<'static>,
        workspace: &WorkspaceInfo,
        task_definition: &TaskDefinition,
        command: Option<&str>,
        hash: &str,
    ) -> TaskSummaryBase {
        let collect_ids = |nodes: Option<HashSet<&crate::engine::TaskNode>>| {
            nodes
                .map(|nodes| {
                    nodes
                        .into_iter()
                        .filter_map(|node| match node {
                            crate::engine::TaskNode::Task(id) => Some(id.clone()),
                            crate::engine::TaskNode::Root => None,
                        })
                        .sorted()
                        .collect()
                })
                .unwrap_or_default()
        };

        TaskSummaryBase {
            task_id: task_id.clone(),
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            hash: hash.to_string(),
            inputs: self.task_hasher.expanded_inputs(task_id).into_iter().collect(),
            command: command
                .map(str::to_string)
                .unwrap_or_else(|| "<NONEXISTENT>".to_string()),
            outputs: task_definition.outputs.inclusions.clone(),
            excluded_outputs: task_definition.outputs.exclusions.clone(),
            log_file: workspace
                .package_dir
                .join_component(&task_log_filename(task_id.task()))
                .to_unix()
                .as_str()
                .to_string(),
            dependencies: collect_ids(engine.dependencies(task_id)),
            dependents: collect_ids(engine.dependents(task_id)),
            env_vars: self.task_hasher.task_hash_tracker().env_pairs(task_id),
            framework: String::new(),
        }
    }

    fn sorted_task_ids(&self, engine: &Engine) -> Vec<String> {
        engine.task_ids().map(ToString::to_string).sorted().collect()
    }

    fn prefix<'b>(&self, task_id: &'b TaskId) -> Cow<'b, str> {
        match self.run_opts.log_prefix {
            ResolvedLogPrefix::Task if self.run_opts.single_package => task_id.task().into(),
            ResolvedLogPrefix::Task => {
                format!("{}:{}", task_id.package(), task_id.task()).into()
            }
            ResolvedLogPrefix::None => "".into(),
        }
    }
}

fn turbo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)turbo(?:$|\s)").expect("regex is valid"))
}

// A tiny enum so stdout and stderr share a type without Box<dyn Write>.
pub enum StdWriter {
    Out(std::io::Stdout),
    Err(std::io::Stderr),
}

impl StdWriter {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            StdWriter::Out(out) => out,
            StdWriter::Err(err) => err,
        }
    }
}

impl Write for StdWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer().flush()
    }
}
