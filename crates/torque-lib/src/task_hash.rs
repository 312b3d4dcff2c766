//! Per-task fingerprints.
//!
//! File hashing happens up front for every task in the graph
//! ([`PackageInputsHashes`]); the per-task hash itself is computed lazily as
//! the scheduler reaches each task, because it folds in the hashes of the
//! task's dependencies. The DAG order is what makes that sound: a task's
//! hash is written to the tracker before any dependent is visited.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use torque_env::{ensure_declared_literals, BySource, DetailedMap, EnvironmentVariableMap};
use torque_hash::{FileHashes, TaskHashable, TorqueHash};
use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};
use tracing::debug;

use crate::{
    engine::TaskNode,
    globwalk::globwalk_files,
    opts::RunOpts,
    task_graph::TaskDefinition,
    task_id::{TaskId, ROOT_PKG_NAME},
    workspace_catalog::{PackageName, WorkspaceCatalog, WorkspaceInfo},
};

/// Always excluded from input hashing; caches and dependency trees are not
/// task inputs.
const DEFAULT_INPUT_EXCLUSIONS: [&str; 2] = [".turbo/**", "node_modules/**"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing pipeline entry {0}")]
    MissingPipelineEntry(TaskId<'static>),
    #[error("missing package {0}")]
    MissingPackage(String),
    #[error("cannot find package-file hash for {0}")]
    MissingPackageFileHash(String),
    #[error("missing hash for dependent task {0}")]
    MissingDependencyTaskHash(String),
    #[error(transparent)]
    Env(#[from] torque_env::Error),
    #[error(transparent)]
    Walk(#[from] crate::globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] torquepath::PathError),
    #[error("cannot hash input file: {0}")]
    Io(#[from] std::io::Error),
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Error::Env(torque_env::Error::Regex(value))
    }
}

/// Content digest of one input file.
pub fn hash_file_contents(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let mut hasher = Sha256::new();
    hasher.update(path.read()?);
    Ok(hex::encode(hasher.finalize()))
}

/// The input-file hash of every task in the graph, computed before
/// execution starts.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    pub fn calculate_file_hashes<'a>(
        all_tasks: impl Iterator<Item = &'a TaskNode>,
        workspaces: &WorkspaceCatalog,
        task_definitions: &HashMap<TaskId<'static>, TaskDefinition>,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<PackageInputsHashes, Error> {
        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();

        for task in all_tasks {
            let TaskNode::Task(task_id) = task else {
                continue;
            };

            // Root tasks have no package directory of their own; their
            // inputs are covered by the global hash.
            if task_id.package() == ROOT_PKG_NAME {
                continue;
            }

            let task_definition = task_definitions
                .get(task_id)
                .ok_or_else(|| Error::MissingPipelineEntry(task_id.clone()))?;

            let workspace_name = PackageName::from(task_id.package());
            let workspace = workspaces
                .workspace_info(&workspace_name)
                .ok_or_else(|| Error::MissingPackage(workspace_name.to_string()))?;

            let package_path = repo_root.resolve(&workspace.package_dir);

            let mut exclusions: Vec<String> = DEFAULT_INPUT_EXCLUSIONS
                .iter()
                .map(ToString::to_string)
                .collect();
            let default_inputs = vec!["**/*".to_string()];
            let inclusions = if task_definition.inputs.is_empty() {
                // When inputs are defaulted to the whole package, the task's
                // own outputs must not feed its hash, or every build would
                // invalidate its own cache entry.
                exclusions.extend(task_definition.outputs.inclusions.iter().cloned());
                &default_inputs
            } else {
                &task_definition.inputs
            };

            let mut hash_object = HashMap::new();
            for file in globwalk_files(&package_path, inclusions, &exclusions)? {
                let anchored = package_path.anchor(&file)?;
                hash_object.insert(anchored.to_unix(), hash_file_contents(&file)?);
            }

            let file_hashes = FileHashes(hash_object);
            let hash = file_hashes.hash();

            hashes.insert(task_id.clone(), hash);
            expanded_hashes.insert(task_id.clone(), file_hashes);
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }

    pub fn expanded_inputs(&self, task_id: &TaskId) -> HashMap<RelativeUnixPathBuf, String> {
        self.expanded_hashes
            .get(task_id)
            .map(|hashes| hashes.0.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
}

/// Hashes (and friends) for every task visited so far. Shared across
/// visitors; a task writes its own entry before any dependent reads it,
/// which the scheduler's topology guarantees.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_hashes
            .get(task_id)
            .cloned()
    }

    pub fn env_pairs(&self, task_id: &TaskId) -> Vec<String> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_env_vars
            .get(task_id)
            .map(|detailed| detailed.all.to_hashable())
            .unwrap_or_default()
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Vec<AnchoredSystemPathBuf> {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_outputs
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        self.state
            .lock()
            .expect("hash tracker lock poisoned")
            .package_task_outputs
            .insert(task_id, outputs);
    }

    fn insert_hash(&self, task_id: TaskId<'static>, env_vars: DetailedMap, hash: String) {
        let mut state = self.state.lock().expect("hash tracker lock poisoned");
        state.package_task_env_vars.insert(task_id.clone(), env_vars);
        state.package_task_hashes.insert(task_id, hash);
    }
}

/// Computes task hashes and remembers them for dependents and the run
/// summary.
pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    run_opts: &'a RunOpts,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        run_opts: &'a RunOpts,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
    ) -> Self {
        Self {
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        workspace: &WorkspaceInfo,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<String, Error> {
        let hash_of_files = match self.package_inputs_hashes.hashes.get(task_id) {
            Some(hash) => hash.as_str(),
            None if task_id.package() == ROOT_PKG_NAME => "",
            None => return Err(Error::MissingPackageFileHash(task_id.to_string())),
        };

        // Env selection follows the same rules as the global hash,
        // restricted to this task's declared names: wildcard inclusions,
        // declared-but-unset literals pinned to empty, exclusions last.
        let user_env_var_set = self
            .env_at_execution_start
            .wildcard_map_from_wildcards_unresolved(&task_definition.env)?;
        let mut all_env_var_map = EnvironmentVariableMap::default();
        all_env_var_map.union(&user_env_var_set.inclusions);
        ensure_declared_literals(&mut all_env_var_map, &task_definition.env);
        all_env_var_map.difference(&user_env_var_set.exclusions);

        let mut explicit_env_var_map = EnvironmentVariableMap::default();
        explicit_env_var_map.union(&all_env_var_map);
        let env_vars = DetailedMap {
            all: all_env_var_map,
            by_source: BySource {
                explicit: explicit_env_var_map,
                matching: EnvironmentVariableMap::default(),
            },
        };

        let hashable_env_pairs = env_vars.all.to_hashable();
        let outputs = task_definition.hashable_outputs(task_id);
        let task_dependency_hashes = self.calculate_dependency_hashes(dependency_set)?;

        debug!(
            "task hash env vars for {}: {:?}",
            task_id, hashable_env_pairs
        );

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            hash_of_files,
            external_deps_hash: &workspace.external_deps_hash,
            package_dir: workspace.package_dir.to_unix(),
            task: task_id.task(),
            outputs: torque_hash::TaskOutputs {
                inclusions: outputs.inclusions,
                exclusions: outputs.exclusions,
            },
            pass_through_args: &self.run_opts.pass_through_args,
            env: &task_definition.env,
            resolved_env_vars: hashable_env_pairs,
            pass_through_env: &task_definition.pass_through_env,
        };

        let task_hash = task_hashable.hash();
        debug!("task {} hash is {}", task_id, task_hash);

        self.task_hash_tracker
            .insert_hash(task_id.clone(), env_vars, task_hash.clone());

        Ok(task_hash)
    }

    /// The sorted hashes of the task's direct, non-root dependencies. Every
    /// one of them must already be in the tracker; the scheduler's topology
    /// guarantee is what makes the lookup safe, and a miss here is a
    /// scheduling bug surfaced loudly.
    fn calculate_dependency_hashes(
        &self,
        dependency_set: HashSet<&TaskNode>,
    ) -> Result<Vec<String>, Error> {
        let mut dependency_hash_set = HashSet::new();

        for dependency_task in dependency_set {
            let TaskNode::Task(dependency_task_id) = dependency_task else {
                continue;
            };

            if dependency_task_id.package() == ROOT_PKG_NAME {
                continue;
            }

            let dependency_hash = self
                .task_hash_tracker
                .hash(dependency_task_id)
                .ok_or_else(|| Error::MissingDependencyTaskHash(dependency_task.to_string()))?;
            dependency_hash_set.insert(dependency_hash);
        }

        let mut dependency_hash_list = dependency_hash_set.into_iter().collect::<Vec<_>>();
        dependency_hash_list.sort();

        Ok(dependency_hash_list)
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    pub fn expanded_inputs(&self, task_id: &TaskId) -> HashMap<RelativeUnixPathBuf, String> {
        self.package_inputs_hashes.expanded_inputs(task_id)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use torquepath::AnchoredSystemPathBuf;

    use super::*;

    fn test_env(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
            .into()
    }

    fn workspace() -> WorkspaceInfo {
        WorkspaceInfo {
            package_dir: AnchoredSystemPathBuf::from_raw("packages/util").unwrap(),
            external_deps_hash: "cccccccccccccccc".to_string(),
            ..WorkspaceInfo::default()
        }
    }

    fn hasher_inputs(task_id: &TaskId<'static>) -> PackageInputsHashes {
        let mut hashes = HashMap::new();
        hashes.insert(task_id.clone(), "bbbbbbbbbbbbbbbb".to_string());
        PackageInputsHashes {
            hashes,
            expanded_hashes: HashMap::default(),
        }
    }

    fn calculate(
        env: &EnvironmentVariableMap,
        run_opts: &RunOpts,
        definition: &TaskDefinition,
    ) -> String {
        let task_id = TaskId::new("util", "build").into_owned();
        let hasher = TaskHasher::new(
            hasher_inputs(&task_id),
            run_opts,
            env,
            "0000000000000000",
        );
        hasher
            .calculate_task_hash(&task_id, definition, &workspace(), HashSet::new())
            .unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let env = test_env(&[("MY_VAR", "value")]);
        let run_opts = RunOpts::default();
        let definition = TaskDefinition {
            env: vec!["MY_VAR".to_string()],
            ..TaskDefinition::default()
        };
        assert_eq!(
            calculate(&env, &run_opts, &definition),
            calculate(&env, &run_opts, &definition)
        );
    }

    #[test]
    fn test_undeclared_env_is_ignored() {
        let run_opts = RunOpts::default();
        let definition = TaskDefinition::default();
        let quiet = calculate(&test_env(&[]), &run_opts, &definition);
        let noisy = calculate(&test_env(&[("SOME_ENV_VAR", "hi")]), &run_opts, &definition);
        assert_eq!(quiet, noisy);
    }

    #[test]
    fn test_declared_env_changes_hash() {
        let run_opts = RunOpts::default();
        let definition = TaskDefinition {
            env: vec!["MY_VAR".to_string()],
            ..TaskDefinition::default()
        };
        let unset = calculate(&test_env(&[]), &run_opts, &definition);
        let set = calculate(&test_env(&[("MY_VAR", "hi")]), &run_opts, &definition);
        assert_ne!(unset, set);
    }

    #[test]
    fn test_pass_through_args_change_hash() {
        let env = test_env(&[]);
        let definition = TaskDefinition::default();
        let without = calculate(&env, &RunOpts::default(), &definition);
        let with = calculate(
            &env,
            &RunOpts {
                pass_through_args: vec!["--watch".to_string()],
                ..RunOpts::default()
            },
            &definition,
        );
        assert_ne!(without, with);
    }

    #[test]
    fn test_dependency_hash_must_exist() {
        let env = test_env(&[]);
        let run_opts = RunOpts::default();
        let task_id = TaskId::new("util", "build").into_owned();
        let hasher = TaskHasher::new(hasher_inputs(&task_id), &run_opts, &env, "0");

        let upstream = TaskNode::Task(TaskId::new("lib", "build").into_owned());
        let result = hasher.calculate_task_hash(
            &task_id,
            &TaskDefinition::default(),
            &workspace(),
            HashSet::from([&upstream]),
        );
        assert!(matches!(result, Err(Error::MissingDependencyTaskHash(_))));
    }

    #[test]
    fn test_dependency_hash_feeds_into_task_hash() {
        let env = test_env(&[]);
        let run_opts = RunOpts::default();
        let task_id = TaskId::new("util", "build").into_owned();
        let upstream_id = TaskId::new("lib", "build").into_owned();
        let upstream_node = TaskNode::Task(upstream_id.clone());

        let run = |upstream_hash: &str| {
            let hasher = TaskHasher::new(hasher_inputs(&task_id), &run_opts, &env, "0");
            hasher.task_hash_tracker().insert_hash(
                upstream_id.clone(),
                DetailedMap::default(),
                upstream_hash.to_string(),
            );
            hasher
                .calculate_task_hash(
                    &task_id,
                    &TaskDefinition::default(),
                    &workspace(),
                    HashSet::from([&upstream_node]),
                )
                .unwrap()
        };

        assert_ne!(run("1111111111111111"), run("2222222222222222"));
    }

    #[test]
    fn test_file_hashing_covers_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let package_dir = repo_root.join_components(&["packages", "util"]);
        package_dir.create_dir_all()?;
        package_dir
            .join_component("index.js")
            .create_with_contents("module.exports = 1;\n")?;

        let task_id = TaskId::new("util", "build").into_owned();
        let mut workspaces = WorkspaceCatalog::default();
        workspaces.insert(PackageName::from("util"), workspace());
        let mut definitions = HashMap::new();
        definitions.insert(task_id.clone(), TaskDefinition::default());
        let node = TaskNode::Task(task_id.clone());

        let first = PackageInputsHashes::calculate_file_hashes(
            [&node].into_iter(),
            &workspaces,
            &definitions,
            repo_root,
        )?;

        package_dir
            .join_component("index.js")
            .create_with_contents("module.exports = 2;\n")?;

        let second = PackageInputsHashes::calculate_file_hashes(
            [&node].into_iter(),
            &workspaces,
            &definitions,
            repo_root,
        )?;

        assert_ne!(first.hashes[&task_id], second.hashes[&task_id]);
        assert_eq!(first.expanded_inputs(&task_id).len(), 1);
        Ok(())
    }
}
