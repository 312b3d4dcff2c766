use std::collections::HashMap;

use torque_env::{get_global_hashable_env_vars, DetailedMap, EnvironmentVariableMap};
use torque_hash::{GlobalHashable, PristinePipeline, TorqueHash, GLOBAL_CACHE_KEY};
use torquepath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use tracing::debug;

use crate::{
    globwalk::globwalk_files,
    package_manager::PackageManager,
    run::Pipeline,
    task_hash::{hash_file_contents, Error},
};

/// Directories never treated as global file dependencies.
const DEFAULT_GLOBAL_IGNORES: [&str; 2] = ["node_modules/**", ".git/**"];

/// Everything that goes into the run-wide hash, resolved once per run.
#[derive(Debug, Default)]
pub struct GlobalHashableInputs<'a> {
    global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    root_external_deps_hash: &'a str,
    env: &'a [String],
    resolved_env_vars: Option<DetailedMap>,
    pass_through_env: &'a [String],
    pipeline: PristinePipeline,
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs<'a>(
    repo_root: &AbsoluteSystemPath,
    root_external_deps_hash: &'a str,
    package_manager: PackageManager,
    has_lockfile_digest: bool,
    global_file_dependencies: &[String],
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &'a [String],
    global_pass_through_env: &'a [String],
    pipeline: &Pipeline,
) -> Result<GlobalHashableInputs<'a>, Error> {
    let ignores: Vec<String> = DEFAULT_GLOBAL_IGNORES
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut global_deps: Vec<String> = global_file_dependencies.to_vec();
    // Without a parsed lockfile digest the external dependency set is
    // unknown, so the raw manifest and lockfile stand in for it.
    if !has_lockfile_digest {
        global_deps.push(package_manager.specfile().to_string());
        global_deps.push(package_manager.lockfile().to_string());
    }

    let mut global_file_hash_map = HashMap::new();
    for file in globwalk_files(repo_root, &global_deps, &ignores)? {
        let anchored = repo_root.anchor(&file)?;
        global_file_hash_map.insert(anchored.to_unix(), hash_file_contents(&file)?);
    }

    let resolved_env_vars = get_global_hashable_env_vars(env_at_execution_start, global_env)?;

    Ok(GlobalHashableInputs {
        global_file_hash_map,
        root_external_deps_hash,
        env: global_env,
        resolved_env_vars: Some(resolved_env_vars),
        pass_through_env: global_pass_through_env,
        pipeline: pipeline.pristine(),
    })
}

impl GlobalHashableInputs<'_> {
    pub fn calculate_global_hash_from_inputs(&self) -> String {
        let resolved_env_vars = self
            .resolved_env_vars
            .as_ref()
            .map(|vars| vars.all.to_hashable())
            .unwrap_or_default();

        let hashable = GlobalHashable {
            global_cache_key: GLOBAL_CACHE_KEY,
            global_file_hash_map: &self.global_file_hash_map,
            root_external_deps_hash: self.root_external_deps_hash,
            env: self.env,
            resolved_env_vars,
            pass_through_env: self.pass_through_env,
            pipeline: self.pipeline.clone(),
        };

        let global_hash = hashable.hash();
        debug!("global hash: {}", global_hash);
        global_hash
    }
}
