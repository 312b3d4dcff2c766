#![deny(clippy::all)]

//! Fingerprint computation for the task runner.
//!
//! Every input that can affect a task's output is gathered into one of the
//! hashable structs below, serialized with the canonical encoding, and
//! digested to a 16-hex-char fingerprint. Same inputs, same bytes, same hash,
//! on every machine.

mod canonical;
mod traits;

use std::collections::{BTreeMap, HashMap};

pub use canonical::CanonicalEncoder;
use torquepath::RelativeUnixPathBuf;
pub use traits::TorqueHash;

/// Versions the hash schema. Changing it invalidates every cache entry
/// repo-wide, which is exactly the point.
pub const GLOBAL_CACHE_KEY: &str =
    "Buffalo buffalo Buffalo buffalo buffalo buffalo Buffalo buffalo";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

/// Content hashes keyed by unix-relative path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileHashes(pub HashMap<RelativeUnixPathBuf, String>);

/// The pipeline in canonical form: task name to the serialized rule, ordered
/// by task name.
#[derive(Debug, Default, Clone)]
pub struct PristinePipeline(pub BTreeMap<String, String>);

/// Everything that feeds a single task's fingerprint.
#[derive(Debug)]
pub struct TaskHashable<'a> {
    // hashes
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub hash_of_files: &'a str,
    pub external_deps_hash: &'a str,

    // task
    pub package_dir: RelativeUnixPathBuf,
    pub task: &'a str,
    pub outputs: TaskOutputs,
    pub pass_through_args: &'a [String],

    // env
    pub env: &'a [String],
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: &'a [String],
}

/// Everything shared by all tasks in a run.
#[derive(Debug)]
pub struct GlobalHashable<'a> {
    pub global_cache_key: &'static str,
    pub global_file_hash_map: &'a HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: &'a str,
    pub env: &'a [String],
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: &'a [String],
    pub pipeline: PristinePipeline,
}

impl TorqueHash for TaskOutputs {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut encoder = CanonicalEncoder::new();
        encoder
            .field(0)
            .string_list(&self.inclusions)
            .field(1)
            .string_list(&self.exclusions);
        encoder.finish()
    }
}

impl TorqueHash for FileHashes {
    fn canonical_bytes(&self) -> Vec<u8> {
        let entries: Vec<(&str, &str)> = self
            .0
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        let mut encoder = CanonicalEncoder::new();
        encoder.field(0).string_map(&entries);
        encoder.finish()
    }
}

impl TorqueHash for TaskHashable<'_> {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut encoder = CanonicalEncoder::new();
        encoder
            .field(0)
            .string(self.global_hash)
            .field(1)
            .string_list(&self.task_dependency_hashes)
            .field(2)
            .string(self.hash_of_files)
            .field(3)
            .string(self.external_deps_hash)
            .field(4)
            .string(self.package_dir.as_str())
            .field(5)
            .string(self.task)
            .field(6)
            .string_list(&self.outputs.inclusions)
            .field(7)
            .string_list(&self.outputs.exclusions)
            .field(8)
            .string_list(self.pass_through_args)
            .field(9)
            .string_list(self.env)
            .field(10)
            .string_list(&self.resolved_env_vars)
            .field(11)
            .string_list(self.pass_through_env);
        encoder.finish()
    }
}

impl TorqueHash for GlobalHashable<'_> {
    fn canonical_bytes(&self) -> Vec<u8> {
        let file_entries: Vec<(&str, &str)> = self
            .global_file_hash_map
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        let pipeline_entries: Vec<(&str, &str)> = self
            .pipeline
            .0
            .iter()
            .map(|(task, rule)| (task.as_str(), rule.as_str()))
            .collect();

        let mut encoder = CanonicalEncoder::new();
        encoder
            .field(0)
            .string(self.global_cache_key)
            .field(1)
            .string_map(&file_entries)
            .field(2)
            .string(self.root_external_deps_hash)
            .field(3)
            .string_list(self.env)
            .field(4)
            .string_list(&self.resolved_env_vars)
            .field(5)
            .string_list(self.pass_through_env)
            .field(6)
            .string_map(&pipeline_entries);
        encoder.finish()
    }
}
