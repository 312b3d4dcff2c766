use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use serde::Serialize;
use torquepath::AnchoredSystemPathBuf;

use crate::task_id::ROOT_PKG_NAME;

/// A package name. The repo root is its own reserved name so root tasks can
/// participate in the graph like any other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageName::Root => f.write_str(ROOT_PKG_NAME),
            PackageName::Other(name) => f.write_str(name),
        }
    }
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// One already-discovered package: where it lives, the scripts it declares,
/// and the digest of its external dependencies. Discovery itself (manifest
/// and lockfile parsing) happens upstream of the engine.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceInfo {
    pub package_dir: AnchoredSystemPathBuf,
    pub scripts: BTreeMap<String, String>,
    pub external_deps_hash: String,
}

impl WorkspaceInfo {
    pub fn command(&self, task: &str) -> Option<&str> {
        self.scripts.get(task).map(String::as_str)
    }
}

/// The package set for a run.
#[derive(Debug, Default)]
pub struct WorkspaceCatalog {
    workspaces: HashMap<PackageName, WorkspaceInfo>,
}

impl WorkspaceCatalog {
    pub fn insert(&mut self, name: PackageName, info: WorkspaceInfo) {
        self.workspaces.insert(name, info);
    }

    pub fn workspace_info(&self, name: &PackageName) -> Option<&WorkspaceInfo> {
        self.workspaces.get(name)
    }

    pub fn root_external_deps_hash(&self) -> &str {
        self.workspaces
            .get(&PackageName::Root)
            .map(|info| info.external_deps_hash.as_str())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}
