#![deny(clippy::all)]

//! The task cache.
//!
//! A cache entry is keyed by a task fingerprint and holds the task's output
//! files plus its captured log, stored as a zstd-compressed tarball next to a
//! small metadata record. The filesystem layer is always cheap to consult;
//! an optional remote layer sits behind [`RemoteClient`] and is consulted
//! after the local one. Writes are funneled through [`AsyncCache`] so tasks
//! never wait on cache uploads.

mod async_cache;
/// Archive creation and restoration.
pub mod cache_archive;
/// File system cache.
pub mod fs;
/// A wrapper that multiplexes the file system and remote layers.
mod multiplexer;
/// The remote layer and its transport seam.
pub mod remote;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String),
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    #[error("attempted to store unsupported file type: {0}")]
    CreateUnsupportedFileType(String),
    #[error("tar file is malformed")]
    MalformedTar,
    #[error("Invalid cache metadata file")]
    InvalidMetadata(serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(serde_json::Error),
    #[error("Invalid file path: {0}")]
    Path(#[from] torquepath::PathError),
    #[error("failed to contact remote cache: {0}")]
    Remote(String),
    #[error("remote caching is disabled")]
    RemoteDisabled,
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub remote_cache_read_only: bool,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub workers: u32,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".turbo/cache"),
            remote_cache_read_only: false,
            skip_remote: true,
            skip_filesystem: false,
            workers: 8,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct CacheMetadata {
    pub hash: String,
    pub duration: u64,
}
