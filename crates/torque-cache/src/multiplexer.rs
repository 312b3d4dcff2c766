use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use tracing::warn;

use crate::{
    fs::FsCache, remote::RemoteCache, remote::RemoteClient, CacheError, CacheHitMetadata,
    CacheOpts,
};

/// Reads and writes through the filesystem and remote layers, local first.
pub struct CacheMultiplexer {
    fs: Option<FsCache>,
    remote: Option<RemoteCache>,
    // The remote can announce mid-run that caching is disabled; after that
    // we stop talking to it.
    remote_disabled: AtomicBool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        remote_client: Option<Arc<dyn RemoteClient>>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_remote_cache = !opts.skip_remote;

        // The two skip flags are not mutually exclusive, so it is possible
        // to configure yourself out of having a cache at all. Worth a
        // warning, not worth failing the build.
        if !use_fs_cache && !use_remote_cache {
            warn!("no caches are enabled");
        }

        let fs_cache = use_fs_cache
            .then(|| FsCache::new(&opts.cache_dir, repo_root))
            .transpose()?;

        let remote_cache = match (use_remote_cache, remote_client) {
            (true, Some(client)) => Some(RemoteCache::new(client, opts.remote_cache_read_only)),
            _ => None,
        };

        Ok(CacheMultiplexer {
            fs: fs_cache,
            remote: remote_cache,
            remote_disabled: AtomicBool::new(false),
        })
    }

    fn remote(&self) -> Option<&RemoteCache> {
        if self.remote_disabled.load(Ordering::Acquire) {
            return None;
        }
        self.remote.as_ref()
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.exists(hash)? {
                return Ok(Some(hit));
            }
        }

        if let Some(remote) = self.remote() {
            match remote.exists(hash) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => (),
                // Transport trouble reads as a miss.
                Err(err) => warn!("failed to check remote cache: {err}"),
            }
        }

        Ok(None)
    }

    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.fetch(anchor, hash)? {
                return Ok(Some(hit));
            }
        }

        if let Some(remote) = self.remote() {
            match remote.fetch(anchor, hash) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => (),
                Err(err) => warn!("failed to fetch from remote cache: {err}"),
            }
        }

        Ok(None)
    }

    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if let Some(fs) = &self.fs {
            fs.put(anchor, hash, files, duration)?;
        }

        if let Some(remote) = self.remote() {
            match remote.put(anchor, hash, files, duration) {
                Ok(()) => (),
                Err(CacheError::RemoteDisabled) => {
                    warn!("failed to put to remote cache: cache disabled");
                    self.remote_disabled.store(true, Ordering::Release);
                }
                // Remote write failures never fail the task.
                Err(err) => warn!("failed to put to remote cache: {err}"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    use super::*;
    use crate::remote::test_client::InMemoryClient;

    fn opts() -> CacheOpts {
        CacheOpts {
            cache_dir: Utf8PathBuf::from("cache"),
            skip_remote: false,
            ..CacheOpts::default()
        }
    }

    #[test]
    fn test_put_reaches_both_layers() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("hi")?;

        let client = Arc::new(InMemoryClient::default());
        let cache = CacheMultiplexer::new(&opts(), repo_root_path, Some(client.clone()))?;

        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];
        cache.put(repo_root_path, "0123456789abcdef", &files, 5)?;

        assert_eq!(client.artifact_count(), 1);
        assert!(repo_root_path
            .join_components(&["cache", "0123456789abcdef.tar.zst"])
            .exists());
        Ok(())
    }

    #[test]
    fn test_local_consulted_before_remote() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("hi")?;

        let client = Arc::new(InMemoryClient::default());
        let cache = CacheMultiplexer::new(&opts(), repo_root_path, Some(client))?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];
        cache.put(repo_root_path, "0123456789abcdef", &files, 5)?;

        let hit = cache.exists("0123456789abcdef")?.unwrap();
        assert_eq!(hit.source, crate::CacheSource::Local);
        Ok(())
    }

    #[test]
    fn test_remote_disabled_after_disabled_error() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPath::from_std_path(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("hi")?;

        let client = Arc::new(InMemoryClient::default());
        *client.fail_puts.lock().unwrap() = Some(CacheError::RemoteDisabled);

        let cache = CacheMultiplexer::new(&opts(), repo_root_path, Some(client.clone()))?;
        let files = vec![AnchoredSystemPathBuf::from_raw("out.txt")?];

        cache.put(repo_root_path, "0123456789abcdef", &files, 5)?;
        cache.put(repo_root_path, "fedcba9876543210", &files, 5)?;

        // First put tripped the disable; the second never reached the
        // transport.
        assert_eq!(client.artifact_count(), 0);
        Ok(())
    }
}
