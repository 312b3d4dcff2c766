use camino::Utf8Path;
use torquepath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tracing::debug;

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheMetadata, CacheSource,
};

/// The filesystem cache layer: one `{hash}.tar.zst` plus one
/// `{hash}-meta.json` per entry, under the configured cache directory.
pub struct FsCache {
    cache_directory: AbsoluteSystemPathBuf,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(cache_dir: &Utf8Path, repo_root: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;

        Ok(FsCache { cache_directory })
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let uncompressed = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        if !uncompressed.exists() && !compressed.exists() {
            return Ok(None);
        }

        // A missing or unreadable metadata file downgrades the time-saved
        // estimate, not the hit.
        let duration = CacheMetadata::read(
            &self
                .cache_directory
                .join_component(&format!("{hash}-meta.json")),
        )
        .map(|meta| meta.duration)
        .unwrap_or(0);

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let uncompressed_cache_path = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed_cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let cache_path = if uncompressed_cache_path.exists() {
            uncompressed_cache_path
        } else if compressed_cache_path.exists() {
            compressed_cache_path
        } else {
            debug!("cache miss for {hash} in {}", self.cache_directory);
            return Ok(None);
        };

        let mut cache_reader = CacheReader::open(&cache_path)?;
        let restored_files = cache_reader.restore(anchor)?;

        let meta = CacheMetadata::read(
            &self
                .cache_directory
                .join_component(&format!("{hash}-meta.json")),
        )?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            restored_files,
        )))
    }

    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let mut cache_item = CacheWriter::create(&cache_path)?;

        for file in files {
            cache_item.add_file(anchor, file)?;
        }

        // Atomic rename from the temp file happens here.
        cache_item.finish()?;

        let metadata_path = self
            .cache_directory
            .join_component(&format!("{hash}-meta.json"));

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };

        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        // Same write-to-temp-then-rename pattern as the archive itself.
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));

        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&metadata_path)?;

        Ok(())
    }
}
