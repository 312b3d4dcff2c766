use std::sync::Arc;

use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

/// The transport seam for remote caching. The engine only ever moves opaque
/// artifact bytes across it; an HTTP (or any other) transport lives behind
/// this trait, outside the engine.
pub trait RemoteClient: Send + Sync {
    /// Returns the recorded duration when the artifact exists.
    fn exists(&self, hash: &str) -> Result<Option<u64>, CacheError>;
    /// Returns the recorded duration and the artifact body.
    fn fetch(&self, hash: &str) -> Result<Option<(u64, Vec<u8>)>, CacheError>;
    fn put(&self, hash: &str, duration: u64, artifact: &[u8]) -> Result<(), CacheError>;
}

/// The remote cache layer: packs outputs into a compressed archive in memory
/// and hands the bytes to the transport.
pub struct RemoteCache {
    client: Arc<dyn RemoteClient>,
    read_only: bool,
}

impl RemoteCache {
    pub fn new(client: Arc<dyn RemoteClient>, read_only: bool) -> Self {
        Self { client, read_only }
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        Ok(self.client.exists(hash)?.map(|time_saved| CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved,
        }))
    }

    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some((time_saved, body)) = self.client.fetch(hash)? else {
            return Ok(None);
        };

        let mut reader = CacheReader::from_reader(body.as_slice(), true)?;
        let restored = reader.restore(anchor)?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved,
            },
            restored,
        )))
    }

    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if self.read_only {
            return Ok(());
        }

        let mut body = Vec::new();
        {
            let mut writer = CacheWriter::from_writer(&mut body, true)?;
            for file in files {
                writer.add_file(anchor, file)?;
            }
            writer.finish()?;
        }

        self.client.put(hash, duration, &body)
    }
}

#[cfg(test)]
pub mod test_client {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use super::*;

    /// In-memory transport used to exercise the remote layer and the
    /// multiplexer without a network.
    #[derive(Default)]
    pub struct InMemoryClient {
        artifacts: Mutex<HashMap<String, (u64, Vec<u8>)>>,
        pub fail_puts: Mutex<Option<CacheError>>,
    }

    impl InMemoryClient {
        pub fn artifact_count(&self) -> usize {
            self.artifacts.lock().unwrap().len()
        }
    }

    impl RemoteClient for InMemoryClient {
        fn exists(&self, hash: &str) -> Result<Option<u64>, CacheError> {
            Ok(self
                .artifacts
                .lock()
                .unwrap()
                .get(hash)
                .map(|(duration, _)| *duration))
        }

        fn fetch(&self, hash: &str) -> Result<Option<(u64, Vec<u8>)>, CacheError> {
            Ok(self.artifacts.lock().unwrap().get(hash).cloned())
        }

        fn put(&self, hash: &str, duration: u64, artifact: &[u8]) -> Result<(), CacheError> {
            if let Some(err) = self.fail_puts.lock().unwrap().take() {
                return Err(err);
            }
            self.artifacts
                .lock()
                .unwrap()
                .insert(hash.to_string(), (duration, artifact.to_vec()));
            Ok(())
        }
    }
}
