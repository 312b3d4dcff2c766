use std::{sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use torquepath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tracing::warn;

use crate::{
    multiplexer::CacheMultiplexer, remote::RemoteClient, CacheError, CacheHitMetadata, CacheOpts,
};

/// Cache writes may outlive their task but must not outlive the run: the
/// shutdown wait is bounded by this, and whatever has not flushed by then is
/// abandoned (and logged).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);

struct WriteRequest {
    anchor: AbsoluteSystemPathBuf,
    key: String,
    files: Vec<AnchoredSystemPathBuf>,
    duration: u64,
}

/// Front of the cache used by the run: reads pass straight through, writes
/// are queued onto a bounded worker pool so a task's completion never waits
/// on an upload.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: std::sync::Mutex<Option<mpsc::Sender<WriteRequest>>>,
    worker_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        remote_client: Option<Arc<dyn RemoteClient>>,
    ) -> Result<Self, CacheError> {
        let real_cache = Arc::new(CacheMultiplexer::new(opts, repo_root, remote_client)?);
        let max_workers = opts.workers.max(1) as usize;
        let (writer_sender, mut write_consumer) = mpsc::channel::<WriteRequest>(max_workers);

        let worker_cache = real_cache.clone();
        let worker_handle = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(max_workers));
            let mut workers = FuturesUnordered::new();

            while let Some(request) = write_consumer.recv().await {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("cache write semaphore lives as long as the pool");
                let cache = worker_cache.clone();
                workers.push(tokio::task::spawn_blocking(move || {
                    let WriteRequest {
                        anchor,
                        key,
                        files,
                        duration,
                    } = request;
                    if let Err(err) = cache.put(&anchor, &key, &files, duration) {
                        warn!("failed to store {key} in cache: {err}");
                    }
                    drop(permit);
                }));
            }

            // Channel closed: drain the in-flight writes.
            while let Some(result) = workers.next().await {
                if result.is_err() {
                    warn!("cache write worker panicked");
                }
            }
        });

        Ok(AsyncCache {
            real_cache,
            writer_sender: std::sync::Mutex::new(Some(writer_sender)),
            worker_handle: std::sync::Mutex::new(Some(worker_handle)),
        })
    }

    /// Queues the outputs for storage. Only to be called after the task
    /// exited zero.
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        key: &str,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        let sender = self
            .writer_sender
            .lock()
            .expect("cache sender lock poisoned")
            .clone()
            .ok_or(CacheError::CacheShuttingDown)?;
        sender
            .send(WriteRequest {
                anchor,
                key: key.to_string(),
                files,
                duration,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let cache = self.real_cache.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.exists(&key))
            .await
            .expect("cache existence check panicked")
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let cache = self.real_cache.clone();
        let anchor = anchor.to_owned();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.fetch(&anchor, &key))
            .await
            .expect("cache fetch panicked")
    }

    /// Flushes pending writes, waiting at most 1,500 ms. Writes queued
    /// after this point are refused with `CacheShuttingDown`. Called once
    /// at the end of a run; a second call is a bug and is logged as one.
    pub async fn shutdown(&self) {
        // Closing the channel is what lets the worker loop wind down.
        let sender = self
            .writer_sender
            .lock()
            .expect("cache sender lock poisoned")
            .take();
        let handle = self
            .worker_handle
            .lock()
            .expect("cache worker lock poisoned")
            .take();

        let (Some(sender), Some(handle)) = (sender, handle) else {
            warn!("cache shutdown requested more than once");
            return;
        };
        drop(sender);

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            warn!("timed out waiting for cache write requests to finish");
        }
    }
}
