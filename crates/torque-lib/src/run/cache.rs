use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::Arc,
};

use thiserror::Error;
use torque_cache::{AsyncCache, CacheError, CacheHitMetadata};
use torque_ui::{replay_logs, ColorSelector, PrefixedUI};
use torquepath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};
use tracing::{debug, warn};

use crate::{
    globwalk::globwalk_files,
    opts::RunCacheOpts,
    task_graph::{task_log_filename, OutputLogsMode, TaskDefinition, TaskOutputs},
    task_id::TaskId,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Ui(#[from] torque_ui::Error),
    #[error(transparent)]
    Path(#[from] torquepath::PathError),
    #[error(transparent)]
    Walk(#[from] crate::globwalk::WalkError),
    #[error("cannot open log file: {0}")]
    LogFile(#[source] std::io::Error),
}

/// Run-wide cache state shared by every task's [`TaskCache`].
pub struct RunCache {
    task_output_logs_override: Option<OutputLogsMode>,
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
    color_selector: ColorSelector,
}

impl RunCache {
    pub fn new(
        cache: AsyncCache,
        repo_root: &AbsoluteSystemPath,
        opts: &RunCacheOpts,
        color_selector: ColorSelector,
    ) -> Self {
        RunCache {
            task_output_logs_override: opts.task_output_logs_override,
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
            color_selector,
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        workspace_dir: &AnchoredSystemPath,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let log_file_path = self
            .repo_root
            .resolve(workspace_dir)
            .join_component(&task_log_filename(task_id.task()));
        let hashable_outputs = task_definition.hashable_outputs(&task_id);
        let mut repo_relative_globs = TaskOutputs {
            inclusions: Vec::with_capacity(hashable_outputs.inclusions.len()),
            exclusions: Vec::with_capacity(hashable_outputs.exclusions.len()),
        };

        for output in hashable_outputs.inclusions {
            let inclusion_glob = workspace_dir.join_component(&output);
            repo_relative_globs
                .inclusions
                .push(inclusion_glob.to_unix().as_str().to_string());
        }

        for output in hashable_outputs.exclusions {
            let exclusion_glob = workspace_dir.join_component(&output);
            repo_relative_globs
                .exclusions
                .push(exclusion_glob.to_unix().as_str().to_string());
        }

        let task_output_logs = self
            .task_output_logs_override
            .unwrap_or(task_definition.output_logs);

        let caching_disabled = !task_definition.cache;

        TaskCache {
            expanded_outputs: Vec::new(),
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_owned(),
            task_id,
            task_output_logs,
            caching_disabled,
            log_file_path,
        }
    }

    pub fn color_selector(&self) -> &ColorSelector {
        &self.color_selector
    }

    /// Flushes pending cache writes; bounded, called once at end of run.
    pub async fn shutdown_cache(&self) {
        self.cache.shutdown().await;
    }
}

/// The cache gate for a single task attempt.
pub struct TaskCache {
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    /// Probes the cache without restoring anything, for the summary record.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, CacheError> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        self.run_cache.cache.exists(&self.hash).await
    }

    /// Attempts to restore this task's outputs. A hit replays captured logs
    /// per the task's output mode; read failures degrade to a miss.
    pub async fn restore_outputs<W: Write>(
        &mut self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(self.task_output_logs, OutputLogsMode::None) {
                prefixed_ui.output(format!("cache bypass, force executing {}", self.hash));
            }
            return Ok(None);
        }

        let restore = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await
            .unwrap_or_else(|err| {
                warn!("failed to restore outputs for {}: {err}", self.task_id);
                None
            });

        let Some((hit, restored_files)) = restore else {
            if !matches!(self.task_output_logs, OutputLogsMode::None) {
                prefixed_ui.output(format!("cache miss, executing {}", self.hash));
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_logs {
            OutputLogsMode::Full => {
                prefixed_ui.output(format!("cache hit, replaying output {}", self.hash));
                replay_logs(prefixed_ui.output_prefixed_writer(), &self.log_file_path)?;
            }
            OutputLogsMode::HashOnly => {
                prefixed_ui.output(format!("cache hit, suppressing output {}", self.hash));
            }
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => (),
        }

        Ok(Some(hit))
    }

    /// Invoked when the task failed: in errors-only mode the buffered log is
    /// the only place the output exists, so replay it for visibility.
    pub fn on_error<W: Write>(&self, prefixed_ui: &mut PrefixedUI<W>) -> Result<(), Error> {
        if matches!(self.task_output_logs, OutputLogsMode::ErrorsOnly) {
            prefixed_ui.output(format!("cache miss, executing {}", self.hash));
            replay_logs(prefixed_ui.output_prefixed_writer(), &self.log_file_path)?;
        }
        Ok(())
    }

    /// A writer that tees child output to the on-disk log for this entry
    /// and, in streaming modes, the terminal.
    pub fn output_writer<W: Write>(&self, terminal: W) -> Result<LogWriter<W>, Error> {
        let log_file = if self.caching_disabled {
            None
        } else {
            self.log_file_path.ensure_dir().map_err(Error::LogFile)?;
            let file =
                File::create(self.log_file_path.as_std_path()).map_err(Error::LogFile)?;
            Some(BufWriter::new(file))
        };

        let terminal = matches!(self.task_output_logs, OutputLogsMode::Full).then_some(terminal);

        Ok(LogWriter { log_file, terminal })
    }

    /// Stores the expanded outputs after a zero exit. Failures here are the
    /// caller's to log; they never fail the task.
    pub async fn save_outputs(&mut self, duration: u64) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        debug!("caching outputs: {:?}", self.repo_relative_globs);

        let mut files = Vec::new();
        for file in globwalk_files(
            &self.run_cache.repo_root,
            &self.repo_relative_globs.inclusions,
            &self.repo_relative_globs.exclusions,
        )? {
            files.push(self.run_cache.repo_root.anchor(&file)?);
        }

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                &self.hash,
                files.clone(),
                duration,
            )
            .await?;

        self.expanded_outputs = files;

        Ok(())
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Tees task output to the captured log and optionally the terminal.
pub struct LogWriter<W> {
    log_file: Option<BufWriter<File>>,
    terminal: Option<W>,
}

impl<W: Write> Write for LogWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(log_file) = &mut self.log_file {
            log_file.write_all(buf)?;
        }
        if let Some(terminal) = &mut self.terminal {
            terminal.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(log_file) = &mut self.log_file {
            log_file.flush()?;
        }
        if let Some(terminal) = &mut self.terminal {
            terminal.flush()?;
        }
        Ok(())
    }
}
