use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use torquepath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Counter folded into temp filenames so concurrent tasks in one process
/// never collide; the PID handles collisions across processes.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache");
    let unique_id = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique_id);
    final_path
        .parent()
        .expect("cache path has a parent directory")
        .join_component(&temp_name)
}

/// Writes a cache archive: tar, optionally through zstd, into a temp file
/// that is atomically renamed into place on [`CacheWriter::finish`].
/// Concurrent readers see either the complete old archive or the complete
/// new one, never a torn write.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        // finish() was never called; don't leave the temp file behind.
        if let Some(temp_path) = self.temp_path.take() {
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    /// Writes the archive into the given writer instead of a file.
    /// Compression is decided by the flag since there is no extension to
    /// look at.
    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        let inner: Box<dyn Write + 'a> = if use_compression {
            Box::new(zstd::Encoder::new(writer, 0)?.auto_finish())
        } else {
            Box::new(writer)
        };
        Ok(CacheWriter {
            builder: tar::Builder::new(inner),
            temp_path: None,
            final_path: None,
        })
    }

    /// Creates a new archive at the given path. Compressed when the path
    /// ends in `.zst`.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let file = temp_path.open_with_options(options)?;

        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let writer: Box<dyn Write> = if path.extension() == Some("zst") {
            Box::new(zstd::Encoder::new(file_buffer, 0)?.auto_finish())
        } else {
            Box::new(file_buffer)
        };

        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    /// Adds `file` (anchored at `anchor`) to the archive. Directories are
    /// recorded as directory entries; anything that is not a regular file or
    /// directory is refused.
    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file);
        let meta = std::fs::symlink_metadata(source_path.as_std_path())?;

        let mut header = tar::Header::new_gnu();
        if meta.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_metadata(&meta);
            self.builder
                .append_data(&mut header, file.as_std_path(), std::io::empty())?;
        } else if meta.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            header.set_metadata(&meta);
            let body = source_path.open()?;
            self.builder
                .append_data(&mut header, file.as_std_path(), body)?;
        } else {
            return Err(CacheError::CreateUnsupportedFileType(file.to_string()));
        }

        Ok(())
    }

    /// Finishes the archive and, for file-backed writers, atomically renames
    /// the temp file to its final path.
    pub fn finish(mut self) -> Result<(), CacheError> {
        self.builder.finish()?;

        // Taking the paths up front means Drop won't delete a successfully
        // renamed archive, and will clean up if the rename fails.
        if let (Some(temp_path), Some(final_path)) = (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        Ok(())
    }
}
