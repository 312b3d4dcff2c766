use std::{
    io::Read,
    path::{Component, Path},
};

use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::CacheError;

/// Reads a cache archive and restores its contents under an anchor
/// directory.
pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };

        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        let is_compressed = path.extension() == Some("zst");

        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(file)
        };

        Ok(CacheReader { reader })
    }

    /// Restores every entry under `anchor`, returning the anchored paths
    /// that were written. Parent directories are created as needed, so the
    /// archive does not have to enumerate them.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut tr = tar::Archive::new(&mut self.reader);

        for entry in tr.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path().map_err(|_| CacheError::MalformedTar)?;
            let anchored = validated_entry_path(&entry_path)?;
            let target = anchor.resolve(&anchored);

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    target.create_dir_all()?;
                }
                tar::EntryType::Regular => {
                    target.ensure_dir()?;
                    let mut file = std::fs::File::create(target.as_std_path())?;
                    std::io::copy(&mut entry, &mut file)?;
                    #[cfg(unix)]
                    {
                        use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                        if let Ok(mode) = entry.header().mode() {
                            file.set_permissions(Permissions::from_mode(mode))?;
                        }
                    }
                }
                entry_type => {
                    return Err(CacheError::RestoreUnsupportedFileType(entry_type));
                }
            }

            restored.push(anchored);
        }

        Ok(restored)
    }
}

/// Refuses absolute entry paths and paths that climb out of the anchor.
fn validated_entry_path(path: &Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(CacheError::LinkOutsideOfDirectory(
                    path.to_string_lossy().into_owned(),
                ));
            }
            Component::CurDir | Component::Normal(_) => (),
        }
    }
    AnchoredSystemPathBuf::from_system_path(path)
        .map_err(|_| CacheError::InvalidFilePath(path.to_string_lossy().into_owned()))
}
