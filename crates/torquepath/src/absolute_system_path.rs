use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io,
    path::Path,
};

use camino::Utf8Path;

use crate::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

/// A borrowed absolute path, analogous to `Path`.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl AbsoluteSystemPath {
    /// Validates that the given string is an absolute path and borrows it.
    pub fn new(value: &str) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value);
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(value.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path)
            .ok_or_else(|| PathError::InvalidUtf8(path.to_path_buf()))?;
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // Safety: Self is repr(transparent) over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.to_path_buf())
    }

    /// Joins a single path component. The component must not contain a
    /// separator, although this is not checked.
    pub fn join_component(&self, component: &str) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(component))
    }

    pub fn join_components(&self, components: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for component in components {
            path.push(component);
        }
        AbsoluteSystemPathBuf::new_unchecked(path)
    }

    /// Expresses `path` relative to `self`. Errors if `path` is not a
    /// descendant of `self`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = path
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotParent(self.to_string(), path.to_string()))?;
        Ok(AnchoredSystemPathBuf::new_unchecked(stripped.to_path_buf()))
    }

    /// Joins an anchored path onto `self`.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(path.as_str()))
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn create_dir_all(&self) -> io::Result<()> {
        fs::create_dir_all(&self.0)
    }

    /// Creates the parent directory of this path if it does not exist.
    pub fn ensure_dir(&self) -> io::Result<()> {
        match self.0.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }

    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> io::Result<()> {
        fs::write(&self.0, contents)
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        fs::read_to_string(&self.0)
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.0)
    }

    pub fn open_with_options(&self, options: OpenOptions) -> io::Result<File> {
        options.open(&self.0)
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> io::Result<()> {
        fs::rename(&self.0, &to.0)
    }

    pub fn remove_file(&self) -> io::Result<()> {
        fs::remove_file(&self.0)
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}
