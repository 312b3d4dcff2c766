use std::{fmt, path::Path};

use camino::Utf8Path;

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// A borrowed path relative to some anchor, typically the repo root.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

impl AnchoredSystemPath {
    pub fn new(value: &str) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value);
        if path.is_absolute() {
            return Err(PathError::NotRelative(value.to_string()));
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

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(self.0.to_path_buf())
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn join_component(&self, component: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(self.0.join(component))
    }

    /// Converts to the unix separator convention used for hashing.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        let unix = if std::path::MAIN_SEPARATOR == '/' {
            self.0.as_str().to_string()
        } else {
            self.0.as_str().replace(std::path::MAIN_SEPARATOR, "/")
        };
        RelativeUnixPathBuf::new_unchecked(unix)
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
