use std::{borrow::Borrow, fmt, ops::Deref, path::PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path, analogous to `PathBuf`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path: Utf8PathBuf = value.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        Self::try_from(cwd)
    }

    /// Resolves `unknown` against `base`: absolute paths are taken as-is,
    /// relative ones are joined onto `base`.
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl AsRef<Utf8Path>) -> Self {
        let unknown = unknown.as_ref();
        if unknown.is_absolute() {
            Self(unknown.to_path_buf())
        } else {
            Self(Utf8Path::new(base.as_str()).join(unknown))
        }
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        let path =
            Utf8PathBuf::from_path_buf(path).map_err(|p| PathError::InvalidUtf8(p.clone()))?;
        Self::new(path)
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.deref()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.deref()
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for AbsoluteSystemPathBuf {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}
