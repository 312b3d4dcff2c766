use std::{borrow::Borrow, fmt, ops::Deref, path::Path};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{AnchoredSystemPath, PathError};

/// An owned path relative to some anchor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPathBuf {
    pub fn from_raw(value: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path: Utf8PathBuf = value.into();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let path = Utf8Path::from_path(path)
            .ok_or_else(|| PathError::InvalidUtf8(path.to_path_buf()))?;
        Self::from_raw(path.to_path_buf())
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        AnchoredSystemPath::new_unchecked(&self.0)
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self.deref()
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.deref()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for AnchoredSystemPathBuf {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}
