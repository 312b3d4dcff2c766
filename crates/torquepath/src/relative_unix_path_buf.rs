use std::fmt;

use serde::Serialize;

use crate::PathError;

/// An anchored path with `/` separators regardless of platform. The only
/// path representation that participates in hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let path = value.into();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path));
        }
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: String) -> Self {
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
