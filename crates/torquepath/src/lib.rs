//! Typed filesystem paths.
//!
//! Mixing up repo-relative and absolute paths is the most common source of
//! cache corruption in a task runner, so the distinction is enforced at the
//! type level:
//!
//! - [`AbsoluteSystemPath`] / [`AbsoluteSystemPathBuf`]: absolute paths in
//!   the system's separator convention.
//! - [`AnchoredSystemPath`] / [`AnchoredSystemPathBuf`]: paths relative to a
//!   known anchor (almost always the repo root or a package directory), in
//!   the system's separator convention.
//! - [`RelativeUnixPathBuf`]: anchored paths with `/` separators. These are
//!   the only paths that may enter a hash, so fingerprints agree across
//!   platforms.
//!
//! All paths are required to be valid UTF-8.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path_buf;

use std::path::PathBuf;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path_buf::RelativeUnixPathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path is not valid UTF-8: {0}")]
    InvalidUtf8(PathBuf),
    #[error("path {0} is not a prefix of {1}")]
    NotParent(String, String),
    #[error("io error while canonicalizing: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_anchor_and_resolve_round_trip() -> anyhow::Result<()> {
        let root = AbsoluteSystemPathBuf::new("/repo")?;
        let file = root.join_components(&["packages", "util", "index.js"]);
        let anchored = root.anchor(&file)?;
        assert_eq!(anchored.as_str(), "packages/util/index.js");
        assert_eq!(root.resolve(&anchored), file);
        Ok(())
    }

    #[test]
    fn test_anchor_rejects_non_descendant() -> anyhow::Result<()> {
        let root = AbsoluteSystemPathBuf::new("/repo")?;
        let outside = AbsoluteSystemPathBuf::new("/elsewhere/file")?;
        assert!(root.anchor(&outside).is_err());
        Ok(())
    }

    #[test]
    fn test_absolute_validation() {
        assert!(AbsoluteSystemPathBuf::new("relative/path").is_err());
        assert!(AnchoredSystemPathBuf::from_raw("/absolute/path").is_err());
        assert!(RelativeUnixPathBuf::new("/absolute").is_err());
    }
}
