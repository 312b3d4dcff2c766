//! Glob expansion over a directory tree, as used for task inputs, task
//! outputs, and the global file dependencies.

use thiserror::Error;
use torquepath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("bad glob pattern: {0}")]
    BadPattern(#[from] globwalk::GlobError),
    #[error("walk error: {0}")]
    WalkDir(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] torquepath::PathError),
}

/// Yields the files under `base_path` matched by the inclusion globs and not
/// matched by the exclusion globs. Results are sorted so callers see a
/// deterministic order.
pub fn globwalk_files(
    base_path: &AbsoluteSystemPath,
    inclusions: &[String],
    exclusions: &[String],
) -> Result<Vec<AbsoluteSystemPathBuf>, WalkError> {
    if inclusions.is_empty() {
        return Ok(Vec::new());
    }

    let patterns: Vec<String> = inclusions
        .iter()
        .cloned()
        .chain(exclusions.iter().map(|glob| format!("!{glob}")))
        .collect();

    let walker = globwalk::GlobWalkerBuilder::from_patterns(base_path.as_std_path(), &patterns)
        .file_type(globwalk::FileType::FILE)
        .follow_links(false)
        .build()?;

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        files.push(AbsoluteSystemPathBuf::try_from(entry.into_path())?);
    }
    files.sort();

    Ok(files)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn fixture() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf)> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?.to_owned();
        root.join_component("src").create_dir_all()?;
        root.join_components(&["src", "main.ts"])
            .create_with_contents("export {}")?;
        root.join_components(&["src", "main.test.ts"])
            .create_with_contents("test")?;
        root.join_component("README.md").create_with_contents("#")?;
        Ok((dir, root))
    }

    #[test]
    fn test_inclusions_and_exclusions() -> Result<()> {
        let (_dir, root) = fixture()?;
        let files = globwalk_files(
            &root,
            &["src/**".to_string()],
            &["src/**/*.test.ts".to_string()],
        )?;
        let names: Vec<_> = files
            .iter()
            .map(|f| root.anchor(f).unwrap().to_unix().as_str().to_string())
            .collect();
        assert_eq!(names, vec!["src/main.ts"]);
        Ok(())
    }

    #[test]
    fn test_empty_inclusions_match_nothing() -> Result<()> {
        let (_dir, root) = fixture()?;
        let files = globwalk_files(&root, &[], &[])?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_results_are_sorted() -> Result<()> {
        let (_dir, root) = fixture()?;
        let files = globwalk_files(&root, &["**/*".to_string()], &[])?;
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
        Ok(())
    }
}
