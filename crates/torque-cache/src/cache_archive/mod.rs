mod create;
mod restore;

pub use create::CacheWriter;
pub use restore::CacheReader;

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use torquepath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

    use super::*;

    #[test]
    fn test_round_trip() -> Result<()> {
        let src_dir = tempdir()?;
        let src = AbsoluteSystemPath::from_std_path(src_dir.path())?;
        src.join_component("dist").create_dir_all()?;
        src.join_components(&["dist", "index.js"])
            .create_with_contents("console.log('hi');\n")?;
        src.join_component("log.txt")
            .create_with_contents("captured output\n")?;

        let archive_path = src.join_component("artifact.tar.zst");
        let mut writer = CacheWriter::create(&archive_path)?;
        writer.add_file(src, &AnchoredSystemPathBuf::from_raw("dist/index.js")?)?;
        writer.add_file(src, &AnchoredSystemPathBuf::from_raw("log.txt")?)?;
        writer.finish()?;

        let dst_dir = tempdir()?;
        let dst = AbsoluteSystemPath::from_std_path(dst_dir.path())?;
        let mut reader = CacheReader::open(&archive_path)?;
        let restored = reader.restore(dst)?;

        assert_eq!(restored.len(), 2);
        assert_eq!(
            dst.join_components(&["dist", "index.js"]).read_to_string()?,
            "console.log('hi');\n"
        );
        assert_eq!(
            dst.join_component("log.txt").read_to_string()?,
            "captured output\n"
        );
        Ok(())
    }

    #[test]
    fn test_restore_rejects_escaping_paths() -> Result<()> {
        // Hand-build a tar whose entry path climbs out of the anchor.
        let mut body = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut body);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(4);
            header.set_mode(0o644);
            builder.append_data(&mut header, "../escape.txt", "oops".as_bytes())?;
            builder.finish()?;
        }

        let dst_dir = tempdir()?;
        let dst = AbsoluteSystemPath::from_std_path(dst_dir.path())?;
        let mut reader = CacheReader::from_reader(body.as_slice(), false)?;
        let result = reader.restore(dst);
        assert!(matches!(
            result,
            Err(crate::CacheError::LinkOutsideOfDirectory(_))
        ));
        Ok(())
    }

    #[test]
    fn test_in_memory_round_trip() -> Result<()> {
        let src_dir = tempdir()?;
        let src = AbsoluteSystemPath::from_std_path(src_dir.path())?;
        src.join_component("out.txt").create_with_contents("data")?;

        let mut body = Vec::new();
        {
            let mut writer = CacheWriter::from_writer(&mut body, true)?;
            writer.add_file(src, &AnchoredSystemPathBuf::from_raw("out.txt")?)?;
            writer.finish()?;
        }

        let dst_dir = tempdir()?;
        let dst = AbsoluteSystemPath::from_std_path(dst_dir.path())?;
        let mut reader = CacheReader::from_reader(body.as_slice(), true)?;
        let restored = reader.restore(dst)?;
        assert_eq!(restored.len(), 1);
        assert_eq!(dst.join_component("out.txt").read_to_string()?, "data");
        Ok(())
    }
}
