use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Atomically replace the contents of `path`: write to a temporary file in
/// the same directory, then rename over the target. Readers never observe a
/// partial write.
pub fn replace_file_contents(path: &Utf8Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("no parent directory for {path}"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary file in {dir}"))?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("renaming over {path}"))?;
    Ok(())
}

/// Read a file to a string, mapping a missing file to `None`.
pub fn read_optional_string(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn test_replace_file_contents() {
        let td = tempfile::tempdir().unwrap();
        let td: Utf8PathBuf = td.path().to_path_buf().try_into().unwrap();
        let p = td.join("somefile");
        assert_eq!(read_optional_string(&p).unwrap(), None);
        replace_file_contents(&p, b"hello").unwrap();
        assert_eq!(read_optional_string(&p).unwrap().unwrap(), "hello");
        replace_file_contents(&p, b"world").unwrap();
        assert_eq!(read_optional_string(&p).unwrap().unwrap(), "world");
    }
}
