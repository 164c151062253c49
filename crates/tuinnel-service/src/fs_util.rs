//! Filesystem helpers shared by the config store and the pid registry

use crate::error::ServiceError;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `$HOME/.tuinnel`
pub fn data_dir() -> Result<PathBuf, ServiceError> {
    let home = dirs::home_dir().ok_or(ServiceError::NoHomeDir)?;
    Ok(home.join(".tuinnel"))
}

/// Write a file atomically: temp file in the same directory, fsync, rename.
/// A concurrent reader sees either the old content or the new, never a
/// partial write. The final file is owner read/write only.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ServiceError> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().ok_or_else(|| {
        ServiceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ))
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tuinnel-write-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    // NamedTempFile is created 0600 already; make it explicit so the
    // contract survives a change of temp-file library defaults
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;

    tmp.persist(path).map_err(|e| ServiceError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn atomic_write_creates_missing_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deep").join("file.json");
        write_atomic(&path, b"{}").unwrap();
        assert!(path.exists());
    }
}
