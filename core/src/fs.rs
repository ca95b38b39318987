//! Filesystem collaborator used when a download completes.

use std::io;
use std::path::{Path, PathBuf};

pub trait FileSystem: Send + Sync {
    /// Move `from` to `to`, replacing any existing file.
    fn move_item(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Directory used when a download names no destination.
    fn default_download_dir(&self) -> Option<PathBuf>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn move_item(&self, from: &Path, to: &Path) -> io::Result<()> {
        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            // rename cannot cross filesystems; fall back to copy + remove.
            Err(rename_err) => {
                std::fs::copy(from, to).map_err(|_| rename_err)?;
                std::fs::remove_file(from)
            }
        }
    }

    fn default_download_dir(&self) -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join("Downloads"))
            .or_else(|| Some(std::env::temp_dir()))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_item_relocates_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.tmp");
        let to = dir.path().join("nested").join("a.txt");
        std::fs::write(&from, "payload").unwrap();

        let fs = LocalFileSystem;
        fs.create_dir_all(to.parent().unwrap()).unwrap();
        fs.move_item(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::read_to_string(&to).unwrap(), "payload");
    }

    #[test]
    fn move_item_reports_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFileSystem
            .move_item(&dir.path().join("missing"), &dir.path().join("to"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn default_download_dir_is_always_set() {
        assert!(LocalFileSystem.default_download_dir().is_some());
    }
}
