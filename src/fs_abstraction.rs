//! Filesystem abstraction layer for testability
//!
//! The rule file writer goes through [`FileSystem`] so write failures
//! (read-only volume, missing permissions) can be exercised in tests.

use std::io;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

/// Filesystem operations needed to persist the firewall rule document.
#[cfg_attr(test, automock)]
pub trait FileSystem: Send + Sync {
    /// Write bytes to a file, creating or truncating it.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Rename a file, replacing the destination if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Remove a file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Set Unix file permissions mode (e.g., 0o600).
    fn set_permissions_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
}

/// Real filesystem implementation using std::fs.
#[derive(Default, Clone, Copy, Debug)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn set_permissions_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
}
