//! File permission checks for configuration and backup files
//!
//! The check is advisory: it reports files that are readable by more users
//! than intended but does not change them. Files are only made private
//! when this crate writes them.
//!
//! On platforms without POSIX permission bits every function here is a no-op.

use std::path::{Path, PathBuf};

use anyhow::Result;
#[cfg(unix)]
use anyhow::Context;

/// Mode expected on the configuration directory
pub const PRIVATE_DIR_MODE: u32 = 0o700;
/// Mode expected on configuration and backup files
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// A file grants more access than the allowed limit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Permissions on '{}' should be 0{:o}, not 0{:o}", .path.display(), .limit, .actual)]
pub struct PermissionError {
    pub path: PathBuf,
    /// The most permissive mode that is acceptable
    pub limit: u32,
    /// The mode found on disk
    pub actual: u32,
}

/// Read the permission bits of a file
///
/// Returns `None` if the file does not exist.
#[cfg(unix)]
pub fn file_mode(path: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.permissions().mode() & 0o777)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

#[cfg(not(unix))]
pub fn file_mode(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

/// Check that `path` grants no permission outside `limit`
///
/// A missing file passes.
pub fn check_permissions(path: &Path, limit: u32) -> Result<()> {
    let Some(actual) = file_mode(path)? else {
        return Ok(());
    };

    let disallowed = !limit & 0o777;
    if actual & disallowed != 0 {
        return Err(PermissionError {
            path: path.to_path_buf(),
            limit,
            actual,
        }
        .into());
    }

    Ok(())
}

/// Restrict a directory to its owner (0700)
pub fn make_private_dir(path: &Path) -> Result<()> {
    set_mode(path, PRIVATE_DIR_MODE)
}

/// Restrict a file to owner read/write (0600)
pub fn make_private_file(path: &Path) -> Result<()> {
    set_mode(path, PRIVATE_FILE_MODE)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if file_mode(path)? == Some(mode) {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
