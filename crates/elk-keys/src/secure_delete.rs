//! Secure-delete marking of key directories
//!
//! Run once at startup over the key roots. Marking is best effort: a
//! failure on one entry is logged and the walk continues.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Marks files and directories for secure deletion by the filesystem.
pub trait SecureDeleteMarker: Send + Sync {
    fn mark_dir(&self, path: &Path) -> io::Result<()>;
    fn mark_file(&self, path: &Path) -> io::Result<()>;
}

/// Restricts key directories to the owner (0700 directories, 0600 files).
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionMarker;

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl SecureDeleteMarker for PermissionMarker {
    fn mark_dir(&self, path: &Path) -> io::Result<()> {
        set_mode(path, 0o700)
    }

    fn mark_file(&self, path: &Path) -> io::Result<()> {
        set_mode(path, 0o600)
    }
}

/// Walk every root and mark what is found. Missing roots are skipped.
/// Returns the number of entries marked.
pub fn mark_key_roots(marker: &dyn SecureDeleteMarker, roots: &[PathBuf]) -> usize {
    let mut marked = 0;
    for root in roots {
        if !root.exists() {
            debug!(root = %root.display(), "key root absent, nothing to mark");
            continue;
        }
        marked += mark_tree(marker, root);
    }
    info!(roots = roots.len(), marked, "key roots marked for secure delete");
    marked
}

fn mark_tree(marker: &dyn SecureDeleteMarker, dir: &Path) -> usize {
    let mut marked = match marker.mark_dir(dir) {
        Ok(()) => 1,
        Err(e) => {
            warn!(path = %dir.display(), "failed to mark directory: {e}");
            0
        }
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "failed to list directory: {e}");
            return marked;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => marked += mark_tree(marker, &path),
            Ok(t) if t.is_file() => match marker.mark_file(&path) {
                Ok(()) => marked += 1,
                Err(e) => warn!(path = %path.display(), "failed to mark file: {e}"),
            },
            _ => {}
        }
    }
    marked
}
