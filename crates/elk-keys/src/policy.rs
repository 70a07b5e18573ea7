//! Directory encryption policy helpers

use elk_core::{FileList, KeyError, KeyResult, ProtectionLevel, UserId};
use elk_crypto::KeyDescriptor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fscrypt::FsCrypt;

/// Data tree of `user` protected by the `level` key.
pub fn user_data_dir(data_root: &Path, level: ProtectionLevel, user: UserId) -> PathBuf {
    data_root
        .join("app")
        .join(level.dir_name())
        .join(user.to_string())
}

pub fn ensure_dir(path: &Path) -> KeyResult<()> {
    std::fs::create_dir_all(path).map_err(|e| KeyError::io(path, e))
}

/// Run `op`; on a storage I/O error recreate `dir` and try exactly once more.
pub fn with_dir_retry<T>(dir: &Path, mut op: impl FnMut() -> KeyResult<T>) -> KeyResult<T> {
    match op() {
        Err(e) if e.is_retryable() => {
            warn!(dir = %dir.display(), "retrying after storage error: {e}");
            ensure_dir(dir)?;
            op()
        }
        result => result,
    }
}

/// Bind `dir` (created if missing) to `descriptor` and read the binding back.
pub fn apply_dir_policy(
    fscrypt: &dyn FsCrypt,
    dir: &Path,
    descriptor: &KeyDescriptor,
) -> KeyResult<()> {
    ensure_dir(dir)?;
    fscrypt
        .apply_policy(dir, descriptor)
        .map_err(|e| KeyError::io(dir, e))?;
    match fscrypt.get_policy(dir).map_err(|e| KeyError::io(dir, e))? {
        Some(bound) if bound == *descriptor => {
            debug!(dir = %dir.display(), %descriptor, "directory policy set");
            Ok(())
        }
        other => Err(KeyError::corrupt(
            dir,
            format!("policy reads back as {other:?}, expected {descriptor}"),
        )),
    }
}

/// Apply `descriptor` to each listed directory, stopping at the first failure.
pub fn set_directory_policies(
    fscrypt: &dyn FsCrypt,
    dirs: &[FileList],
    descriptor: &KeyDescriptor,
) -> KeyResult<()> {
    for entry in dirs {
        apply_dir_policy(fscrypt, &entry.path, descriptor)?;
    }
    Ok(())
}

/// Drop the binding of `dir`. Failures are logged; the directory is about
/// to lose its key either way.
pub fn remove_dir_policy(fscrypt: &dyn FsCrypt, dir: &Path) {
    if let Err(e) = fscrypt.remove_policy(dir) {
        warn!(dir = %dir.display(), "failed to remove directory policy: {e}");
    }
}

pub fn is_encrypted(fscrypt: &dyn FsCrypt, dir: &Path) -> bool {
    matches!(fscrypt.get_policy(dir), Ok(Some(_)))
}
