//! Filesystem encryption capability
//!
//! The daemon never encrypts file data itself. It installs raw keys into
//! the filesystem's keyring for a mount point and binds directory trees to
//! a key by descriptor. Only descriptors are kept on this side.

use elk_crypto::{KeyBlob, KeyDescriptor};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::lock;

pub trait FsCrypt: Send + Sync {
    /// Make `raw` usable for files on `mount`. Returns its descriptor.
    fn install_key(&self, mount: &Path, raw: &KeyBlob) -> io::Result<KeyDescriptor>;

    /// Remove a key from `mount`. Files bound to it become unreadable.
    fn evict_key(&self, mount: &Path, descriptor: &KeyDescriptor) -> io::Result<()>;

    fn is_installed(&self, mount: &Path, descriptor: &KeyDescriptor) -> bool;

    /// Bind `dir` to a key. Binding an already-bound directory to the same
    /// key succeeds; to a different key it fails.
    fn apply_policy(&self, dir: &Path, descriptor: &KeyDescriptor) -> io::Result<()>;

    fn remove_policy(&self, dir: &Path) -> io::Result<()>;

    fn get_policy(&self, dir: &Path) -> io::Result<Option<KeyDescriptor>>;
}

/// In-process keyring and policy table.
#[derive(Debug, Default)]
pub struct ProcessKeyring {
    installed: Mutex<HashMap<PathBuf, HashSet<KeyDescriptor>>>,
    policies: Mutex<HashMap<PathBuf, KeyDescriptor>>,
}

impl ProcessKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed_count(&self, mount: &Path) -> usize {
        lock(&self.installed).get(mount).map_or(0, HashSet::len)
    }
}

impl FsCrypt for ProcessKeyring {
    fn install_key(&self, mount: &Path, raw: &KeyBlob) -> io::Result<KeyDescriptor> {
        let descriptor = KeyDescriptor::for_key(raw).map_err(io::Error::other)?;
        lock(&self.installed)
            .entry(mount.to_path_buf())
            .or_default()
            .insert(descriptor);
        debug!(mount = %mount.display(), %descriptor, "key installed");
        Ok(descriptor)
    }

    fn evict_key(&self, mount: &Path, descriptor: &KeyDescriptor) -> io::Result<()> {
        let mut installed = lock(&self.installed);
        let removed = installed
            .get_mut(mount)
            .is_some_and(|keys| keys.remove(descriptor));
        if !removed {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("key {descriptor} is not installed on {}", mount.display()),
            ));
        }
        debug!(mount = %mount.display(), %descriptor, "key evicted");
        Ok(())
    }

    fn is_installed(&self, mount: &Path, descriptor: &KeyDescriptor) -> bool {
        lock(&self.installed)
            .get(mount)
            .is_some_and(|keys| keys.contains(descriptor))
    }

    fn apply_policy(&self, dir: &Path, descriptor: &KeyDescriptor) -> io::Result<()> {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            ));
        }
        let mut policies = lock(&self.policies);
        match policies.get(dir) {
            Some(existing) if existing == descriptor => Ok(()),
            Some(existing) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is already bound to key {existing}", dir.display()),
            )),
            None => {
                policies.insert(dir.to_path_buf(), *descriptor);
                Ok(())
            }
        }
    }

    fn remove_policy(&self, dir: &Path) -> io::Result<()> {
        lock(&self.policies).remove(dir);
        Ok(())
    }

    fn get_policy(&self, dir: &Path) -> io::Result<Option<KeyDescriptor>> {
        Ok(lock(&self.policies).get(dir).copied())
    }
}
