//! Versioned key directories
//!
//! Each (user, level) key lives in its own directory:
//!
//! ```text
//! <key dir>/
//!   version_0/            superseded candidate (removed after promotion)
//!   version_1/            current candidate: highest version that reads back
//!     shield              key store context
//!     sec_discard         16 KiB random blob mixed into the KEK
//!     encrypted           wrapped raw key
//!     key_info.json       metadata
//!   latest/               staging area for the next candidate
//! ```
//!
//! A new candidate is written and fsynced under `latest/`, verified by the
//! caller, and only then renamed to `version_<max+1>`. A crash at any point
//! leaves either the previous or the new candidate current. Keys written by
//! older releases keep their files flat in the key directory; see
//! [`KeyStorage::has_legacy_layout`].

use base64::Engine;
use elk_core::{KeyError, KeyResult, ProtectionLevel};
use elk_crypto::{
    sealed_len, KeyBlob, KeyDescriptor, ShieldContext, SALT_SIZE, SEC_DISCARD_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const VERSION_PREFIX: &str = "version_";
pub const STAGING_DIR: &str = "latest";

pub const SHIELD_FILE: &str = "shield";
pub const SEC_DISCARD_FILE: &str = "sec_discard";
pub const ENCRYPTED_FILE: &str = "encrypted";
pub const KEY_INFO_FILE: &str = "key_info.json";

const CANDIDATE_FILES: [&str; 4] = [SHIELD_FILE, SEC_DISCARD_FILE, ENCRYPTED_FILE, KEY_INFO_FILE];

/// Format written by this release.
pub const FORMAT_VERSION: u32 = 2;

/// Largest raw key a candidate may describe.
pub const MAX_KEY_LEN: usize = 512;

/// Format of the flat, unversioned layout.
pub const LEGACY_FORMAT_VERSION: u32 = 1;

fn legacy_format() -> u32 {
    LEGACY_FORMAT_VERSION
}

/// Persisted metadata of one candidate (`key_info.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(default = "legacy_format")]
    pub format: u32,
    pub level: ProtectionLevel,
    pub key_len: usize,
    pub descriptor: KeyDescriptor,
    /// Argon2id salt, base64
    pub salt: String,
    /// Whether the user layer is bound to a non-empty secret
    #[serde(default)]
    pub credential_protected: bool,
    /// Whether the enhance layer is applied on top of the shield
    #[serde(default)]
    pub enhanced: bool,
    /// Unix epoch seconds
    #[serde(default)]
    pub created_at: u64,
}

impl KeyInfo {
    pub fn encode_salt(salt: &[u8; SALT_SIZE]) -> String {
        base64::engine::general_purpose::STANDARD.encode(salt)
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_SIZE], String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.salt)
            .map_err(|e| format!("salt is not base64: {e}"))?;
        raw.try_into()
            .map_err(|v: Vec<u8>| format!("salt is {} bytes (expected {SALT_SIZE})", v.len()))
    }

    /// Exact size of the `encrypted` file this metadata describes, or
    /// `None` when `key_len` is out of range.
    pub fn encrypted_len(&self) -> Option<usize> {
        if self.key_len == 0 || self.key_len > MAX_KEY_LEN {
            return None;
        }
        let layers = if self.enhanced { 3 } else { 2 };
        sealed_len(0)
            .checked_mul(layers)?
            .checked_add(self.key_len)
    }
}

/// The four files of one candidate, read back and size-checked.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub info: KeyInfo,
    pub shield: ShieldContext,
    pub sec_discard: KeyBlob,
    pub encrypted: Vec<u8>,
}

/// On-disk home of a single key.
#[derive(Debug, Clone)]
pub struct KeyStorage {
    root: PathBuf,
}

impl KeyStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> KeyResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| KeyError::io(&self.root, e))
    }

    pub fn candidate_dir(&self, version: u32) -> PathBuf {
        self.root.join(format!("{VERSION_PREFIX}{version}"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Promoted candidate versions, ascending. A missing root has none.
    pub fn versions(&self) -> KeyResult<Vec<u32>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeyError::io(&self.root, e)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KeyError::io(&self.root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(version) = parse_version(&entry.file_name().to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Keys from older releases keep their files directly in the root.
    pub fn has_legacy_layout(&self) -> bool {
        self.root.join(ENCRYPTED_FILE).is_file()
    }

    /// Whether any key material exists, in either layout.
    pub fn has_key(&self) -> bool {
        self.has_legacy_layout() || self.versions().map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// The current candidate: the highest version that reads back whole.
    ///
    /// A newer version that fails to read is skipped with a warning. If no
    /// version is readable the error of the newest one is returned, or a
    /// `NotFound` I/O error when there are none at all.
    pub fn load_current(&self) -> KeyResult<(u32, Candidate)> {
        let mut newest_err = None;
        for version in self.versions()?.into_iter().rev() {
            let dir = self.candidate_dir(version);
            match read_candidate(&dir) {
                Ok(candidate) => return Ok((version, candidate)),
                Err(e) => {
                    warn!(dir = %dir.display(), "skipping unreadable key candidate: {e}");
                    newest_err.get_or_insert(e);
                }
            }
        }
        Err(newest_err.unwrap_or_else(|| {
            KeyError::io(
                &self.root,
                io::Error::new(io::ErrorKind::NotFound, "no key candidate"),
            )
        }))
    }

    pub fn load_legacy(&self) -> KeyResult<Candidate> {
        read_candidate(&self.root)
    }

    /// Write `candidate` into a fresh `latest/`, replacing any leftover one.
    pub fn stage(&self, candidate: &Candidate) -> KeyResult<PathBuf> {
        let staging = self.staging_dir();
        if staging.exists() {
            debug!(dir = %staging.display(), "discarding leftover staging directory");
            wipe_dir(&staging).map_err(|e| KeyError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| KeyError::io(&staging, e))?;

        let info = serde_json::to_vec_pretty(&candidate.info)
            .map_err(|e| KeyError::corrupt(staging.join(KEY_INFO_FILE), e.to_string()))?;

        write_synced(&staging.join(SHIELD_FILE), candidate.shield.as_bytes())?;
        write_synced(&staging.join(SEC_DISCARD_FILE), candidate.sec_discard.as_bytes())?;
        write_synced(&staging.join(ENCRYPTED_FILE), &candidate.encrypted)?;
        write_synced(&staging.join(KEY_INFO_FILE), &info)?;
        sync_dir(&staging)?;
        Ok(staging)
    }

    /// Read the staged candidate back, with the same checks as a load.
    pub fn read_staged(&self) -> KeyResult<Candidate> {
        read_candidate(&self.staging_dir())
    }

    /// Rename `latest/` to the next version. This is the commit point.
    pub fn promote(&self) -> KeyResult<u32> {
        let next = self.versions()?.last().map_or(0, |v| v + 1);
        let target = self.candidate_dir(next);
        fs::rename(self.staging_dir(), &target).map_err(|e| KeyError::io(&target, e))?;
        sync_dir(&self.root)?;
        debug!(dir = %target.display(), "key candidate promoted");
        Ok(next)
    }

    pub fn discard_staged(&self) {
        let staging = self.staging_dir();
        if staging.exists() {
            if let Err(e) = wipe_dir(&staging) {
                warn!(dir = %staging.display(), "failed to discard staged candidate: {e}");
            }
        }
    }

    /// Securely remove every candidate except `keep`, plus legacy files.
    ///
    /// Runs after a promotion has committed, so failures only leave garbage
    /// behind and are logged rather than returned.
    pub fn remove_stale(&self, keep: u32) {
        let versions = match self.versions() {
            Ok(v) => v,
            Err(e) => {
                warn!(root = %self.root.display(), "cannot list stale candidates: {e}");
                return;
            }
        };
        for version in versions.into_iter().filter(|v| *v != keep) {
            let dir = self.candidate_dir(version);
            if let Err(e) = wipe_dir(&dir) {
                warn!(dir = %dir.display(), "failed to remove stale candidate: {e}");
            }
        }
        self.discard_staged();
        if let Err(e) = self.remove_legacy_files() {
            warn!(root = %self.root.display(), "failed to remove legacy key files: {e}");
        }
    }

    pub fn remove_legacy_files(&self) -> KeyResult<()> {
        for name in CANDIDATE_FILES {
            let path = self.root.join(name);
            if path.is_file() {
                wipe_file(&path).map_err(|e| KeyError::io(&path, e))?;
            }
        }
        Ok(())
    }

    /// Overwrite and delete everything under the root, then the root.
    pub fn wipe_all(&self) -> KeyResult<()> {
        match fs::symlink_metadata(&self.root) {
            Ok(_) => wipe_dir(&self.root).map_err(|e| KeyError::io(&self.root, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyError::io(&self.root, e)),
        }
    }
}

fn parse_version(name: &str) -> Option<u32> {
    name.strip_prefix(VERSION_PREFIX)?.parse().ok()
}

fn read_file(path: &Path) -> KeyResult<Vec<u8>> {
    fs::read(path).map_err(|e| KeyError::io(path, e))
}

/// Read and size-check one candidate directory.
fn read_candidate(dir: &Path) -> KeyResult<Candidate> {
    let info_path = dir.join(KEY_INFO_FILE);
    let info: KeyInfo = serde_json::from_slice(&read_file(&info_path)?)
        .map_err(|e| KeyError::corrupt(&info_path, format!("unparseable key info: {e}")))?;
    info.salt_bytes()
        .map_err(|reason| KeyError::corrupt(&info_path, reason))?;
    let expected_len = info.encrypted_len().ok_or_else(|| {
        KeyError::corrupt(
            &info_path,
            format!("key length {} out of range (max {MAX_KEY_LEN})", info.key_len),
        )
    })?;

    let shield_path = dir.join(SHIELD_FILE);
    let shield = ShieldContext::from_bytes(&read_file(&shield_path)?)
        .map_err(|e| KeyError::corrupt(&shield_path, e.to_string()))?;

    let discard_path = dir.join(SEC_DISCARD_FILE);
    let sec_discard = KeyBlob::new(read_file(&discard_path)?);
    if sec_discard.len() != SEC_DISCARD_SIZE {
        return Err(KeyError::corrupt(
            &discard_path,
            format!(
                "sec_discard is {} bytes (expected {SEC_DISCARD_SIZE})",
                sec_discard.len()
            ),
        ));
    }

    let encrypted_path = dir.join(ENCRYPTED_FILE);
    let encrypted = read_file(&encrypted_path)?;
    if encrypted.len() != expected_len {
        return Err(KeyError::corrupt(
            &encrypted_path,
            format!(
                "wrapped key is {} bytes (expected {expected_len})",
                encrypted.len()
            ),
        ));
    }

    Ok(Candidate {
        info,
        shield,
        sec_discard,
        encrypted,
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> KeyResult<()> {
    let mut file = File::create(path).map_err(|e| KeyError::io(path, e))?;
    file.write_all(bytes).map_err(|e| KeyError::io(path, e))?;
    file.sync_all().map_err(|e| KeyError::io(path, e))
}

fn sync_dir(dir: &Path) -> KeyResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| KeyError::io(dir, e))
}

/// Overwrite a file with zeros before unlinking it. Symlinks and other
/// non-regular entries are unlinked without writing through them.
pub fn wipe_file(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_file() {
        let mut file = fs::OpenOptions::new().write(true).open(path)?;
        file.write_all(&vec![0u8; meta.len() as usize])?;
        file.sync_all()?;
    }
    fs::remove_file(path)
}

/// [`wipe_file`] every file below `dir`, then remove the tree.
pub fn wipe_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            wipe_dir(&path)?;
        } else {
            wipe_file(&path)?;
        }
    }
    fs::remove_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use elk_crypto::{HardwareKeyStore, SoftKeyStore};

    fn sample_candidate(level: ProtectionLevel) -> Candidate {
        let store = SoftKeyStore::ephemeral(false);
        let raw = KeyBlob::random(64);
        let info = KeyInfo {
            format: FORMAT_VERSION,
            level,
            key_len: 64,
            descriptor: KeyDescriptor::for_key(&raw).unwrap(),
            salt: KeyInfo::encode_salt(&[4u8; SALT_SIZE]),
            credential_protected: false,
            enhanced: false,
            created_at: 0,
        };
        Candidate {
            encrypted: vec![0u8; info.encrypted_len().unwrap()],
            info,
            shield: store.generate_context().unwrap(),
            sec_discard: KeyBlob::random(SEC_DISCARD_SIZE),
        }
    }

    #[test]
    fn test_missing_root_has_no_versions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path().join("absent"));
        assert!(storage.versions().unwrap().is_empty());
        assert!(!storage.has_key());
        assert!(matches!(
            storage.load_current(),
            Err(KeyError::StorageIo { .. })
        ));
    }

    #[test]
    fn test_stage_promote_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        let candidate = sample_candidate(ProtectionLevel::El2);

        storage.stage(&candidate).unwrap();
        assert!(storage.versions().unwrap().is_empty(), "staging is not a version");

        assert_eq!(storage.promote().unwrap(), 0);
        storage.stage(&candidate).unwrap();
        assert_eq!(storage.promote().unwrap(), 1);

        let (version, loaded) = storage.load_current().unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.info, candidate.info);
        assert!(!storage.staging_dir().exists());

        storage.remove_stale(1);
        assert_eq!(storage.versions().unwrap(), vec![1]);
    }

    #[test]
    fn test_unpromoted_staging_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        let first = sample_candidate(ProtectionLevel::El2);
        storage.stage(&first).unwrap();
        storage.promote().unwrap();

        // A crash between stage and promote leaves `latest/` behind.
        let second = sample_candidate(ProtectionLevel::El2);
        storage.stage(&second).unwrap();

        let (version, loaded) = storage.load_current().unwrap();
        assert_eq!(version, 0);
        assert_eq!(loaded.info.descriptor, first.info.descriptor);
    }

    #[test]
    fn test_truncated_newest_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        let candidate = sample_candidate(ProtectionLevel::El3);
        storage.stage(&candidate).unwrap();
        storage.promote().unwrap();
        storage.stage(&candidate).unwrap();
        storage.promote().unwrap();

        fs::write(storage.candidate_dir(1).join(ENCRYPTED_FILE), b"short").unwrap();
        let (version, _) = storage.load_current().unwrap();
        assert_eq!(version, 0);

        fs::write(storage.candidate_dir(0).join(ENCRYPTED_FILE), b"short").unwrap();
        assert!(matches!(
            storage.load_current(),
            Err(KeyError::Corruption { .. })
        ));
    }

    #[test]
    fn test_wrong_size_sec_discard_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        storage.stage(&sample_candidate(ProtectionLevel::El2)).unwrap();
        storage.promote().unwrap();
        fs::write(storage.candidate_dir(0).join(SEC_DISCARD_FILE), [0u8; 10]).unwrap();

        assert!(matches!(
            storage.load_current(),
            Err(KeyError::Corruption { .. })
        ));
    }

    #[test]
    fn test_out_of_range_key_len_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        storage.stage(&sample_candidate(ProtectionLevel::El2)).unwrap();
        storage.promote().unwrap();

        let info_path = storage.candidate_dir(0).join(KEY_INFO_FILE);
        let info = fs::read_to_string(&info_path).unwrap();
        assert!(info.contains("\"key_len\": 64"));
        fs::write(
            &info_path,
            info.replace("\"key_len\": 64", &format!("\"key_len\": {}", usize::MAX)),
        )
        .unwrap();

        assert!(matches!(
            storage.load_current(),
            Err(KeyError::Corruption { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_wipe_does_not_write_through_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::write(&outside, b"keep me").unwrap();

        let storage = KeyStorage::new(dir.path().join("el2/100"));
        storage.ensure_root().unwrap();
        std::os::unix::fs::symlink(&outside, storage.root().join(ENCRYPTED_FILE)).unwrap();

        storage.wipe_all().unwrap();
        assert!(!storage.root().exists());
        assert_eq!(fs::read(&outside).unwrap(), b"keep me");
    }

    #[test]
    fn test_legacy_layout_detected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path());
        let candidate = sample_candidate(ProtectionLevel::El1);
        let staged = storage.stage(&candidate).unwrap();
        for name in CANDIDATE_FILES {
            fs::rename(staged.join(name), dir.path().join(name)).unwrap();
        }
        fs::remove_dir(&staged).unwrap();

        assert!(storage.has_legacy_layout());
        assert!(storage.has_key());
        assert_eq!(storage.load_legacy().unwrap().info, candidate.info);

        storage.remove_legacy_files().unwrap();
        assert!(!storage.has_key());
    }

    #[test]
    fn test_legacy_info_defaults() {
        let json = format!(
            r#"{{"level":"el1","key_len":64,"descriptor":"{}","salt":"{}"}}"#,
            "00".repeat(16),
            KeyInfo::encode_salt(&[0u8; SALT_SIZE])
        );
        let info: KeyInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info.format, LEGACY_FORMAT_VERSION);
        assert!(!info.credential_protected);
        assert!(!info.enhanced);
    }

    #[test]
    fn test_wipe_all_removes_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = KeyStorage::new(dir.path().join("el2/100"));
        storage.ensure_root().unwrap();
        storage.stage(&sample_candidate(ProtectionLevel::El2)).unwrap();
        storage.promote().unwrap();

        storage.wipe_all().unwrap();
        assert!(!storage.root().exists());
        storage.wipe_all().unwrap();
    }
}
