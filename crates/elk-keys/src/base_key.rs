//! One encryption key for one (user, protection level)
//!
//! A `BaseKey` owns its key directory and the volatile context around it:
//! the raw key (only while unwrapped), the secret-wrapped layer of the
//! current candidate (kept so the shield can be rotated without the user's
//! credential), and the lifecycle state:
//!
//! ```text
//! Absent -> Initialized -> Active <-> Inactive
//!                  \___________\__________\____-> Deleted (terminal)
//! ```
//!
//! Every operation takes the key's own lock for its full duration, so
//! operations on one key are serialized while different keys proceed in
//! parallel.

use elk_core::{KeyError, KeyResult, ProtectionLevel, UserAuth};
use elk_crypto::{
    derive_kek, derive_subkey, open, seal, sealed_len, CryptoError, HardwareKeyStore, KdfParams,
    KeyBlob, KeyDescriptor, ShieldContext, KEY_SIZE, SALT_SIZE, SEC_DISCARD_SIZE,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::fscrypt::FsCrypt;
use crate::lock;
use crate::storage::{Candidate, KeyInfo, KeyStorage, FORMAT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// No key directory yet
    Absent,
    /// Key material exists but has never been installed
    Initialized,
    Active,
    Inactive,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateFlag {
    /// Re-install a key restored from disk
    Retrieve,
    /// First installation of a key that was just generated
    FirstCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivateFlag {
    /// Release the key; the cached wrapped layer is kept
    Logout,
    /// Release the key and drop every cached copy ahead of deletion
    Destroy,
}

/// The layers of the current candidate that do not depend on the secret.
#[derive(Clone)]
struct SealedKey {
    info: KeyInfo,
    shield: ShieldContext,
    sec_discard: KeyBlob,
    user_layer: Vec<u8>,
}

/// Volatile state of a key.
#[derive(Default)]
struct KeyContext {
    raw: Option<KeyBlob>,
    descriptor: Option<KeyDescriptor>,
    sealed: Option<SealedKey>,
    /// Set by a successful store or restore, consumed by activation.
    fresh_unwrap: bool,
    mount: Option<PathBuf>,
    version: Option<u32>,
}

impl KeyContext {
    fn wipe(&mut self) {
        if let Some(raw) = self.raw.as_mut() {
            raw.clear();
        }
        *self = KeyContext::default();
    }
}

struct Inner {
    storage: KeyStorage,
    state: KeyState,
    ctx: KeyContext,
}

impl Inner {
    fn ensure_live(&self) -> KeyResult<()> {
        if self.state == KeyState::Deleted {
            return Err(KeyError::StateConflict(format!(
                "key at {} has been deleted",
                self.storage.root().display()
            )));
        }
        Ok(())
    }
}

pub struct BaseKey {
    level: ProtectionLevel,
    key_len: usize,
    kdf: KdfParams,
    keystore: Arc<dyn HardwareKeyStore>,
    fscrypt: Arc<dyn FsCrypt>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for BaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = f.debug_struct("BaseKey");
        out.field("level", &self.level);
        match self.inner.try_lock() {
            Ok(inner) => out
                .field("dir", &inner.storage.root())
                .field("state", &inner.state)
                .finish(),
            Err(_) => out.finish_non_exhaustive(),
        }
    }
}

pub(crate) fn crypto_err(path: &Path, e: CryptoError) -> KeyError {
    match e {
        CryptoError::Authentication(msg) => KeyError::Authentication(msg.to_string()),
        CryptoError::Malformed(reason) => KeyError::corrupt(path, reason),
        CryptoError::Kdf(reason) => KeyError::InvalidArgument(reason),
        CryptoError::Unavailable(msg) => KeyError::Unsupported(msg.to_string()),
        CryptoError::Io(e) => KeyError::io(path, e),
    }
}

fn user_aad(level: ProtectionLevel) -> Vec<u8> {
    format!("elk-user:{}", level.dir_name()).into_bytes()
}

fn enhance_pre_key(sec_discard: &KeyBlob) -> Result<KeyBlob, CryptoError> {
    derive_subkey(sec_discard, b"elk-enhance-prekey", KEY_SIZE)
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current candidate in either layout. Legacy keys have no version.
/// A candidate describing a key of any other length than `key_len` is
/// corrupt.
fn load_candidate(storage: &KeyStorage, key_len: usize) -> KeyResult<(Option<u32>, Candidate)> {
    let (version, candidate) =
        if storage.versions()?.is_empty() && storage.has_legacy_layout() {
            (None, storage.load_legacy()?)
        } else {
            let (version, candidate) = storage.load_current()?;
            (Some(version), candidate)
        };
    if candidate.info.key_len != key_len {
        return Err(KeyError::corrupt(
            storage.root(),
            format!(
                "stored key is {} bytes (expected {key_len})",
                candidate.info.key_len
            ),
        ));
    }
    Ok((version, candidate))
}

impl BaseKey {
    pub fn new(
        level: ProtectionLevel,
        dir: impl Into<PathBuf>,
        key_len: usize,
        kdf: KdfParams,
        keystore: Arc<dyn HardwareKeyStore>,
        fscrypt: Arc<dyn FsCrypt>,
    ) -> Self {
        let storage = KeyStorage::new(dir);
        let state = if storage.has_key() {
            KeyState::Initialized
        } else {
            KeyState::Absent
        };
        Self {
            level,
            key_len,
            kdf,
            keystore,
            fscrypt,
            inner: Mutex::new(Inner {
                storage,
                state,
                ctx: KeyContext::default(),
            }),
        }
    }

    pub fn level(&self) -> ProtectionLevel {
        self.level
    }

    pub fn dir(&self) -> PathBuf {
        lock(&self.inner).storage.root().to_path_buf()
    }

    pub fn state(&self) -> KeyState {
        lock(&self.inner).state
    }

    pub fn is_active(&self) -> bool {
        self.state() == KeyState::Active
    }

    pub fn descriptor(&self) -> Option<KeyDescriptor> {
        lock(&self.inner).ctx.descriptor
    }

    /// Descriptor from memory, or from the stored candidate's metadata.
    pub fn key_descriptor(&self) -> KeyResult<KeyDescriptor> {
        let inner = lock(&self.inner);
        if let Some(descriptor) = inner.ctx.descriptor {
            return Ok(descriptor);
        }
        Ok(load_candidate(&inner.storage, self.key_len)?.1.info.descriptor)
    }

    /// Whether a candidate exists on disk, in either layout.
    pub fn has_stored_key(&self) -> bool {
        lock(&self.inner).storage.has_key()
    }

    /// Whether the stored key is bound to a non-empty secret.
    pub fn is_credential_protected(&self) -> KeyResult<bool> {
        let inner = lock(&self.inner);
        if let Some(sealed) = &inner.ctx.sealed {
            return Ok(sealed.info.credential_protected);
        }
        let (_, candidate) = load_candidate(&inner.storage, self.key_len)?;
        Ok(candidate.info.credential_protected)
    }

    /// Create the key directory and, for a key that has none yet, generate
    /// raw key material in memory. Idempotent.
    pub fn init_key(&self) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;
        inner.storage.ensure_root()?;
        if inner.ctx.raw.is_none() && !inner.storage.has_key() {
            let raw = KeyBlob::random(self.key_len);
            let descriptor =
                KeyDescriptor::for_key(&raw).map_err(|e| crypto_err(inner.storage.root(), e))?;
            inner.ctx.descriptor = Some(descriptor);
            inner.ctx.raw = Some(raw);
            debug!(level = %self.level, "key material generated");
        }
        if inner.state == KeyState::Absent {
            inner.state = KeyState::Initialized;
        }
        Ok(())
    }

    /// Wrap the raw key under `auth` into a new candidate and promote it.
    ///
    /// The shield context is regenerated unless `generate_shield` is false
    /// and a context is already known. On any failure the previous
    /// candidate stays current.
    pub fn store_key(&self, auth: &UserAuth, generate_shield: bool) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;

        let raw = match &inner.ctx.raw {
            Some(raw) => raw.clone(),
            None if inner.storage.has_key() => {
                return Err(KeyError::StateConflict(format!(
                    "{} key at {} must be restored before it is re-stored",
                    self.level,
                    inner.storage.root().display()
                )))
            }
            None => KeyBlob::random(self.key_len),
        };
        let shield = match (&inner.ctx.sealed, generate_shield) {
            (Some(sealed), false) => sealed.shield.clone(),
            _ => self
                .keystore
                .generate_context()
                .map_err(|e| crypto_err(inner.storage.root(), e))?,
        };

        let (candidate, user_layer) =
            self.build_candidate(&raw, auth, shield, inner.storage.root())?;
        let version = self.commit(&inner.storage, &candidate, &user_layer)?;

        inner.ctx.descriptor = Some(candidate.info.descriptor);
        inner.ctx.sealed = Some(SealedKey {
            info: candidate.info.clone(),
            shield: candidate.shield.clone(),
            sec_discard: candidate.sec_discard.clone(),
            user_layer,
        });
        inner.ctx.raw = Some(raw);
        inner.ctx.version = Some(version);
        inner.ctx.fresh_unwrap = true;
        if inner.state == KeyState::Absent {
            inner.state = KeyState::Initialized;
        }
        info!(level = %self.level, version, "key stored");
        Ok(())
    }

    /// Unwrap the current candidate with `auth`.
    ///
    /// A wrong secret fails with `Authentication`; missing files with
    /// `StorageIo`; malformed files with `Corruption`.
    pub fn restore_key(&self, auth: &UserAuth) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;

        let (version, candidate) = load_candidate(&inner.storage, self.key_len)?;
        let (raw, user_layer) = self.decrypt(&candidate, auth, inner.storage.root())?;
        if let Some(current) = &inner.ctx.raw {
            if *current != raw {
                return Err(KeyError::corrupt(
                    inner.storage.root(),
                    "stored key differs from the key in memory",
                ));
            }
        }

        inner.ctx.descriptor = Some(candidate.info.descriptor);
        inner.ctx.sealed = Some(SealedKey {
            info: candidate.info,
            shield: candidate.shield,
            sec_discard: candidate.sec_discard,
            user_layer,
        });
        inner.ctx.raw = Some(raw);
        inner.ctx.version = version;
        inner.ctx.fresh_unwrap = true;
        if inner.state == KeyState::Absent {
            inner.state = KeyState::Initialized;
        }
        debug!(level = %self.level, ?version, "key restored");
        Ok(())
    }

    /// Re-shield the active key under a fresh key store context, optionally
    /// moving it to `new_root`. Needs no credential.
    pub fn update_key(&self, new_root: Option<&Path>) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        if inner.state != KeyState::Active {
            return Err(KeyError::StateConflict(format!(
                "{} key must be active to update its context (is {:?})",
                self.level, inner.state
            )));
        }
        let sealed = inner.ctx.sealed.clone().ok_or_else(|| {
            KeyError::StateConflict(format!("{} key has no cached wrapped layer", self.level))
        })?;

        let root = inner.storage.root().to_path_buf();
        let shield = self
            .keystore
            .generate_context()
            .map_err(|e| crypto_err(&root, e))?;
        let encrypted = self.shield_layer(
            &shield,
            &sealed.sec_discard,
            &sealed.user_layer,
            sealed.info.enhanced,
            &root,
        )?;
        let mut info = sealed.info.clone();
        info.format = FORMAT_VERSION;
        info.created_at = now_epoch();
        let candidate = Candidate {
            info,
            shield,
            sec_discard: sealed.sec_discard.clone(),
            encrypted,
        };

        let target = match new_root {
            Some(path) if path != root => KeyStorage::new(path),
            _ => inner.storage.clone(),
        };
        target.ensure_root()?;
        let version = self.commit(&target, &candidate, &sealed.user_layer)?;
        if target.root() != root {
            if let Err(e) = inner.storage.wipe_all() {
                warn!(dir = %root.display(), "failed to remove key from old location: {e}");
            }
            inner.storage = target;
        }

        inner.ctx.sealed = Some(SealedKey {
            info: candidate.info,
            shield: candidate.shield,
            ..sealed
        });
        inner.ctx.version = Some(version);
        info!(level = %self.level, version, "key context updated");
        Ok(())
    }

    /// Install the unwrapped key on `mount`.
    ///
    /// Credential levels need a store or restore since their last
    /// deactivation; `FirstCreate` is only valid for a never-activated key.
    pub fn active_key(&self, flag: ActivateFlag, mount: &Path) -> KeyResult<KeyDescriptor> {
        let mut inner = lock(&self.inner);
        match inner.state {
            KeyState::Active => {
                return Err(KeyError::StateConflict(format!(
                    "{} key is already active",
                    self.level
                )))
            }
            KeyState::Deleted => inner.ensure_live()?,
            KeyState::Inactive if flag == ActivateFlag::FirstCreate => {
                return Err(KeyError::StateConflict(format!(
                    "{} key was activated before",
                    self.level
                )))
            }
            _ => {}
        }
        if self.level.requires_credential() && !inner.ctx.fresh_unwrap {
            return Err(KeyError::StateConflict(format!(
                "{} key must be unwrapped with the user's secret first",
                self.level
            )));
        }
        let Some(raw) = inner.ctx.raw.as_ref() else {
            return Err(KeyError::StateConflict(format!(
                "{} key is not unwrapped",
                self.level
            )));
        };

        let descriptor = self
            .fscrypt
            .install_key(mount, raw)
            .map_err(|e| KeyError::io(mount, e))?;
        if let Some(expected) = inner.ctx.descriptor {
            if expected != descriptor {
                let _ = self.fscrypt.evict_key(mount, &descriptor);
                return Err(KeyError::corrupt(
                    inner.storage.root(),
                    format!("installed key {descriptor} does not match {expected}"),
                ));
            }
        }

        inner.ctx.descriptor = Some(descriptor);
        inner.ctx.mount = Some(mount.to_path_buf());
        inner.ctx.fresh_unwrap = false;
        inner.state = KeyState::Active;
        info!(level = %self.level, %descriptor, ?flag, "key activated");
        Ok(descriptor)
    }

    /// Evict the key from `mount` and wipe the raw key from memory.
    pub fn inactive_key(&self, flag: DeactivateFlag, mount: &Path) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        if inner.state != KeyState::Active {
            return Err(KeyError::StateConflict(format!(
                "{} key is not active (is {:?})",
                self.level, inner.state
            )));
        }
        if let Some(bound) = &inner.ctx.mount {
            if bound != mount {
                warn!(level = %self.level, bound = %bound.display(), mount = %mount.display(),
                    "deactivating on a different mount than the key was installed on");
            }
        }
        if let Some(descriptor) = inner.ctx.descriptor {
            match self.fscrypt.evict_key(mount, &descriptor) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(level = %self.level, %descriptor, "key was already evicted");
                }
                Err(e) => return Err(KeyError::io(mount, e)),
            }
        }

        if let Some(raw) = inner.ctx.raw.as_mut() {
            raw.clear();
        }
        inner.ctx.raw = None;
        inner.ctx.fresh_unwrap = false;
        inner.ctx.mount = None;
        if flag == DeactivateFlag::Destroy {
            inner.ctx.sealed = None;
        }
        inner.state = KeyState::Inactive;
        info!(level = %self.level, ?flag, "key deactivated");
        Ok(())
    }

    /// Deactivate if needed, wipe memory, and securely delete every
    /// candidate. The key is `Deleted` afterwards even if removal failed.
    pub fn clear_key(&self, mount: &Path) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        if inner.state == KeyState::Deleted {
            return Ok(());
        }
        if inner.state == KeyState::Active {
            if let Some(descriptor) = inner.ctx.descriptor {
                if let Err(e) = self.fscrypt.evict_key(mount, &descriptor) {
                    warn!(level = %self.level, %descriptor, "evict before delete failed: {e}");
                }
            }
        }
        inner.ctx.wipe();
        inner.state = KeyState::Deleted;
        inner.storage.wipe_all()?;
        info!(level = %self.level, dir = %inner.storage.root().display(), "key deleted");
        Ok(())
    }

    /// Move a key in the flat legacy layout into a versioned candidate.
    ///
    /// Returns whether anything was migrated. The key's activation state
    /// is untouched.
    pub fn upgrade_keys(&self) -> KeyResult<bool> {
        let inner = lock(&self.inner);
        inner.ensure_live()?;
        if !inner.storage.has_legacy_layout() {
            return Ok(false);
        }
        if !inner.storage.versions()?.is_empty() {
            // An earlier upgrade committed but did not finish cleaning up.
            inner.storage.remove_legacy_files()?;
            return Ok(true);
        }

        let root = inner.storage.root().to_path_buf();
        let mut candidate = inner.storage.load_legacy()?;
        let user_layer = self.unshield(&candidate, &root)?;
        candidate.info.format = FORMAT_VERSION;
        let version = self.commit(&inner.storage, &candidate, &user_layer)?;
        info!(level = %self.level, dir = %root.display(), version, "legacy key upgraded");
        Ok(true)
    }

    /// Re-wrap the stored key from `old` to `new`.
    ///
    /// Decrypts the current candidate with `old` first; the new candidate
    /// is promoted only once it is written and read back.
    pub fn update_auth(
        &self,
        old: &UserAuth,
        new: &UserAuth,
        generate_shield: bool,
    ) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;
        let root = inner.storage.root().to_path_buf();

        let (_, candidate) = load_candidate(&inner.storage, self.key_len)?;
        let (raw, _) = self.decrypt(&candidate, old, &root)?;
        if let Some(current) = &inner.ctx.raw {
            if *current != raw {
                return Err(KeyError::corrupt(
                    &root,
                    "stored key differs from the key in memory",
                ));
            }
        }

        let shield = if generate_shield {
            self.keystore
                .generate_context()
                .map_err(|e| crypto_err(&root, e))?
        } else {
            candidate.shield.clone()
        };
        let (next, user_layer) = self.build_candidate(&raw, new, shield, &root)?;
        let version = self.commit(&inner.storage, &next, &user_layer)?;

        inner.ctx.sealed = Some(SealedKey {
            info: next.info,
            shield: next.shield,
            sec_discard: next.sec_discard,
            user_layer,
        });
        inner.ctx.version = Some(version);
        info!(level = %self.level, version, "key re-wrapped under new credential");
        Ok(())
    }

    /// Store a raw key obtained out of band (recovery) under `auth`.
    ///
    /// The key must match whatever this key already holds. The raw key is
    /// not retained unless the key is active.
    pub fn store_recovered(&self, raw: &KeyBlob, auth: &UserAuth) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;
        let root = inner.storage.root().to_path_buf();

        let descriptor = KeyDescriptor::for_key(raw).map_err(|e| crypto_err(&root, e))?;
        let expected = match inner.ctx.descriptor {
            Some(d) => Some(d),
            None if inner.storage.has_key() => {
                Some(load_candidate(&inner.storage, self.key_len)?.1.info.descriptor)
            }
            None => None,
        };
        if expected.is_some_and(|d| d != descriptor) {
            return Err(KeyError::corrupt(
                &root,
                "recovered key does not match the stored key",
            ));
        }

        inner.storage.ensure_root()?;
        let shield = self
            .keystore
            .generate_context()
            .map_err(|e| crypto_err(&root, e))?;
        let (candidate, user_layer) = self.build_candidate(raw, auth, shield, &root)?;
        let version = self.commit(&inner.storage, &candidate, &user_layer)?;

        inner.ctx.descriptor = Some(descriptor);
        inner.ctx.sealed = Some(SealedKey {
            info: candidate.info,
            shield: candidate.shield,
            sec_discard: candidate.sec_discard,
            user_layer,
        });
        inner.ctx.version = Some(version);
        if inner.state == KeyState::Absent {
            inner.state = KeyState::Initialized;
        }
        info!(level = %self.level, version, "recovered key stored");
        Ok(())
    }

    /// The current stored candidate, kept by callers that may need to
    /// undo a later re-wrap with [`BaseKey::reinstate`].
    pub(crate) fn snapshot(&self) -> KeyResult<Candidate> {
        let inner = lock(&self.inner);
        inner.ensure_live()?;
        Ok(load_candidate(&inner.storage, self.key_len)?.1)
    }

    /// Promote `previous` again as the newest version.
    pub(crate) fn reinstate(&self, previous: &Candidate) -> KeyResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_live()?;
        let root = inner.storage.root().to_path_buf();
        let user_layer = self.unshield(previous, &root)?;
        let version = self.commit(&inner.storage, previous, &user_layer)?;

        inner.ctx.sealed = Some(SealedKey {
            info: previous.info.clone(),
            shield: previous.shield.clone(),
            sec_discard: previous.sec_discard.clone(),
            user_layer,
        });
        inner.ctx.version = Some(version);
        warn!(level = %self.level, version, "previous candidate reinstated");
        Ok(())
    }

    /// Decrypt the stored key without changing any state.
    pub fn export_raw(&self, auth: &UserAuth) -> KeyResult<KeyBlob> {
        let inner = lock(&self.inner);
        inner.ensure_live()?;
        let (_, candidate) = load_candidate(&inner.storage, self.key_len)?;
        let (raw, _) = self.decrypt(&candidate, auth, inner.storage.root())?;
        Ok(raw)
    }

    /// HKDF sub-key of the active raw key.
    pub fn derive_subkey(&self, info: &[u8], len: usize) -> KeyResult<KeyBlob> {
        let inner = lock(&self.inner);
        match (&inner.ctx.raw, inner.state) {
            (Some(raw), KeyState::Active) => {
                derive_subkey(raw, info, len).map_err(|e| crypto_err(inner.storage.root(), e))
            }
            _ => Err(KeyError::StateConflict(format!(
                "{} key is not active",
                self.level
            ))),
        }
    }

    pub fn enhance_encrypt(&self, pre_key: &KeyBlob, plain: &[u8]) -> KeyResult<Vec<u8>> {
        let root = self.dir();
        if !self.keystore.is_available() {
            return Err(KeyError::Unsupported("enhanced wrap not available".into()));
        }
        self.keystore
            .enhance_wrap(pre_key, plain)
            .map_err(|e| crypto_err(&root, e))
    }

    pub fn enhance_decrypt(
        &self,
        pre_key: &KeyBlob,
        wrapped: &[u8],
        plain_len: usize,
    ) -> KeyResult<KeyBlob> {
        let root = self.dir();
        if !self.keystore.is_available() {
            return Err(KeyError::Unsupported("enhanced wrap not available".into()));
        }
        self.keystore
            .enhance_unwrap(pre_key, wrapped, plain_len)
            .map_err(|e| crypto_err(&root, e))
    }

    fn build_candidate(
        &self,
        raw: &KeyBlob,
        auth: &UserAuth,
        shield: ShieldContext,
        root: &Path,
    ) -> KeyResult<(Candidate, Vec<u8>)> {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(KeyBlob::random(SALT_SIZE).as_bytes());
        let sec_discard = KeyBlob::random(SEC_DISCARD_SIZE);

        let kek = derive_kek(auth.secret(), &salt, sec_discard.as_bytes(), &self.kdf)
            .map_err(|e| crypto_err(root, e))?;
        let user_layer =
            seal(&kek, &user_aad(self.level), raw.as_bytes()).map_err(|e| crypto_err(root, e))?;

        let info = KeyInfo {
            format: FORMAT_VERSION,
            level: self.level,
            key_len: raw.len(),
            descriptor: KeyDescriptor::for_key(raw).map_err(|e| crypto_err(root, e))?,
            salt: KeyInfo::encode_salt(&salt),
            credential_protected: auth.has_secret(),
            enhanced: self.level.is_uece(),
            created_at: now_epoch(),
        };
        let encrypted = self.shield_layer(&shield, &sec_discard, &user_layer, info.enhanced, root)?;
        Ok((
            Candidate {
                info,
                shield,
                sec_discard,
                encrypted,
            },
            user_layer,
        ))
    }

    fn shield_layer(
        &self,
        shield: &ShieldContext,
        sec_discard: &KeyBlob,
        user_layer: &[u8],
        enhanced: bool,
        root: &Path,
    ) -> KeyResult<Vec<u8>> {
        let shielded = self
            .keystore
            .wrap(shield, user_layer)
            .map_err(|e| crypto_err(root, e))?;
        if !enhanced {
            return Ok(shielded);
        }
        let pre_key = enhance_pre_key(sec_discard).map_err(|e| crypto_err(root, e))?;
        self.keystore
            .enhance_wrap(&pre_key, &shielded)
            .map_err(|e| crypto_err(root, e))
    }

    /// Peel the key store layers, leaving the secret-wrapped user layer.
    fn unshield(&self, candidate: &Candidate, root: &Path) -> KeyResult<Vec<u8>> {
        let info = &candidate.info;
        let user_len = sealed_len(info.key_len);
        let shielded = if info.enhanced {
            let pre_key =
                enhance_pre_key(&candidate.sec_discard).map_err(|e| crypto_err(root, e))?;
            self.keystore
                .enhance_unwrap(&pre_key, &candidate.encrypted, sealed_len(user_len))
                .map_err(|e| crypto_err(root, e))?
        } else {
            KeyBlob::from_slice(&candidate.encrypted)
        };
        let user_layer = self
            .keystore
            .unwrap(&candidate.shield, shielded.as_bytes(), user_len)
            .map_err(|e| crypto_err(root, e))?;
        Ok(user_layer.as_bytes().to_vec())
    }

    fn decrypt(
        &self,
        candidate: &Candidate,
        auth: &UserAuth,
        root: &Path,
    ) -> KeyResult<(KeyBlob, Vec<u8>)> {
        let info = &candidate.info;
        let user_layer = self.unshield(candidate, root)?;
        let salt = info
            .salt_bytes()
            .map_err(|reason| KeyError::corrupt(root, reason))?;
        let kek = derive_kek(auth.secret(), &salt, candidate.sec_discard.as_bytes(), &self.kdf)
            .map_err(|e| crypto_err(root, e))?;
        let raw = open(&kek, &user_aad(info.level), &user_layer, info.key_len)
            .map_err(|e| crypto_err(root, e))?;

        let descriptor = KeyDescriptor::for_key(&raw).map_err(|e| crypto_err(root, e))?;
        if descriptor != info.descriptor {
            return Err(KeyError::corrupt(
                root,
                format!("unwrapped key {descriptor} does not match {}", info.descriptor),
            ));
        }
        Ok((raw, user_layer))
    }

    /// Stage, read back, and promote a candidate. On failure the staging
    /// directory is discarded and the previous candidate stays current.
    fn commit(
        &self,
        storage: &KeyStorage,
        candidate: &Candidate,
        user_layer: &[u8],
    ) -> KeyResult<u32> {
        match self.stage_and_promote(storage, candidate, user_layer) {
            Ok(version) => {
                storage.remove_stale(version);
                Ok(version)
            }
            Err(e) => {
                storage.discard_staged();
                Err(e)
            }
        }
    }

    fn stage_and_promote(
        &self,
        storage: &KeyStorage,
        candidate: &Candidate,
        user_layer: &[u8],
    ) -> KeyResult<u32> {
        let staging = storage.stage(candidate)?;
        let staged = storage.read_staged()?;
        let readback = self.unshield(&staged, &staging)?;
        if readback != user_layer
            || staged.info != candidate.info
            || staged.sec_discard != candidate.sec_discard
        {
            return Err(KeyError::corrupt(
                &staging,
                "staged candidate does not read back",
            ));
        }
        storage.promote()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fscrypt::ProcessKeyring;
    use crate::storage::{ENCRYPTED_FILE, KEY_INFO_FILE, SEC_DISCARD_FILE, SHIELD_FILE};
    use elk_crypto::SoftKeyStore;

    fn fast_kdf() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn make_key(level: ProtectionLevel, dir: &Path) -> (BaseKey, Arc<ProcessKeyring>) {
        let keyring = Arc::new(ProcessKeyring::new());
        let key = BaseKey::new(
            level,
            dir,
            64,
            fast_kdf(),
            Arc::new(SoftKeyStore::ephemeral(true)),
            keyring.clone(),
        );
        (key, keyring)
    }

    fn auth(secret: &[u8]) -> UserAuth {
        UserAuth::new(Vec::new(), secret.to_vec())
    }

    #[test]
    fn test_new_key_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));
        assert_eq!(key.state(), KeyState::Absent);
        assert!(!key.has_stored_key());

        key.init_key().unwrap();
        assert_eq!(key.state(), KeyState::Initialized);
        assert!(key.dir().is_dir());
    }

    #[test]
    fn test_store_activate_deactivate() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, keyring) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));

        key.init_key().unwrap();
        key.store_key(&auth(b"1234"), true).unwrap();
        let desc = key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();
        assert!(keyring.is_installed(&mount, &desc));
        assert_eq!(key.descriptor(), Some(desc));

        key.inactive_key(DeactivateFlag::Logout, &mount).unwrap();
        assert!(!keyring.is_installed(&mount, &desc));
        assert_eq!(key.state(), KeyState::Inactive);
    }

    #[test]
    fn test_double_activate_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, _) = make_key(ProtectionLevel::El1, &dir.path().join("el1/100"));
        key.init_key().unwrap();
        key.store_key(&UserAuth::empty(), true).unwrap();
        key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();

        assert!(matches!(
            key.active_key(ActivateFlag::Retrieve, &mount),
            Err(KeyError::StateConflict(_))
        ));
    }

    #[test]
    fn test_credential_level_needs_fresh_unwrap() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, _) = make_key(ProtectionLevel::El3, &dir.path().join("el3/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();
        key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();
        key.inactive_key(DeactivateFlag::Logout, &mount).unwrap();

        assert!(matches!(
            key.active_key(ActivateFlag::Retrieve, &mount),
            Err(KeyError::StateConflict(_))
        ));
        key.restore_key(&auth(b"pw")).unwrap();
        key.active_key(ActivateFlag::Retrieve, &mount).unwrap();
    }

    #[test]
    fn test_restore_from_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("el2/100");
        let mount = dir.path().join("data");
        let store = Arc::new(SoftKeyStore::ephemeral(false));
        let keyring = Arc::new(ProcessKeyring::new());

        let first = BaseKey::new(
            ProtectionLevel::El2,
            &key_dir,
            64,
            fast_kdf(),
            store.clone(),
            keyring.clone(),
        );
        first.init_key().unwrap();
        first.store_key(&auth(b"secret"), true).unwrap();
        let desc = first.active_key(ActivateFlag::FirstCreate, &mount).unwrap();
        first.inactive_key(DeactivateFlag::Logout, &mount).unwrap();

        let second = BaseKey::new(ProtectionLevel::El2, &key_dir, 64, fast_kdf(), store, keyring);
        assert_eq!(second.state(), KeyState::Initialized);
        assert!(second.is_credential_protected().unwrap());
        second.restore_key(&auth(b"secret")).unwrap();
        assert_eq!(second.active_key(ActivateFlag::Retrieve, &mount).unwrap(), desc);
    }

    #[test]
    fn test_store_over_unrestored_key_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("el2/100");
        let (first, _) = make_key(ProtectionLevel::El2, &key_dir);
        first.init_key().unwrap();
        first.store_key(&auth(b"a"), true).unwrap();

        let (second, _) = make_key(ProtectionLevel::El2, &key_dir);
        assert!(matches!(
            second.store_key(&auth(b"b"), true),
            Err(KeyError::StateConflict(_))
        ));
    }

    #[test]
    fn test_candidate_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("el2/100");
        let (key, _) = make_key(ProtectionLevel::El2, &key_dir);
        key.init_key().unwrap();
        key.store_key(&auth(b"a"), true).unwrap();
        key.store_key(&auth(b"a"), true).unwrap();

        let current = key_dir.join("version_1");
        for name in [SHIELD_FILE, SEC_DISCARD_FILE, ENCRYPTED_FILE, KEY_INFO_FILE] {
            assert!(current.join(name).is_file(), "{name} missing");
        }
        assert!(!key_dir.join("version_0").exists(), "stale candidate kept");
        assert!(!key_dir.join("latest").exists());
    }

    #[test]
    fn test_update_key_requires_active() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, _) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();
        assert!(matches!(
            key.update_key(None),
            Err(KeyError::StateConflict(_))
        ));

        key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();
        key.update_key(None).unwrap();
        key.inactive_key(DeactivateFlag::Logout, &mount).unwrap();
        key.restore_key(&auth(b"pw")).unwrap();
    }

    #[test]
    fn test_update_key_moves_root() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let old_root = dir.path().join("old/el2/100");
        let new_root = dir.path().join("new/el2/100");
        let (key, _) = make_key(ProtectionLevel::El2, &old_root);
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();
        key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();

        key.update_key(Some(&new_root)).unwrap();
        assert_eq!(key.dir(), new_root);
        assert!(!old_root.exists());
        assert!(KeyStorage::new(&new_root).has_key());
    }

    #[test]
    fn test_uece_key_is_enhanced() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El5, &dir.path().join("el5/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();

        let (_, candidate) = KeyStorage::new(key.dir()).load_current().unwrap();
        assert!(candidate.info.enhanced);
        key.restore_key(&auth(b"pw")).unwrap();
    }

    #[test]
    fn test_enhance_round_trip_needs_same_pre_key() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El5, &dir.path().join("el5/100"));
        let pre_key = KeyBlob::random(32);

        let wrapped = key.enhance_encrypt(&pre_key, &[7u8; 48]).unwrap();
        let plain = key.enhance_decrypt(&pre_key, &wrapped, 48).unwrap();
        assert_eq!(plain.as_bytes(), &[7u8; 48]);
        assert!(key
            .enhance_decrypt(&KeyBlob::random(32), &wrapped, 48)
            .is_err());

        let soft = BaseKey::new(
            ProtectionLevel::El5,
            dir.path().join("el5/101"),
            64,
            fast_kdf(),
            Arc::new(SoftKeyStore::ephemeral(false)),
            Arc::new(ProcessKeyring::new()),
        );
        assert!(matches!(
            soft.enhance_encrypt(&pre_key, b"x"),
            Err(KeyError::Unsupported(_))
        ));
    }

    #[test]
    fn test_uece_without_hardware_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let key = BaseKey::new(
            ProtectionLevel::El5,
            dir.path().join("el5/100"),
            64,
            fast_kdf(),
            Arc::new(SoftKeyStore::ephemeral(false)),
            Arc::new(ProcessKeyring::new()),
        );
        key.init_key().unwrap();
        assert!(matches!(
            key.store_key(&auth(b"pw"), true),
            Err(KeyError::Unsupported(_))
        ));
        assert!(!key.has_stored_key(), "failed store must not leave a candidate");
    }

    #[test]
    fn test_clear_key_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, keyring) = make_key(ProtectionLevel::El1, &dir.path().join("el1/100"));
        key.init_key().unwrap();
        key.store_key(&UserAuth::empty(), true).unwrap();
        let desc = key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();

        key.clear_key(&mount).unwrap();
        assert_eq!(key.state(), KeyState::Deleted);
        assert!(!keyring.is_installed(&mount, &desc));
        assert!(!key.dir().exists());
        key.clear_key(&mount).unwrap();
        assert!(matches!(key.init_key(), Err(KeyError::StateConflict(_))));
    }

    #[test]
    fn test_update_auth_switches_secret() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));
        key.init_key().unwrap();
        key.store_key(&UserAuth::empty(), true).unwrap();
        assert!(!key.is_credential_protected().unwrap());

        key.update_auth(&UserAuth::empty(), &auth(b"new"), true).unwrap();
        assert!(key.is_credential_protected().unwrap());
        assert!(matches!(
            key.export_raw(&UserAuth::empty()),
            Err(KeyError::Authentication(_))
        ));
        key.export_raw(&auth(b"new")).unwrap();
    }

    #[test]
    fn test_update_auth_wrong_old_secret_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"old"), true).unwrap();

        assert!(matches!(
            key.update_auth(&auth(b"wrong"), &auth(b"new"), true),
            Err(KeyError::Authentication(_))
        ));
        key.export_raw(&auth(b"old")).unwrap();
    }

    #[test]
    fn test_reinstate_restores_previous_secret() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El3, &dir.path().join("el3/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"old"), true).unwrap();
        let previous = key.snapshot().unwrap();
        let raw = key.export_raw(&auth(b"old")).unwrap();

        key.store_recovered(&raw, &auth(b"new")).unwrap();
        key.reinstate(&previous).unwrap();

        assert_eq!(key.export_raw(&auth(b"old")).unwrap(), raw);
        assert!(matches!(
            key.export_raw(&auth(b"new")),
            Err(KeyError::Authentication(_))
        ));
        assert_eq!(KeyStorage::new(key.dir()).versions().unwrap().len(), 1);
    }

    #[test]
    fn test_key_len_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("el2/100");
        let (key, _) = make_key(ProtectionLevel::El2, &root);
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();

        let short = BaseKey::new(
            ProtectionLevel::El2,
            root.clone(),
            32,
            fast_kdf(),
            Arc::new(SoftKeyStore::ephemeral(true)),
            Arc::new(ProcessKeyring::new()),
        );
        assert!(matches!(
            short.restore_key(&auth(b"pw")),
            Err(KeyError::Corruption { .. })
        ));
    }

    #[test]
    fn test_store_recovered_rejects_foreign_key() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = make_key(ProtectionLevel::El2, &dir.path().join("el2/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"old"), true).unwrap();
        let raw = key.export_raw(&auth(b"old")).unwrap();

        assert!(matches!(
            key.store_recovered(&KeyBlob::random(64), &auth(b"new")),
            Err(KeyError::Corruption { .. })
        ));
        key.store_recovered(&raw, &auth(b"new")).unwrap();
        assert_eq!(key.export_raw(&auth(b"new")).unwrap(), raw);
    }

    #[test]
    fn test_subkey_needs_active_key() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("data");
        let (key, _) = make_key(ProtectionLevel::El5, &dir.path().join("el5/100"));
        key.init_key().unwrap();
        key.store_key(&auth(b"pw"), true).unwrap();
        assert!(key.derive_subkey(b"app", 64).is_err());

        key.active_key(ActivateFlag::FirstCreate, &mount).unwrap();
        let a = key.derive_subkey(b"app", 64).unwrap();
        let b = key.derive_subkey(b"app", 64).unwrap();
        assert_eq!(a, b);
    }
}
