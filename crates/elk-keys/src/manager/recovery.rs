//! Recovery-key unlock path
//!
//! `create_recover_key` escrows a copy of each credential-level key wrapped
//! by a mnemonic-derived recovery key, bound to the user's secure-uid.
//! Later the mnemonic is handed back with `set_recover_key`, and
//! `update_use_auth_with_recovery_key` unwraps the escrow and re-stores
//! every key under a new credential.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use elk_core::{KeyError, KeyResult, ProtectionLevel, UserAuth, UserId};
use elk_crypto::{generate_mnemonic, mnemonic_to_recovery_key, KeyBlob, KeyDescriptor};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::KeyManager;
use crate::base_key::crypto_err;
use crate::lock;
use crate::storage::wipe_file;

const ESCROW_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EscrowFile {
    format: u32,
    user: UserId,
    entries: Vec<EscrowEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EscrowEntry {
    level: ProtectionLevel,
    key_len: usize,
    /// base64 of the escrow-wrapped raw key
    wrapped: String,
}

impl KeyManager {
    fn escrow_path(&self, user: UserId) -> PathBuf {
        self.escrow_dir.join(format!("{user}.json"))
    }

    /// Generate a recovery mnemonic for `user` and escrow every stored
    /// credential-level key under it. The mnemonic is returned once and
    /// never stored.
    pub fn create_recover_key(
        &self,
        user: UserId,
        secure_uid: u64,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> KeyResult<SecretString> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        let auth = UserAuth::new(token, secret);
        let keys: Vec<_> = ProtectionLevel::credential_levels()
            .filter_map(|level| self.stored_key(user, level))
            .collect();
        if keys.is_empty() {
            return Err(KeyError::UserNotFound(user));
        }

        let path = self.escrow_path(user);
        let (words, recovery_key) =
            generate_mnemonic().map_err(|e| crypto_err(&self.escrow_dir, e))?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            let raw = match key.export_raw(&auth) {
                Err(KeyError::Authentication(_))
                    if auth.has_secret() && matches!(key.is_credential_protected(), Ok(false)) =>
                {
                    key.export_raw(&UserAuth::empty())?
                }
                result => result?,
            };
            let wrapped = self
                .escrow
                .wrap_for_escrow(&recovery_key, secure_uid, &raw)
                .map_err(|e| crypto_err(&path, e))?;
            entries.push(EscrowEntry {
                level: key.level(),
                key_len: raw.len(),
                wrapped: B64.encode(wrapped),
            });
        }

        let file = EscrowFile {
            format: ESCROW_FORMAT,
            user,
            entries,
        };
        write_escrow(&path, &file)?;
        self.update_status(user, |status| status.secure_uid = Some(secure_uid));
        info!(user, levels = file.entries.len(), "recovery key created");
        Ok(words)
    }

    /// Accept a recovery mnemonic for the next recovery unlock.
    pub fn set_recover_key(&self, mnemonic: &[u8]) -> KeyResult<()> {
        let words = std::str::from_utf8(mnemonic)
            .map_err(|_| KeyError::InvalidArgument("recovery key is not valid UTF-8".into()))?;
        let key = mnemonic_to_recovery_key(words.trim())
            .map_err(|e| KeyError::InvalidArgument(format!("recovery key rejected: {e}")))?;
        *lock(&self.pending_recovery) = Some(key);
        info!("recovery key set");
        Ok(())
    }

    /// Unwrap the user's escrowed keys with the pending recovery key and
    /// re-store them under `new_secret`. Nothing is re-stored unless every
    /// escrowed key unwraps for `secure_uid` and matches its stored key; if
    /// a re-store fails, the keys already re-stored get their previous
    /// candidate back. Returns the recovered keys.
    pub fn update_use_auth_with_recovery_key(
        &self,
        token: Vec<u8>,
        new_secret: Vec<u8>,
        secure_uid: u64,
        user: UserId,
    ) -> KeyResult<Vec<KeyBlob>> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        let recovery_key = lock(&self.pending_recovery)
            .take()
            .ok_or_else(|| KeyError::StateConflict("no recovery key has been set".into()))?;

        let path = self.escrow_path(user);
        let file = read_escrow(&path)?.ok_or(KeyError::UserNotFound(user))?;
        if file.user != user {
            return Err(KeyError::corrupt(
                &path,
                format!("escrow belongs to user {}", file.user),
            ));
        }

        let mut recovered = Vec::with_capacity(file.entries.len());
        for entry in &file.entries {
            if entry.key_len != self.config.key_len {
                return Err(KeyError::corrupt(
                    &path,
                    format!("escrowed {} key is {} bytes", entry.level, entry.key_len),
                ));
            }
            let wrapped = B64
                .decode(&entry.wrapped)
                .map_err(|e| KeyError::corrupt(&path, format!("bad escrow blob: {e}")))?;
            let raw = self
                .escrow
                .verify_and_unwrap(&recovery_key, secure_uid, &wrapped, entry.key_len)
                .map_err(|e| crypto_err(&path, e))?;
            recovered.push((entry.level, raw));
        }

        // Every recovered key must match its stored key before any is
        // re-stored.
        let mut staged = Vec::with_capacity(recovered.len());
        for (level, raw) in &recovered {
            let key = self.key_or_load(user, *level);
            let found = KeyDescriptor::for_key(raw).map_err(|e| crypto_err(&path, e))?;
            if key.key_descriptor()? != found {
                return Err(KeyError::corrupt(
                    key.dir(),
                    "recovered key does not match the stored key",
                ));
            }
            let previous = key.snapshot()?;
            staged.push((key, previous));
        }

        let auth = UserAuth::new(token, new_secret);
        for (done, ((key, _), (_, raw))) in staged.iter().zip(&recovered).enumerate() {
            if let Err(e) = key.store_recovered(raw, &auth) {
                error!(user, level = %key.level(), "recovery re-wrap failed: {e}");
                for (key, previous) in staged[..done].iter().rev() {
                    if let Err(e) = key.reinstate(previous) {
                        error!(user, level = %key.level(), "failed to reinstate key: {e}");
                    }
                }
                return Err(e);
            }
        }
        self.update_status(user, |status| status.secure_uid = Some(secure_uid));
        info!(user, levels = recovered.len(), "credential reset with recovery key");
        Ok(recovered.into_iter().map(|(_, raw)| raw).collect())
    }

    pub(super) fn remove_escrow(&self, user: UserId) {
        let path = self.escrow_path(user);
        match wipe_file(&path) {
            Ok(()) => info!(user, "recovery escrow removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(user, path = %path.display(), "failed to remove recovery escrow: {e}"),
        }
    }
}

fn read_escrow(path: &Path) -> KeyResult<Option<EscrowFile>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KeyError::io(path, e)),
    };
    let file: EscrowFile = serde_json::from_slice(&bytes)
        .map_err(|e| KeyError::corrupt(path, format!("bad escrow file: {e}")))?;
    if file.format != ESCROW_FORMAT {
        return Err(KeyError::corrupt(
            path,
            format!("unknown escrow format {}", file.format),
        ));
    }
    Ok(Some(file))
}

/// Write through a temporary file and rename over the old escrow.
fn write_escrow(path: &Path, file: &EscrowFile) -> KeyResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KeyError::InvalidArgument(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| KeyError::io(dir, e))?;

    let json = serde_json::to_vec_pretty(file)
        .map_err(|e| KeyError::corrupt(path, format!("encode escrow: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut out = options.open(&tmp).map_err(|e| KeyError::io(&tmp, e))?;
    out.write_all(&json)
        .and_then(|()| out.sync_all())
        .map_err(|e| KeyError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| KeyError::io(path, e))
}
