//! Hardware key store capability and a software stand-in.
//!
//! The key store adds a wrap on top of the user-secret layer, bound to a
//! per-candidate shield context. Rotating the context (after a platform
//! security update) re-shields a key without the user's credential.

use hkdf::Hkdf;
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::wrap::{open, seal};
use crate::{CryptoError, CryptoResult, KeyBlob, KEY_SIZE, SHIELD_SIZE};

/// Opaque context the key store binds a wrap to.
#[derive(Clone, PartialEq, Eq)]
pub struct ShieldContext {
    blob: KeyBlob,
}

impl ShieldContext {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SHIELD_SIZE {
            return Err(CryptoError::Malformed(format!(
                "shield context is {} bytes (expected {SHIELD_SIZE})",
                bytes.len()
            )));
        }
        Ok(Self {
            blob: KeyBlob::from_slice(bytes),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.blob.as_bytes()
    }
}

impl std::fmt::Debug for ShieldContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShieldContext([REDACTED])")
    }
}

/// Wrap/unwrap service backed by device hardware.
pub trait HardwareKeyStore: Send + Sync {
    /// Whether the enhanced (UECE) wrap is offered on this device.
    fn is_available(&self) -> bool;

    fn generate_context(&self) -> CryptoResult<ShieldContext>;

    /// Wrap `plain` under the secret held by `ctx`.
    fn wrap(&self, ctx: &ShieldContext, plain: &[u8]) -> CryptoResult<Vec<u8>>;

    fn unwrap(&self, ctx: &ShieldContext, wrapped: &[u8], plain_len: usize)
        -> CryptoResult<KeyBlob>;

    /// Additional wrap for extra-protected key classes, keyed by `pre_key`.
    fn enhance_wrap(&self, pre_key: &KeyBlob, plain: &[u8]) -> CryptoResult<Vec<u8>>;

    fn enhance_unwrap(
        &self,
        pre_key: &KeyBlob,
        wrapped: &[u8],
        plain_len: usize,
    ) -> CryptoResult<KeyBlob>;
}

/// Software key store rooted in a device seed file.
pub struct SoftKeyStore {
    root: KeyBlob,
    enhanced: bool,
}

impl SoftKeyStore {
    /// Load the seed at `path`, creating it on first use.
    pub fn open(path: &Path, enhanced: bool) -> CryptoResult<Self> {
        let root = match std::fs::read(path) {
            Ok(bytes) if bytes.len() == KEY_SIZE => KeyBlob::new(bytes),
            Ok(bytes) => {
                return Err(CryptoError::Malformed(format!(
                    "key store seed {} is {} bytes (expected {KEY_SIZE})",
                    path.display(),
                    bytes.len()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let root = KeyBlob::random(KEY_SIZE);
                write_seed(path, &root)?;
                info!(path = %path.display(), "key store seed created");
                root
            }
            Err(e) => return Err(CryptoError::Io(e)),
        };
        Ok(Self { root, enhanced })
    }

    /// A store whose seed lives only in memory.
    pub fn ephemeral(enhanced: bool) -> Self {
        Self {
            root: KeyBlob::random(KEY_SIZE),
            enhanced,
        }
    }

    fn shield_kek(&self, ctx: &ShieldContext) -> CryptoResult<KeyBlob> {
        expand(ctx.as_bytes(), &self.root, b"elk-shield-v1")
    }

    fn enhance_kek(&self, pre_key: &KeyBlob) -> CryptoResult<KeyBlob> {
        if !self.enhanced {
            return Err(CryptoError::Unavailable("enhanced wrap not supported"));
        }
        expand(pre_key.as_bytes(), &self.root, b"elk-enhance-v1")
    }
}

fn expand(salt: &[u8], ikm: &KeyBlob, info: &[u8]) -> CryptoResult<KeyBlob> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm.as_bytes());
    let mut okm = vec![0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(KeyBlob::new(okm))
}

fn write_seed(path: &Path, root: &KeyBlob) -> CryptoResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp: PathBuf = path.with_extension("tmp");
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(root.as_bytes())?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        std::fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

impl HardwareKeyStore for SoftKeyStore {
    fn is_available(&self) -> bool {
        self.enhanced
    }

    fn generate_context(&self) -> CryptoResult<ShieldContext> {
        Ok(ShieldContext {
            blob: KeyBlob::random(SHIELD_SIZE),
        })
    }

    fn wrap(&self, ctx: &ShieldContext, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        let kek = self.shield_kek(ctx)?;
        seal(&kek, b"shield", plain)
    }

    fn unwrap(
        &self,
        ctx: &ShieldContext,
        wrapped: &[u8],
        plain_len: usize,
    ) -> CryptoResult<KeyBlob> {
        let kek = self.shield_kek(ctx)?;
        open(&kek, b"shield", wrapped, plain_len)
    }

    fn enhance_wrap(&self, pre_key: &KeyBlob, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        let kek = self.enhance_kek(pre_key)?;
        seal(&kek, b"enhance", plain)
    }

    fn enhance_unwrap(
        &self,
        pre_key: &KeyBlob,
        wrapped: &[u8],
        plain_len: usize,
    ) -> CryptoResult<KeyBlob> {
        let kek = self.enhance_kek(pre_key)?;
        open(&kek, b"enhance", wrapped, plain_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealed_len;

    #[test]
    fn test_shield_roundtrip() {
        let store = SoftKeyStore::ephemeral(false);
        let ctx = store.generate_context().unwrap();
        let wrapped = store.wrap(&ctx, &[3u8; 40]).unwrap();
        let plain = store.unwrap(&ctx, &wrapped, 40).unwrap();
        assert_eq!(plain.as_bytes(), &[3u8; 40]);
    }

    #[test]
    fn test_shield_wrong_context_fails() {
        let store = SoftKeyStore::ephemeral(false);
        let ctx = store.generate_context().unwrap();
        let other = store.generate_context().unwrap();
        let wrapped = store.wrap(&ctx, &[3u8; 40]).unwrap();

        assert!(matches!(
            store.unwrap(&other, &wrapped, 40),
            Err(CryptoError::Authentication(_))
        ));
    }

    #[test]
    fn test_shield_bound_to_device_seed() {
        let store = SoftKeyStore::ephemeral(false);
        let other_device = SoftKeyStore::ephemeral(false);
        let ctx = store.generate_context().unwrap();
        let wrapped = store.wrap(&ctx, &[3u8; 40]).unwrap();

        assert!(other_device.unwrap(&ctx, &wrapped, 40).is_err());
    }

    #[test]
    fn test_enhance_gated_by_availability() {
        let pre_key = KeyBlob::random(32);
        let plain_store = SoftKeyStore::ephemeral(false);
        assert!(matches!(
            plain_store.enhance_wrap(&pre_key, b"data"),
            Err(CryptoError::Unavailable(_))
        ));

        let store = SoftKeyStore::ephemeral(true);
        let wrapped = store.enhance_wrap(&pre_key, &[1u8; 64]).unwrap();
        assert_eq!(wrapped.len(), sealed_len(64));
        let plain = store.enhance_unwrap(&pre_key, &wrapped, 64).unwrap();
        assert_eq!(plain.as_bytes(), &[1u8; 64]);
    }

    #[test]
    fn test_seed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore/root.key");

        let first = SoftKeyStore::open(&path, false).unwrap();
        let ctx = first.generate_context().unwrap();
        let wrapped = first.wrap(&ctx, &[8u8; 16]).unwrap();

        let second = SoftKeyStore::open(&path, false).unwrap();
        let plain = second.unwrap(&ctx, &wrapped, 16).unwrap();
        assert_eq!(plain.as_bytes(), &[8u8; 16]);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_seed_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.key");
        SoftKeyStore::open(&path, false).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap().len(), KEY_SIZE);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_bad_seed_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.key");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            SoftKeyStore::open(&path, false),
            Err(CryptoError::Malformed(_))
        ));
    }
}
