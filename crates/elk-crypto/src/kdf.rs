//! Key derivation: user secret + secure-discard blob → key-encryption key

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, KeyBlob, KEY_SIZE, SALT_SIZE};

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Derive the key-encryption key for one candidate.
///
/// A non-empty secret is stretched with Argon2id over `salt`; the empty
/// secret (keys created before the user sets a credential) skips that
/// step. Either way the result is bound to `sec_discard` through
/// HKDF-SHA256, so erasing that blob destroys the KEK.
pub fn derive_kek(
    secret: &[u8],
    salt: &[u8; SALT_SIZE],
    sec_discard: &[u8],
    params: &KdfParams,
) -> CryptoResult<KeyBlob> {
    let mut stretched = Zeroizing::new([0u8; KEY_SIZE]);
    let ikm: &[u8] = if secret.is_empty() {
        &[]
    } else {
        let argon2_params = Params::new(
            params.mem_cost_kib,
            params.time_cost,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

        Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
            .hash_password_into(secret, salt, &mut stretched[..])
            .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")))?;
        &stretched[..]
    };

    let discard_digest = Sha256::digest(sec_discard);
    let hkdf = Hkdf::<Sha256>::new(Some(discard_digest.as_slice()), ikm);
    let mut okm = vec![0u8; KEY_SIZE];
    hkdf.expand(b"elk-kek-v1", &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(KeyBlob::new(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let salt = [1u8; SALT_SIZE];
        let discard = [9u8; 64];

        let key1 = derive_kek(b"test-passphrase-123", &salt, &discard, &fast_params()).unwrap();
        let key2 = derive_kek(b"test-passphrase-123", &salt, &discard, &fast_params()).unwrap();

        assert_eq!(key1, key2, "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_secrets() {
        let salt = [1u8; SALT_SIZE];
        let discard = [9u8; 64];

        let key1 = derive_kek(b"secret-a", &salt, &discard, &fast_params()).unwrap();
        let key2 = derive_kek(b"secret-b", &salt, &discard, &fast_params()).unwrap();

        assert_ne!(key1, key2, "different secrets must produce different keys");
    }

    #[test]
    fn test_kdf_bound_to_sec_discard() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_kek(b"same", &salt, &[1u8; 64], &fast_params()).unwrap();
        let key2 = derive_kek(b"same", &salt, &[2u8; 64], &fast_params()).unwrap();

        assert_ne!(key1, key2, "a new sec_discard must change the KEK");
    }

    #[test]
    fn test_empty_secret_skips_argon2() {
        let salt = [1u8; SALT_SIZE];
        let discard = [3u8; 64];
        let bogus = KdfParams {
            mem_cost_kib: 0,
            time_cost: 0,
            parallelism: 0,
        };

        // Invalid Argon2 params are never touched for the empty secret.
        let key = derive_kek(b"", &salt, &discard, &bogus).unwrap();
        assert_eq!(key.len(), KEY_SIZE);
        assert!(derive_kek(b"x", &salt, &discard, &bogus).is_err());
    }
}
