//! Recovery-key escrow
//!
//! `CreateRecoverKey` produces a 24-word BIP-39 mnemonic. The mnemonic is
//! stretched into a recovery key, which wraps a copy of each user key for
//! escrow. Every escrowed wrap carries the user's secure-uid as associated
//! data, so a blob escrowed for one user cannot be unwrapped on behalf of
//! another.

use bip39::Mnemonic;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::kdf::KdfParams;
use crate::wrap::{open, seal};
use crate::{CryptoError, CryptoResult, KeyBlob, KEY_SIZE};

/// Generate a new 24-word mnemonic and derive its recovery key.
///
/// The mnemonic is handed to the caller once and never stored.
pub fn generate_mnemonic() -> CryptoResult<(SecretString, KeyBlob)> {
    // 24 words = 256 bits of entropy
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy);

    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| CryptoError::Kdf(format!("BIP-39 mnemonic generation failed: {e}")))?;
    zeroize::Zeroize::zeroize(&mut entropy);

    let words = SecretString::from(mnemonic.to_string());
    let key = mnemonic_to_recovery_key(words.expose_secret())?;

    Ok((words, key))
}

/// Recover the recovery key from a mnemonic.
///
/// The salt is fixed; the mnemonic itself carries 256 bits of entropy.
pub fn mnemonic_to_recovery_key(words: &str) -> CryptoResult<KeyBlob> {
    let _mnemonic: Mnemonic = words
        .parse()
        .map_err(|e| CryptoError::Malformed(format!("invalid BIP-39 mnemonic: {e}")))?;

    let salt: [u8; 16] = *b"elk-recovery-v01";

    // Lighter params: the input is already high-entropy
    let params = KdfParams {
        mem_cost_kib: 16384,
        time_cost: 2,
        parallelism: 1,
    };

    let argon2_params = argon2::Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;
    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let mut key = vec![0u8; KEY_SIZE];
    argon2
        .hash_password_into(words.as_bytes(), &salt, &mut key)
        .map_err(|e| CryptoError::Kdf(format!("Argon2id KDF failed: {e}")))?;
    Ok(KeyBlob::new(key))
}

/// Escrow service that can unwrap user keys with a recovery key.
pub trait RecoveryEscrow: Send + Sync {
    fn wrap_for_escrow(
        &self,
        recovery_key: &KeyBlob,
        secure_uid: u64,
        raw: &KeyBlob,
    ) -> CryptoResult<Vec<u8>>;

    /// Fails with `Authentication` if `secure_uid` is not the one the blob
    /// was escrowed for.
    fn verify_and_unwrap(
        &self,
        recovery_key: &KeyBlob,
        secure_uid: u64,
        wrapped: &[u8],
        plain_len: usize,
    ) -> CryptoResult<KeyBlob>;
}

/// Local escrow keyed directly by the mnemonic-derived recovery key.
#[derive(Debug, Default, Clone, Copy)]
pub struct MnemonicEscrow;

fn escrow_aad(secure_uid: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(10 + 8);
    aad.extend_from_slice(b"elk-escrow");
    aad.extend_from_slice(&secure_uid.to_be_bytes());
    aad
}

impl RecoveryEscrow for MnemonicEscrow {
    fn wrap_for_escrow(
        &self,
        recovery_key: &KeyBlob,
        secure_uid: u64,
        raw: &KeyBlob,
    ) -> CryptoResult<Vec<u8>> {
        seal(recovery_key, &escrow_aad(secure_uid), raw.as_bytes())
    }

    fn verify_and_unwrap(
        &self,
        recovery_key: &KeyBlob,
        secure_uid: u64,
        wrapped: &[u8],
        plain_len: usize,
    ) -> CryptoResult<KeyBlob> {
        open(recovery_key, &escrow_aad(secure_uid), wrapped, plain_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_mnemonic() {
        let (words, key) = generate_mnemonic().unwrap();

        let word_count = words.expose_secret().split_whitespace().count();
        assert_eq!(word_count, 24, "BIP-39 mnemonic must have 24 words");
        assert_ne!(key.as_bytes(), &[0u8; 32], "key must not be all zeros");
    }

    #[test]
    fn test_mnemonic_recovery_roundtrip() {
        let (words, original_key) = generate_mnemonic().unwrap();

        let recovered_key = mnemonic_to_recovery_key(words.expose_secret()).unwrap();
        assert_eq!(original_key, recovered_key, "recovered key must match original");
    }

    #[test]
    fn test_invalid_mnemonic() {
        let result = mnemonic_to_recovery_key("not a valid mnemonic at all");
        assert!(matches!(result, Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_escrow_bound_to_secure_uid() {
        let recovery_key = KeyBlob::random(KEY_SIZE);
        let raw = KeyBlob::random(64);
        let escrow = MnemonicEscrow;

        let wrapped = escrow.wrap_for_escrow(&recovery_key, 7, &raw).unwrap();
        let plain = escrow
            .verify_and_unwrap(&recovery_key, 7, &wrapped, 64)
            .unwrap();
        assert_eq!(plain, raw);

        let cross_user = escrow.verify_and_unwrap(&recovery_key, 8, &wrapped, 64);
        assert!(matches!(cross_user, Err(CryptoError::Authentication(_))));
    }
}
