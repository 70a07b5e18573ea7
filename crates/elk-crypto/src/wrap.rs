//! AEAD key wrapping, key descriptors, HKDF sub-keys

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{CryptoError, CryptoResult, KeyBlob, DESCRIPTOR_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Length of `seal` output for a plaintext of `plain_len` bytes.
pub const fn sealed_len(plain_len: usize) -> usize {
    NONCE_SIZE + plain_len + TAG_SIZE
}

fn cipher(kek: &KeyBlob) -> CryptoResult<XChaCha20Poly1305> {
    if kek.len() != KEY_SIZE {
        return Err(CryptoError::Malformed(format!(
            "wrapping key is {} bytes (expected {KEY_SIZE})",
            kek.len()
        )));
    }
    XChaCha20Poly1305::new_from_slice(kek.as_bytes())
        .map_err(|e| CryptoError::Malformed(format!("wrapping key rejected: {e}")))
}

/// Encrypt `plain` under `kek` with a random nonce.
///
/// Output: `[24-byte nonce][ciphertext][16-byte tag]`
pub fn seal(kek: &KeyBlob, aad: &[u8], plain: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = cipher(kek)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plain, aad })
        .map_err(|_| CryptoError::Malformed("key wrapping failed".into()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`seal`].
///
/// The length is checked against `plain_len` before any decryption, so a
/// truncated or padded blob is reported as `Malformed` and a tag mismatch
/// (wrong key or tampering) as `Authentication`.
pub fn open(kek: &KeyBlob, aad: &[u8], sealed: &[u8], plain_len: usize) -> CryptoResult<KeyBlob> {
    if sealed.len() != sealed_len(plain_len) {
        return Err(CryptoError::Malformed(format!(
            "wrapped blob is {} bytes (expected {})",
            sealed.len(),
            sealed_len(plain_len)
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = cipher(kek)?;

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication("invalid key or corrupted data"))?;

    Ok(KeyBlob::new(plaintext))
}

/// HKDF-SHA256 expansion of `parent` into a `len`-byte sub-key.
pub fn derive_subkey(parent: &KeyBlob, info: &[u8], len: usize) -> CryptoResult<KeyBlob> {
    let hkdf = Hkdf::<Sha256>::new(None, parent.as_bytes());
    let mut okm = vec![0u8; len];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(KeyBlob::new(okm))
}

/// Filesystem-facing identifier of a raw key.
///
/// Derived one-way from the key, so it can be persisted and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyDescriptor([u8; DESCRIPTOR_SIZE]);

impl KeyDescriptor {
    pub fn for_key(raw: &KeyBlob) -> CryptoResult<Self> {
        let id = derive_subkey(raw, b"elk-key-identifier", DESCRIPTOR_SIZE)?;
        let mut bytes = [0u8; DESCRIPTOR_SIZE];
        bytes.copy_from_slice(id.as_bytes());
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; DESCRIPTOR_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DESCRIPTOR_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let raw = hex::decode(s)
            .map_err(|e| CryptoError::Malformed(format!("descriptor is not hex: {e}")))?;
        let bytes: [u8; DESCRIPTOR_SIZE] = raw.try_into().map_err(|v: Vec<u8>| {
            CryptoError::Malformed(format!(
                "descriptor is {} bytes (expected {DESCRIPTOR_SIZE})",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for KeyDescriptor {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<KeyDescriptor> for String {
    fn from(value: KeyDescriptor) -> Self {
        value.to_hex()
    }
}
