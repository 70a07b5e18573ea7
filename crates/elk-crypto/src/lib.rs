//! elk-crypto: key material handling for the storage key daemon
//!
//! Wrapping layers, innermost first:
//! ```text
//! raw key (64 bytes, random)
//!   └── user layer: XChaCha20-Poly1305, KEK = HKDF(Argon2id(secret, salt), sha256(sec_discard))
//!       └── shield layer: key store wrap bound to a per-candidate shield context
//!           └── enhance layer (El5 only): key store wrap bound to a pre-key
//! ```
//!
//! Erasing `sec_discard` alone makes the user layer unrecoverable.

pub mod blob;
pub mod kdf;
pub mod keystore;
pub mod recovery;
pub mod wrap;

pub use blob::KeyBlob;
pub use kdf::{derive_kek, KdfParams};
pub use keystore::{HardwareKeyStore, ShieldContext, SoftKeyStore};
pub use recovery::{generate_mnemonic, mnemonic_to_recovery_key, MnemonicEscrow, RecoveryEscrow};
pub use wrap::{derive_subkey, open, seal, sealed_len, KeyDescriptor};

use thiserror::Error;

/// Size of a key-encryption key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt stored with each candidate
pub const SALT_SIZE: usize = 16;

/// Size of a key store shield context
pub const SHIELD_SIZE: usize = 32;

/// Size of the secure-discard blob mixed into every KEK
pub const SEC_DISCARD_SIZE: usize = 16384;

/// Size of a key descriptor (filesystem key identifier)
pub const DESCRIPTOR_SIZE: usize = 16;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch: wrong secret, wrong context, or tampered data.
    #[error("authentication failed: {0}")]
    Authentication(&'static str),

    /// Input has the wrong shape (length, encoding) to be key material.
    #[error("malformed key material: {0}")]
    Malformed(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("key store capability unavailable: {0}")]
    Unavailable(&'static str),

    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),
}
