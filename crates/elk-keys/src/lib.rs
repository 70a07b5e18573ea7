//! elk-keys: the key lifecycle of the storage key daemon
//!
//! Layering, bottom up:
//!   - [`storage::KeyStorage`]: versioned candidate directories on disk
//!   - [`base_key::BaseKey`]: one (user, level) key and its state machine
//!   - [`delay::DelayHandler`]: debounced deferred work per user
//!   - [`manager::KeyManager`]: the per-user, per-level registry and every
//!     request-facing operation
//!
//! The filesystem encryption mechanism and the hardware key store are
//! capabilities ([`fscrypt::FsCrypt`], [`elk_crypto::HardwareKeyStore`]).

pub mod base_key;
pub mod delay;
pub mod fscrypt;
pub mod manager;
pub mod policy;
pub mod secure_delete;
pub mod storage;

pub use base_key::{ActivateFlag, BaseKey, DeactivateFlag, KeyState};
pub use delay::DelayHandler;
pub use fscrypt::{FsCrypt, ProcessKeyring};
pub use manager::{Collaborators, KeyManager};
pub use secure_delete::{mark_key_roots, PermissionMarker, SecureDeleteMarker};
pub use storage::{Candidate, KeyInfo, KeyStorage};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent
/// before any call that can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
