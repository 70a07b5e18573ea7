//! Integration tests for a single key's on-disk lifecycle.
//!
//! Every test builds its keys against a throwaway directory, a software
//! key store, and the in-process keyring, then reopens the directory with
//! a fresh `BaseKey` to check what actually reached disk.

use elk_core::{KeyError, ProtectionLevel, UserAuth};
use elk_crypto::{KdfParams, SoftKeyStore};
use elk_keys::storage::{ENCRYPTED_FILE, STAGING_DIR};
use elk_keys::{ActivateFlag, BaseKey, DeactivateFlag, FsCrypt, KeyState, KeyStorage, ProcessKeyring};
use proptest::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

struct Env {
    keystore: Arc<SoftKeyStore>,
    keyring: Arc<ProcessKeyring>,
}

impl Env {
    fn new() -> Self {
        Self {
            keystore: Arc::new(SoftKeyStore::ephemeral(true)),
            keyring: Arc::new(ProcessKeyring::new()),
        }
    }

    fn key(&self, level: ProtectionLevel, dir: &Path) -> BaseKey {
        BaseKey::new(
            level,
            dir,
            64,
            fast_kdf(),
            self.keystore.clone(),
            self.keyring.clone(),
        )
    }
}

fn auth(secret: &[u8]) -> UserAuth {
    UserAuth::new(b"token".to_vec(), secret.to_vec())
}

#[test]
fn store_then_restore_yields_same_key() {
    let tmp = TempDir::new().unwrap();
    let env = Env::new();
    let dir = tmp.path().join("el2/100");

    let key = env.key(ProtectionLevel::El2, &dir);
    key.init_key().unwrap();
    key.store_key(&auth(b"hunter2"), true).unwrap();
    let stored = key.descriptor().unwrap();
    drop(key);

    let reopened = env.key(ProtectionLevel::El2, &dir);
    assert_eq!(reopened.state(), KeyState::Initialized);
    reopened.restore_key(&auth(b"hunter2")).unwrap();
    let active = reopened
        .active_key(ActivateFlag::Retrieve, tmp.path())
        .unwrap();
    assert_eq!(active, stored);
    assert!(env.keyring.is_installed(tmp.path(), &stored));
}

#[test]
fn init_key_twice_keeps_material() {
    let tmp = TempDir::new().unwrap();
    let env = Env::new();
    let key = env.key(ProtectionLevel::El1, &tmp.path().join("el1/100"));

    key.init_key().unwrap();
    let first = key.descriptor();
    key.init_key().unwrap();
    assert_eq!(key.descriptor(), first);

    key.store_key(&UserAuth::empty(), true).unwrap();
    key.init_key().unwrap();
    assert_eq!(key.descriptor(), first);
}

#[test]
fn leftover_staging_and_torn_version_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let env = Env::new();
    let dir = tmp.path().join("el3/100");

    let key = env.key(ProtectionLevel::El3, &dir);
    key.init_key().unwrap();
    key.store_key(&auth(b"pw"), true).unwrap();
    let stored = key.descriptor().unwrap();
    drop(key);

    let storage = KeyStorage::new(&dir);
    let current = *storage.versions().unwrap().last().unwrap();

    // A crash during staging leaves `latest/` behind.
    let staging = dir.join(STAGING_DIR);
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join(ENCRYPTED_FILE), b"half").unwrap();

    // A newer version whose wrapped key was cut short.
    let torn = storage.candidate_dir(current + 1);
    std::fs::create_dir_all(&torn).unwrap();
    for entry in std::fs::read_dir(storage.candidate_dir(current)).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), torn.join(entry.file_name())).unwrap();
    }
    let encrypted = std::fs::read(torn.join(ENCRYPTED_FILE)).unwrap();
    std::fs::write(torn.join(ENCRYPTED_FILE), &encrypted[..encrypted.len() / 2]).unwrap();

    let reopened = env.key(ProtectionLevel::El3, &dir);
    reopened.restore_key(&auth(b"pw")).unwrap();
    assert_eq!(
        reopened
            .active_key(ActivateFlag::Retrieve, tmp.path())
            .unwrap(),
        stored
    );

    // The next store supersedes both and still restores.
    reopened.update_key(None).unwrap();
    drop(reopened);
    let again = env.key(ProtectionLevel::El3, &dir);
    again.restore_key(&auth(b"pw")).unwrap();
}

#[test]
fn update_auth_then_old_secret_fails() {
    let tmp = TempDir::new().unwrap();
    let env = Env::new();
    let dir = tmp.path().join("el2/100");

    let key = env.key(ProtectionLevel::El2, &dir);
    key.init_key().unwrap();
    key.store_key(&auth(b"old"), true).unwrap();
    key.active_key(ActivateFlag::FirstCreate, tmp.path()).unwrap();
    key.update_auth(&auth(b"old"), &auth(b"new"), true).unwrap();
    key.inactive_key(DeactivateFlag::Logout, tmp.path()).unwrap();
    drop(key);

    let reopened = env.key(ProtectionLevel::El2, &dir);
    assert!(matches!(
        reopened.restore_key(&auth(b"old")),
        Err(KeyError::Authentication(_))
    ));
    reopened.restore_key(&auth(b"new")).unwrap();
}

#[test]
fn destroyed_key_leaves_nothing_on_disk() {
    let tmp = TempDir::new().unwrap();
    let env = Env::new();
    let dir = tmp.path().join("el4/100");

    let key = env.key(ProtectionLevel::El4, &dir);
    key.init_key().unwrap();
    key.store_key(&auth(b"pw"), true).unwrap();
    let descriptor = key.active_key(ActivateFlag::FirstCreate, tmp.path()).unwrap();

    key.clear_key(tmp.path()).unwrap();
    assert_eq!(key.state(), KeyState::Deleted);
    assert!(!dir.exists());
    assert!(!env.keyring.is_installed(tmp.path(), &descriptor));
    key.clear_key(tmp.path()).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn wrong_secret_is_authentication_failure(
        secret in proptest::collection::vec(any::<u8>(), 1..32),
        wrong in proptest::collection::vec(any::<u8>(), 1..32),
    ) {
        prop_assume!(secret != wrong);
        let tmp = TempDir::new().unwrap();
        let env = Env::new();
        let dir = tmp.path().join("el2/100");

        let key = env.key(ProtectionLevel::El2, &dir);
        key.init_key().unwrap();
        key.store_key(&auth(&secret), true).unwrap();
        drop(key);

        let reopened = env.key(ProtectionLevel::El2, &dir);
        let result = reopened.restore_key(&auth(&wrong));
        prop_assert!(matches!(result, Err(KeyError::Authentication(_))), "got {result:?}");
        prop_assert_eq!(reopened.state(), KeyState::Initialized);
    }
}
