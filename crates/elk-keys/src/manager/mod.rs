//! Per-user key manager
//!
//! Owns every `BaseKey` in a single registry keyed by (user, level), plus
//! the per-user side state (screen-lock status, secure uid, delay
//! handlers, application keys). The registry lock is held only to look up,
//! insert, or remove entries; cryptographic and filesystem work runs under
//! the individual key's own lock.
//!
//! Level ordering: keys are brought up El1 first and torn down in reverse.

mod recovery;
mod screen;

use elk_core::{
    ElkConfig, FileList, KeyError, KeyResult, KeysConfig, LevelMask, ProtectionLevel, UserAuth,
    UserId, GLOBAL_USER_ID, MAX_USER_ID,
};
use elk_crypto::{HardwareKeyStore, KdfParams, KeyBlob, KeyDescriptor, RecoveryEscrow};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::base_key::{ActivateFlag, BaseKey, DeactivateFlag};
use crate::delay::DelayHandler;
use crate::fscrypt::FsCrypt;
use crate::lock;
use crate::policy::{
    apply_dir_policy, is_encrypted, remove_dir_policy, set_directory_policies, user_data_dir,
    with_dir_retry,
};
use crate::storage::KeyStorage;

/// External capabilities the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub keystore: Arc<dyn HardwareKeyStore>,
    pub fscrypt: Arc<dyn FsCrypt>,
    pub escrow: Arc<dyn RecoveryEscrow>,
}

#[derive(Debug, Default, Clone, Copy)]
struct UserStatus {
    screen_locked: bool,
    secure_uid: Option<u64>,
}

pub struct KeyManager {
    config: KeysConfig,
    escrow_dir: PathBuf,
    kdf: KdfParams,
    keystore: Arc<dyn HardwareKeyStore>,
    fscrypt: Arc<dyn FsCrypt>,
    escrow: Arc<dyn RecoveryEscrow>,
    runtime: Handle,
    keys: Mutex<HashMap<(UserId, ProtectionLevel), Arc<BaseKey>>>,
    delays: Mutex<HashMap<UserId, Arc<DelayHandler>>>,
    users: Mutex<HashMap<UserId, UserStatus>>,
    /// Application key id -> descriptor, per user
    app_keys: Mutex<HashMap<UserId, HashMap<String, KeyDescriptor>>>,
    pending_recovery: Mutex<Option<KeyBlob>>,
    /// Held for the duration of one user's lifecycle transition.
    transitions: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

fn validate_user(user: UserId) -> KeyResult<()> {
    if user > MAX_USER_ID {
        return Err(KeyError::InvalidArgument(format!(
            "user id {user} out of range (max {MAX_USER_ID})"
        )));
    }
    Ok(())
}

impl KeyManager {
    /// `runtime` hosts the deferred screen-lock work.
    pub fn new(config: &ElkConfig, collaborators: Collaborators, runtime: Handle) -> Self {
        let kdf = KdfParams {
            mem_cost_kib: config.crypto.argon2_mem_cost_kib,
            time_cost: config.crypto.argon2_time_cost,
            parallelism: config.crypto.argon2_parallelism,
        };
        Self {
            config: config.keys.clone(),
            escrow_dir: config.recovery.escrow_dir.clone(),
            kdf,
            keystore: collaborators.keystore,
            fscrypt: collaborators.fscrypt,
            escrow: collaborators.escrow,
            runtime,
            keys: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            app_keys: Mutex::new(HashMap::new()),
            pending_recovery: Mutex::new(None),
            transitions: Mutex::new(HashMap::new()),
        }
    }

    /// Directories that hold key material, for startup marking.
    pub fn key_roots(&self) -> Vec<PathBuf> {
        vec![
            self.config.device_key_dir.clone(),
            self.config.storage_root.clone(),
            self.escrow_dir.clone(),
        ]
    }

    pub fn get_key_dir_by_type(&self, level: ProtectionLevel) -> PathBuf {
        self.config.level_root(level)
    }

    pub fn get_key_dir_by_user_and_type(&self, user: UserId, level: ProtectionLevel) -> PathBuf {
        match level {
            ProtectionLevel::DeviceGlobal => self.config.level_root(level),
            _ => self.config.level_root(level).join(user.to_string()),
        }
    }

    fn mount(&self) -> PathBuf {
        self.config.mount_point()
    }

    fn uece_supported(&self) -> bool {
        self.keystore.is_available()
    }

    // -- registry -----------------------------------------------------------

    fn key(&self, user: UserId, level: ProtectionLevel) -> Option<Arc<BaseKey>> {
        lock(&self.keys).get(&(user, level)).cloned()
    }

    fn new_key(&self, user: UserId, level: ProtectionLevel) -> BaseKey {
        BaseKey::new(
            level,
            self.get_key_dir_by_user_and_type(user, level),
            self.config.key_len,
            self.kdf.clone(),
            Arc::clone(&self.keystore),
            Arc::clone(&self.fscrypt),
        )
    }

    /// The registered key, creating the entry if there is none. The new
    /// key is built before the registry is locked; if another caller
    /// registers one first, theirs wins.
    fn key_or_load(&self, user: UserId, level: ProtectionLevel) -> Arc<BaseKey> {
        if let Some(key) = self.key(user, level) {
            return key;
        }
        let candidate = Arc::new(self.new_key(user, level));
        Arc::clone(lock(&self.keys).entry((user, level)).or_insert(candidate))
    }

    /// The key for (user, level) if it is registered or stored on disk.
    fn stored_key(&self, user: UserId, level: ProtectionLevel) -> Option<Arc<BaseKey>> {
        if let Some(key) = self.key(user, level) {
            return Some(key);
        }
        if !KeyStorage::new(self.get_key_dir_by_user_and_type(user, level)).has_key() {
            return None;
        }
        Some(self.key_or_load(user, level))
    }

    fn forget_key(&self, user: UserId, level: ProtectionLevel) {
        lock(&self.keys).remove(&(user, level));
    }

    /// Registered keys of `user`, El1 first.
    fn user_keys(&self, user: UserId) -> Vec<Arc<BaseKey>> {
        let mut keys: Vec<Arc<BaseKey>> = lock(&self.keys)
            .iter()
            .filter(|((owner, _), _)| *owner == user)
            .map(|(_, key)| Arc::clone(key))
            .collect();
        keys.sort_by_key(|key| key.level());
        keys
    }

    /// Whether `user` has any key, registered or on disk.
    fn user_exists(&self, user: UserId) -> bool {
        !self.user_keys(user).is_empty()
            || ProtectionLevel::USER_LEVELS.iter().any(|level| {
                KeyStorage::new(self.get_key_dir_by_user_and_type(user, *level)).has_key()
            })
    }

    fn transition_lock(&self, user: UserId) -> Arc<Mutex<()>> {
        Arc::clone(lock(&self.transitions).entry(user).or_default())
    }

    /// Drop the user's transition lock unless another caller holds or
    /// waits on it.
    fn prune_transition(&self, user: UserId, transition: &Arc<Mutex<()>>) {
        let mut transitions = lock(&self.transitions);
        if Arc::strong_count(transition) == 2 {
            transitions.remove(&user);
        }
    }

    fn update_status(&self, user: UserId, f: impl FnOnce(&mut UserStatus)) {
        f(lock(&self.users).entry(user).or_default());
    }

    /// Users with a key directory under a level root.
    fn stored_users(&self, level: ProtectionLevel) -> KeyResult<Vec<UserId>> {
        let root = self.get_key_dir_by_type(level);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeyError::io(&root, e)),
        };
        let mut users: Vec<UserId> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();
        users.sort_unstable();
        Ok(users)
    }

    // -- shared steps -------------------------------------------------------

    /// Restore `key` with `auth`. A key stored before the user set a
    /// credential is retried with the empty secret.
    fn restore_with_fallback(&self, key: &BaseKey, auth: &UserAuth) -> KeyResult<()> {
        let dir = key.dir();
        match with_dir_retry(&dir, || key.restore_key(auth)) {
            Err(KeyError::Authentication(_))
                if auth.has_secret() && matches!(key.is_credential_protected(), Ok(false)) =>
            {
                debug!(level = %key.level(), "key has no credential yet, using the empty secret");
                key.restore_key(&UserAuth::empty())
            }
            result => result,
        }
    }

    /// Restore a stored key, or generate and store a new one, under the
    /// empty credential. Returns how the key should be activated.
    fn create_or_restore(&self, key: &BaseKey) -> KeyResult<ActivateFlag> {
        let dir = key.dir();
        if key.has_stored_key() {
            with_dir_retry(&dir, || key.restore_key(&UserAuth::empty()))?;
            Ok(ActivateFlag::Retrieve)
        } else {
            with_dir_retry(&dir, || key.init_key())?;
            key.store_key(&UserAuth::empty(), true)?;
            Ok(ActivateFlag::FirstCreate)
        }
    }

    /// Generate, store, activate, and bind one level for a user.
    fn generate_level(
        &self,
        user: UserId,
        level: ProtectionLevel,
        auth: &UserAuth,
    ) -> KeyResult<()> {
        let key = self.key_or_load(user, level);
        if key.has_stored_key() {
            debug!(user, %level, "key already exists");
            return Ok(());
        }
        let dir = key.dir();
        if let Err(e) = self.create_and_bind(&key, user, auth) {
            if !key.has_stored_key() {
                self.forget_key(user, level);
                let _ = std::fs::remove_dir(&dir);
            }
            return Err(e);
        }
        info!(user, %level, "key generated");
        Ok(())
    }

    fn create_and_bind(&self, key: &BaseKey, user: UserId, auth: &UserAuth) -> KeyResult<()> {
        with_dir_retry(&key.dir(), || key.init_key())?;
        key.store_key(auth, true)?;
        let descriptor = key.active_key(ActivateFlag::FirstCreate, &self.mount())?;
        apply_dir_policy(
            &*self.fscrypt,
            &user_data_dir(&self.config.data_root, key.level(), user),
            &descriptor,
        )
    }

    // -- boot ---------------------------------------------------------------

    /// Create or restore the device-global key and activate it.
    pub fn init_global_device_key(&self) -> KeyResult<()> {
        let key = self.key_or_load(GLOBAL_USER_ID, ProtectionLevel::DeviceGlobal);
        if key.is_active() {
            return Ok(());
        }
        let flag = self.create_or_restore(&key)?;
        key.active_key(flag, &self.mount())?;
        info!(dir = %key.dir().display(), ?flag, "device key active");
        Ok(())
    }

    /// Create or restore the global user's El1 key, then bring up every
    /// stored user's El1 key.
    pub fn init_global_user_keys(&self) -> KeyResult<()> {
        let key = self.key_or_load(GLOBAL_USER_ID, ProtectionLevel::El1);
        if !key.is_active() {
            let flag = self.create_or_restore(&key)?;
            let descriptor = key.active_key(flag, &self.mount())?;
            if flag == ActivateFlag::FirstCreate {
                apply_dir_policy(
                    &*self.fscrypt,
                    &user_data_dir(&self.config.data_root, ProtectionLevel::El1, GLOBAL_USER_ID),
                    &descriptor,
                )?;
            }
        }
        let loaded = self.load_all_users_el1_keys()?;
        info!(loaded, "global user keys ready");
        Ok(())
    }

    /// Restore and activate the El1 key of every stored user. Users whose
    /// key fails to load are logged and skipped.
    fn load_all_users_el1_keys(&self) -> KeyResult<usize> {
        let mut loaded = 0;
        for user in self.stored_users(ProtectionLevel::El1)? {
            if user == GLOBAL_USER_ID {
                continue;
            }
            let Some(key) = self.stored_key(user, ProtectionLevel::El1) else {
                continue;
            };
            if key.is_active() {
                continue;
            }
            let result = self
                .restore_with_fallback(&key, &UserAuth::empty())
                .and_then(|()| key.active_key(ActivateFlag::Retrieve, &self.mount()));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => error!(user, "failed to load El1 key: {e}"),
            }
        }
        Ok(loaded)
    }

    /// Migrate every key directory still in the legacy flat layout.
    /// Returns how many were upgraded; a failing directory is logged and
    /// the first failure returned once all were attempted.
    pub fn upgrade_keys(&self) -> KeyResult<usize> {
        let mut targets = vec![(GLOBAL_USER_ID, ProtectionLevel::DeviceGlobal)];
        for level in ProtectionLevel::USER_LEVELS {
            for user in self.stored_users(level)? {
                targets.push((user, level));
            }
        }

        let mut upgraded = 0;
        let mut first_err = None;
        for (user, level) in targets {
            let dir = self.get_key_dir_by_user_and_type(user, level);
            if !KeyStorage::new(&dir).has_legacy_layout() {
                continue;
            }
            match self.key_or_load(user, level).upgrade_keys() {
                Ok(true) => upgraded += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(user, %level, dir = %dir.display(), "key upgrade failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                if upgraded > 0 {
                    info!(upgraded, "legacy keys upgraded");
                }
                Ok(upgraded)
            }
        }
    }

    // -- user lifecycle -----------------------------------------------------

    /// Create the requested levels for a new user under the empty
    /// credential. El1 goes first; a failing level does not stop later
    /// ones, and the first failure is returned.
    pub fn generate_user_keys(&self, user: UserId, levels: LevelMask) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        validate_user(user)?;
        if levels.is_empty() {
            return Err(KeyError::InvalidArgument("no key levels requested".into()));
        }

        let mut first_err = None;
        for level in levels.levels() {
            if level.is_uece() && !self.uece_supported() {
                info!(user, "enhanced key store unavailable, skipping {level}");
                continue;
            }
            if let Err(e) = self.generate_level(user, level, &UserAuth::empty()) {
                error!(user, %level, "key generation failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(user, levels = levels.bits(), "user keys generated");
                Ok(())
            }
        }
    }

    /// Create one level for a user under an explicit credential.
    pub fn generate_user_key_by_type(
        &self,
        user: UserId,
        level: ProtectionLevel,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        validate_user(user)?;
        if level == ProtectionLevel::DeviceGlobal {
            return Err(KeyError::InvalidArgument("device key is not per user".into()));
        }
        if level.is_uece() && !self.uece_supported() {
            return Err(KeyError::Unsupported(format!("{level} needs the enhanced key store")));
        }
        if KeyStorage::new(self.get_key_dir_by_user_and_type(user, level)).has_key() {
            return Err(KeyError::StateConflict(format!(
                "user {user} already has a {level} key"
            )));
        }
        self.generate_level(user, level, &UserAuth::new(token, secret))
    }

    /// Restore and activate a user's credential levels.
    pub fn active_user_key(&self, user: UserId, token: Vec<u8>, secret: Vec<u8>) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        validate_user(user)?;
        if self
            .key(user, ProtectionLevel::El2)
            .is_some_and(|key| key.is_active())
        {
            debug!(user, "user keys already active");
            return Ok(());
        }
        if self.stored_key(user, ProtectionLevel::El2).is_none() {
            return Err(KeyError::UserNotFound(user));
        }

        let auth = UserAuth::new(token, secret);
        let mount = self.mount();
        if let Some(el1) = self.stored_key(user, ProtectionLevel::El1) {
            if !el1.is_active() {
                self.restore_with_fallback(&el1, &UserAuth::empty())?;
                el1.active_key(ActivateFlag::Retrieve, &mount)?;
            }
        }
        for level in ProtectionLevel::credential_levels() {
            if level.is_uece() && !self.uece_supported() {
                debug!(user, "enhanced key store unavailable, not activating {level}");
                continue;
            }
            let Some(key) = self.stored_key(user, level) else {
                continue;
            };
            if key.is_active() {
                continue;
            }
            self.restore_with_fallback(&key, &auth)?;
            key.active_key(ActivateFlag::Retrieve, &mount)?;
        }
        self.update_status(user, |status| status.screen_locked = false);
        info!(user, "user keys active");
        Ok(())
    }

    /// Deactivate a user's credential levels, last level first. El1 stays
    /// installed.
    pub fn inactive_user_key(&self, user: UserId) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        let keys = self.user_keys(user);
        if keys.is_empty() {
            return Err(KeyError::UserNotFound(user));
        }
        if let Some(handler) = lock(&self.delays).get(&user) {
            handler.cancel();
        }

        let mount = self.mount();
        let mut first_err = None;
        for key in keys
            .iter()
            .rev()
            .filter(|key| key.level().requires_credential() && key.is_active())
        {
            if let Err(e) = key.inactive_key(DeactivateFlag::Logout, &mount) {
                error!(user, level = %key.level(), "deactivation failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(user, "user keys inactive");
                Ok(())
            }
        }
    }

    /// Re-wrap a user's credential levels from the old secret to the new
    /// one. The user's El2 key must be active. Levels already re-wrapped
    /// are rolled back if a later level fails.
    pub fn update_user_auth(
        &self,
        user: UserId,
        secure_uid: u64,
        token: Vec<u8>,
        old_secret: Vec<u8>,
        new_secret: Vec<u8>,
    ) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        let el2 = self
            .key(user, ProtectionLevel::El2)
            .ok_or(KeyError::UserNotFound(user))?;
        if !el2.is_active() {
            return Err(KeyError::StateConflict(format!(
                "user {user} keys must be active to change the credential"
            )));
        }

        let old = UserAuth::new(token.clone(), old_secret);
        let new = UserAuth::new(token, new_secret);
        let empty = UserAuth::empty();
        let generate_shield = !self.config.migrate_keys;

        let mut done: Vec<(Arc<BaseKey>, bool)> = Vec::new();
        for level in ProtectionLevel::credential_levels() {
            if level.is_uece() && !self.uece_supported() {
                continue;
            }
            let Some(key) = self.stored_key(user, level) else {
                continue;
            };
            match self.update_key_auth(&key, &old, &new, generate_shield) {
                Ok(used_empty) => done.push((key, used_empty)),
                Err(e) => {
                    error!(user, %level, "credential update failed: {e}");
                    for (updated, used_empty) in done.iter().rev() {
                        let previous = if *used_empty { &empty } else { &old };
                        if let Err(re) = updated.update_auth(&new, previous, generate_shield) {
                            error!(
                                user,
                                level = %updated.level(),
                                "credential rollback failed: {re}"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        self.update_status(user, |status| status.secure_uid = Some(secure_uid));
        info!(user, levels = done.len(), "user credential updated");
        Ok(())
    }

    /// Returns whether the key was still under the empty secret.
    fn update_key_auth(
        &self,
        key: &BaseKey,
        old: &UserAuth,
        new: &UserAuth,
        generate_shield: bool,
    ) -> KeyResult<bool> {
        match key.update_auth(old, new, generate_shield) {
            Ok(()) => Ok(false),
            Err(KeyError::Authentication(_))
                if old.has_secret() && matches!(key.is_credential_protected(), Ok(false)) =>
            {
                key.update_auth(&UserAuth::empty(), new, generate_shield)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-shield every active key of a user under fresh key store contexts.
    pub fn update_key_context(&self, user: UserId) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        let keys = self.user_keys(user);
        if keys.is_empty() {
            return Err(KeyError::UserNotFound(user));
        }
        for key in keys.iter().filter(|key| key.is_active()) {
            key.update_key(None)?;
        }
        info!(user, "key context updated");
        Ok(())
    }

    /// Destroy every key of a user. Deleting a user with no keys succeeds.
    ///
    /// Each key is removed from the registry before its material is
    /// deleted, and a failed deletion is not retried.
    pub fn delete_user_keys(&self, user: UserId) -> KeyResult<()> {
        validate_user(user)?;
        let transition = self.transition_lock(user);
        let result = {
            let _serial = lock(&transition);
            self.delete_user_keys_serialized(user)
        };
        self.prune_transition(user, &transition);
        result
    }

    fn delete_user_keys_serialized(&self, user: UserId) -> KeyResult<()> {
        if let Some(handler) = lock(&self.delays).remove(&user) {
            handler.cancel();
        }

        let mut doomed: Vec<Arc<BaseKey>> = Vec::new();
        let mut unregistered = Vec::new();
        {
            let mut keys = lock(&self.keys);
            for level in ProtectionLevel::USER_LEVELS {
                match keys.remove(&(user, level)) {
                    Some(key) => doomed.push(key),
                    None => unregistered.push(level),
                }
            }
        }
        for level in unregistered {
            if self.get_key_dir_by_user_and_type(user, level).exists() {
                doomed.push(Arc::new(self.new_key(user, level)));
            }
        }
        doomed.sort_by_key(|key| key.level());

        let mount = self.mount();
        self.evict_app_keys(user, &mount);
        lock(&self.users).remove(&user);
        self.remove_escrow(user);

        if doomed.is_empty() {
            debug!(user, "no keys to delete");
            return Ok(());
        }

        let mut first_err = None;
        for key in doomed.iter().rev() {
            if let Err(e) = key.clear_key(&mount) {
                error!(user, level = %key.level(), "key deletion failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        for level in ProtectionLevel::USER_LEVELS {
            remove_dir_policy(
                &*self.fscrypt,
                &user_data_dir(&self.config.data_root, level, user),
            );
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(user, "user keys deleted");
                Ok(())
            }
        }
    }

    // -- directory policy ---------------------------------------------------

    /// Bind directories to an existing key of the user.
    pub fn set_directory_el_policy(
        &self,
        user: UserId,
        level: ProtectionLevel,
        dirs: &[FileList],
    ) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        if let Some(other) = dirs.iter().find(|entry| entry.user_id != user) {
            return Err(KeyError::InvalidArgument(format!(
                "{} belongs to user {}, not {user}",
                other.path.display(),
                other.user_id
            )));
        }
        let key = self
            .stored_key(user, level)
            .ok_or(KeyError::KeyNotFound { user, level })?;
        let descriptor = key.key_descriptor()?;
        set_directory_policies(&*self.fscrypt, dirs, &descriptor)?;
        info!(user, %level, dirs = dirs.len(), "directory policies set");
        Ok(())
    }

    /// Whether the user's El2 data tree is bound to a key.
    pub fn get_file_encrypt_status(&self, user: UserId) -> KeyResult<bool> {
        if !self.user_exists(user) {
            return Err(KeyError::UserNotFound(user));
        }
        let has_el2 = self.stored_key(user, ProtectionLevel::El2).is_some();
        let data_dir = user_data_dir(&self.config.data_root, ProtectionLevel::El2, user);
        Ok(has_el2 && is_encrypted(&*self.fscrypt, &data_dir))
    }

    /// Activate a key still stored under the empty credential. Only
    /// available while legacy key migration is enabled.
    pub fn restore_user_key(&self, user: UserId, level: ProtectionLevel) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        if !self.config.migrate_keys {
            return Err(KeyError::Unsupported(
                "restoring keys without a credential requires key migration".into(),
            ));
        }
        let key = self
            .stored_key(user, level)
            .ok_or(KeyError::KeyNotFound { user, level })?;
        if key.is_active() {
            return Ok(());
        }
        key.restore_key(&UserAuth::empty())?;
        key.active_key(ActivateFlag::Retrieve, &self.mount())?;
        info!(user, %level, "key restored without credential");
        Ok(())
    }

    // -- application keys ---------------------------------------------------

    /// Derive and install a per-application key from the user's active El5
    /// key. Returns the key id.
    pub fn generate_app_key(&self, user: UserId, hash_id: u32) -> KeyResult<String> {
        if !self.uece_supported() {
            return Err(KeyError::Unsupported(
                "application keys need the enhanced key store".into(),
            ));
        }
        let el5 = self.key(user, ProtectionLevel::El5).ok_or(KeyError::KeyNotFound {
            user,
            level: ProtectionLevel::El5,
        })?;
        let info = format!("elk-app-key:{hash_id}");
        let app_key = el5.derive_subkey(info.as_bytes(), self.config.key_len)?;

        let mount = self.mount();
        let descriptor = self
            .fscrypt
            .install_key(&mount, &app_key)
            .map_err(|e| KeyError::io(&mount, e))?;
        let key_id = descriptor.to_hex();
        lock(&self.app_keys)
            .entry(user)
            .or_default()
            .insert(key_id.clone(), descriptor);
        info!(user, hash_id, %key_id, "application key installed");
        Ok(key_id)
    }

    pub fn delete_app_key(&self, user: UserId, key_id: &str) -> KeyResult<()> {
        let descriptor = lock(&self.app_keys)
            .get_mut(&user)
            .and_then(|keys| keys.remove(key_id))
            .ok_or(KeyError::KeyNotFound {
                user,
                level: ProtectionLevel::El5,
            })?;
        let mount = self.mount();
        match self.fscrypt.evict_key(&mount, &descriptor) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(user, %key_id, "application key was already evicted");
            }
            Err(e) => return Err(KeyError::io(&mount, e)),
        }
        info!(user, %key_id, "application key deleted");
        Ok(())
    }

    fn evict_app_keys(&self, user: UserId, mount: &Path) {
        let Some(keys) = lock(&self.app_keys).remove(&user) else {
            return;
        };
        for (key_id, descriptor) in keys {
            if let Err(e) = self.fscrypt.evict_key(mount, &descriptor) {
                warn!(user, %key_id, "failed to evict application key: {e}");
            }
        }
    }

    // -- shutdown -----------------------------------------------------------

    /// Cancel deferred work and deactivate every key. The registry is
    /// emptied, so dropped keys wipe their memory.
    pub fn shutdown(&self) {
        for (_, handler) in lock(&self.delays).drain() {
            handler.cancel();
        }

        let mount = self.mount();
        let app_users: Vec<UserId> = lock(&self.app_keys).keys().copied().collect();
        for user in app_users {
            self.evict_app_keys(user, &mount);
        }

        let mut keys: Vec<Arc<BaseKey>> = lock(&self.keys).drain().map(|(_, key)| key).collect();
        keys.sort_by_key(|key| std::cmp::Reverse(key.level()));
        let mut released = 0;
        for key in keys.iter().filter(|key| key.is_active()) {
            match key.inactive_key(DeactivateFlag::Logout, &mount) {
                Ok(()) => released += 1,
                Err(e) => warn!(level = %key.level(), "deactivation at shutdown failed: {e}"),
            }
        }
        lock(&self.pending_recovery).take();
        info!(released, "key manager shut down");
    }

    fn lock_delay(&self) -> Duration {
        Duration::from_millis(self.config.lock_screen_delay_ms)
    }
}
