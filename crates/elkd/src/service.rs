//! Request facade over the key manager
//!
//! One async method per manager operation. Each request runs on the
//! blocking pool and reports a numeric status; outputs are returned only
//! on success.

use elk_core::{FileList, KeyResult, LevelMask, ProtectionLevel, StatusCode, UserId};
use elk_crypto::KeyBlob;
use elk_keys::KeyManager;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct KeyService {
    manager: Arc<KeyManager>,
}

impl KeyService {
    pub fn new(manager: Arc<KeyManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &KeyManager {
        &self.manager
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> (StatusCode, Option<T>)
    where
        T: Send + 'static,
        F: FnOnce(&KeyManager) -> KeyResult<T> + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        match tokio::task::spawn_blocking(move || f(&manager)).await {
            Ok(Ok(value)) => {
                debug!(op, "request ok");
                (StatusCode::Ok, Some(value))
            }
            Ok(Err(e)) => {
                let status = e.status();
                warn!(op, status = status.as_i32(), "request failed: {e}");
                (status, None)
            }
            Err(e) => {
                error!(op, "request task failed: {e}");
                (StatusCode::StorageIo, None)
            }
        }
    }

    async fn status<F>(&self, op: &'static str, f: F) -> StatusCode
    where
        F: FnOnce(&KeyManager) -> KeyResult<()> + Send + 'static,
    {
        self.call(op, f).await.0
    }

    pub async fn init_global_device_key(&self) -> StatusCode {
        self.status("init_global_device_key", |m| m.init_global_device_key())
            .await
    }

    pub async fn init_global_user_keys(&self) -> StatusCode {
        self.status("init_global_user_keys", |m| m.init_global_user_keys())
            .await
    }

    pub async fn upgrade_keys(&self) -> (StatusCode, Option<usize>) {
        self.call("upgrade_keys", |m| m.upgrade_keys()).await
    }

    /// `flags` is a level bit mask (bit 0 = El1 .. bit 4 = El5).
    pub async fn generate_user_keys(&self, user: UserId, flags: u32) -> StatusCode {
        self.status("generate_user_keys", move |m| {
            m.generate_user_keys(user, LevelMask::from_bits(flags))
        })
        .await
    }

    pub async fn generate_user_key_by_type(
        &self,
        user: UserId,
        level: ProtectionLevel,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> StatusCode {
        self.status("generate_user_key_by_type", move |m| {
            m.generate_user_key_by_type(user, level, token, secret)
        })
        .await
    }

    pub async fn active_user_key(
        &self,
        user: UserId,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> StatusCode {
        self.status("active_user_key", move |m| {
            m.active_user_key(user, token, secret)
        })
        .await
    }

    pub async fn inactive_user_key(&self, user: UserId) -> StatusCode {
        self.status("inactive_user_key", move |m| m.inactive_user_key(user))
            .await
    }

    pub async fn update_user_auth(
        &self,
        user: UserId,
        secure_uid: u64,
        token: Vec<u8>,
        old_secret: Vec<u8>,
        new_secret: Vec<u8>,
    ) -> StatusCode {
        self.status("update_user_auth", move |m| {
            m.update_user_auth(user, secure_uid, token, old_secret, new_secret)
        })
        .await
    }

    pub async fn update_key_context(&self, user: UserId) -> StatusCode {
        self.status("update_key_context", move |m| m.update_key_context(user))
            .await
    }

    pub async fn lock_user_screen(&self, user: UserId) -> StatusCode {
        self.status("lock_user_screen", move |m| m.lock_user_screen(user))
            .await
    }

    pub async fn unlock_user_screen(
        &self,
        user: UserId,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> StatusCode {
        self.status("unlock_user_screen", move |m| {
            m.unlock_user_screen(user, token, secret)
        })
        .await
    }

    pub async fn get_lock_screen_status(&self, user: UserId) -> (StatusCode, Option<bool>) {
        self.call("get_lock_screen_status", move |m| {
            m.get_lock_screen_status(user)
        })
        .await
    }

    pub async fn get_file_encrypt_status(&self, user: UserId) -> (StatusCode, Option<bool>) {
        self.call("get_file_encrypt_status", move |m| {
            m.get_file_encrypt_status(user)
        })
        .await
    }

    pub async fn delete_user_keys(&self, user: UserId) -> StatusCode {
        self.status("delete_user_keys", move |m| m.delete_user_keys(user))
            .await
    }

    pub async fn set_directory_el_policy(
        &self,
        user: UserId,
        level: ProtectionLevel,
        dirs: Vec<FileList>,
    ) -> StatusCode {
        self.status("set_directory_el_policy", move |m| {
            m.set_directory_el_policy(user, level, &dirs)
        })
        .await
    }

    pub async fn restore_user_key(&self, user: UserId, level: ProtectionLevel) -> StatusCode {
        self.status("restore_user_key", move |m| m.restore_user_key(user, level))
            .await
    }

    pub async fn create_recover_key(
        &self,
        user: UserId,
        secure_uid: u64,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> (StatusCode, Option<SecretString>) {
        self.call("create_recover_key", move |m| {
            m.create_recover_key(user, secure_uid, token, secret)
        })
        .await
    }

    pub async fn set_recover_key(&self, mnemonic: Vec<u8>) -> StatusCode {
        self.status("set_recover_key", move |m| m.set_recover_key(&mnemonic))
            .await
    }

    pub async fn update_use_auth_with_recovery_key(
        &self,
        token: Vec<u8>,
        new_secret: Vec<u8>,
        secure_uid: u64,
        user: UserId,
    ) -> (StatusCode, Option<Vec<KeyBlob>>) {
        self.call("update_use_auth_with_recovery_key", move |m| {
            m.update_use_auth_with_recovery_key(token, new_secret, secure_uid, user)
        })
        .await
    }

    pub async fn generate_app_key(
        &self,
        user: UserId,
        hash_id: u32,
    ) -> (StatusCode, Option<String>) {
        self.call("generate_app_key", move |m| m.generate_app_key(user, hash_id))
            .await
    }

    pub async fn delete_app_key(&self, user: UserId, key_id: String) -> StatusCode {
        self.status("delete_app_key", move |m| m.delete_app_key(user, &key_id))
            .await
    }

    pub async fn shutdown(&self) {
        let manager = Arc::clone(&self.manager);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.shutdown()).await {
            error!("shutdown task failed: {e}");
        }
    }
}
