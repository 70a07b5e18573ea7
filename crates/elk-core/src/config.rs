use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration (loaded from elk.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElkConfig {
    pub daemon: DaemonConfig,
    pub keys: KeysConfig,
    pub crypto: CryptoConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Root holding the per-level user key directories (`<root>/el1/<user>` ...)
    pub storage_root: PathBuf,
    /// Directory holding the device-global key
    pub device_key_dir: PathBuf,
    /// Root of the encrypted user data trees; keys are bound to this mount
    pub data_root: PathBuf,
    /// Legacy key migration: keep shield contexts on re-store and allow
    /// restoring keys that still carry the empty credential
    pub migrate_keys: bool,
    /// Debounce window between a screen lock and key release
    pub lock_screen_delay_ms: u64,
    /// Raw key length in bytes (AES-256-XTS = 64)
    pub key_len: usize,
}

/// Key wrapping parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Whether the hardware key store offers the enhanced (UECE) wrap
    pub hardware_available: bool,
    /// Seed for the software key store
    pub root_key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Where escrowed recovery blobs are kept, one file per user
    pub escrow_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/data/service/el1/public/storage_daemon/sd"),
            device_key_dir: PathBuf::from("/data/service/el0/storage_daemon/sd"),
            data_root: PathBuf::from("/data"),
            migrate_keys: false,
            lock_screen_delay_ms: 5_000,
            key_len: 64,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            hardware_available: false,
            root_key_file: PathBuf::from("/data/service/el0/storage_daemon/root.key"),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            escrow_dir: PathBuf::from("/data/service/el1/public/storage_daemon/recovery"),
        }
    }
}

impl KeysConfig {
    /// Key root for one level (`<storage_root>/el2`).
    pub fn level_root(&self, level: crate::ProtectionLevel) -> PathBuf {
        match level {
            crate::ProtectionLevel::DeviceGlobal => self.device_key_dir.clone(),
            _ => self.storage_root.join(level.dir_name()),
        }
    }

    /// Mount point a level's keys are installed on.
    pub fn mount_point(&self) -> PathBuf {
        self.data_root.clone()
    }
}
