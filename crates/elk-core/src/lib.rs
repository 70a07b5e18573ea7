pub mod config;
pub mod error;
pub mod types;

pub use config::{CryptoConfig, DaemonConfig, ElkConfig, KeysConfig, RecoveryConfig};
pub use error::{KeyError, KeyResult, StatusCode};
pub use types::{
    FileList, LevelMask, ProtectionLevel, UserAuth, UserId, GLOBAL_USER_ID, MAX_USER_ID,
    START_USER_ID,
};
