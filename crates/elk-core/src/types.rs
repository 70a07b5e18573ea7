use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub type UserId = u32;

/// Owner of the device-global key and the system user's keys.
pub const GLOBAL_USER_ID: UserId = 0;

/// First id handed out to a regular (human) user.
pub const START_USER_ID: UserId = 100;

pub const MAX_USER_ID: UserId = 1099;

/// Protection class of a directory tree.
///
/// Declaration order is the dependency order: El1 must exist before the
/// higher levels can create their directories, and inactivation walks
/// the list backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    /// Device-wide key, available from boot.
    DeviceGlobal,
    /// Per-user, available from boot without a credential.
    El1,
    /// Per-user, credential-encrypted; active from first unlock.
    El2,
    /// Per-user, credential-encrypted; stays usable while the screen is locked.
    El3,
    /// Per-user, credential-encrypted; released on screen lock.
    El4,
    /// Per-user, hardware-enhanced (UECE); released on screen lock.
    El5,
}

impl ProtectionLevel {
    pub const USER_LEVELS: [ProtectionLevel; 5] = [
        ProtectionLevel::El1,
        ProtectionLevel::El2,
        ProtectionLevel::El3,
        ProtectionLevel::El4,
        ProtectionLevel::El5,
    ];

    /// Directory component used for key roots and data trees.
    pub fn dir_name(self) -> &'static str {
        match self {
            ProtectionLevel::DeviceGlobal => "device",
            ProtectionLevel::El1 => "el1",
            ProtectionLevel::El2 => "el2",
            ProtectionLevel::El3 => "el3",
            ProtectionLevel::El4 => "el4",
            ProtectionLevel::El5 => "el5",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "device" => Some(ProtectionLevel::DeviceGlobal),
            "el1" => Some(ProtectionLevel::El1),
            "el2" => Some(ProtectionLevel::El2),
            "el3" => Some(ProtectionLevel::El3),
            "el4" => Some(ProtectionLevel::El4),
            "el5" => Some(ProtectionLevel::El5),
            _ => None,
        }
    }

    /// Whether activation needs a fresh unwrap with the user's credential.
    pub fn requires_credential(self) -> bool {
        !self.survives_reboot()
    }

    /// Whether the key can be re-activated after reboot without a credential.
    pub fn survives_reboot(self) -> bool {
        matches!(self, ProtectionLevel::DeviceGlobal | ProtectionLevel::El1)
    }

    /// Levels toggled by screen lock/unlock.
    pub fn screen_lock_gated(self) -> bool {
        matches!(self, ProtectionLevel::El4 | ProtectionLevel::El5)
    }

    /// The extra-protected class that needs the hardware capability.
    pub fn is_uece(self) -> bool {
        self == ProtectionLevel::El5
    }

    /// Levels whose wrap is bound to the user credential.
    pub fn credential_levels() -> impl Iterator<Item = ProtectionLevel> {
        Self::USER_LEVELS
            .into_iter()
            .filter(|level| level.requires_credential())
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Bit set of user levels requested by `GenerateUserKeys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelMask(u32);

impl LevelMask {
    pub const EL1: LevelMask = LevelMask(1 << 0);
    pub const EL2: LevelMask = LevelMask(1 << 1);
    pub const EL3: LevelMask = LevelMask(1 << 2);
    pub const EL4: LevelMask = LevelMask(1 << 3);
    pub const EL5: LevelMask = LevelMask(1 << 4);
    pub const ALL: LevelMask = LevelMask(0b1_1111);

    pub fn from_bits(bits: u32) -> Self {
        LevelMask(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn for_level(level: ProtectionLevel) -> Self {
        match level {
            ProtectionLevel::DeviceGlobal => LevelMask(0),
            ProtectionLevel::El1 => Self::EL1,
            ProtectionLevel::El2 => Self::EL2,
            ProtectionLevel::El3 => Self::EL3,
            ProtectionLevel::El4 => Self::EL4,
            ProtectionLevel::El5 => Self::EL5,
        }
    }

    pub fn contains(self, level: ProtectionLevel) -> bool {
        let bit = Self::for_level(level).0;
        bit != 0 && self.0 & bit == bit
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Requested levels in dependency order.
    pub fn levels(self) -> impl Iterator<Item = ProtectionLevel> {
        ProtectionLevel::USER_LEVELS
            .into_iter()
            .filter(move |level| self.contains(*level))
    }
}

impl std::ops::BitOr for LevelMask {
    type Output = LevelMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        LevelMask(self.0 | rhs.0)
    }
}

/// Credential material for a single operation. Never persisted.
pub struct UserAuth {
    pub token: Vec<u8>,
    secret: SecretBox<Vec<u8>>,
}

impl UserAuth {
    pub fn new(token: Vec<u8>, secret: Vec<u8>) -> Self {
        Self {
            token,
            secret: SecretBox::new(Box::new(secret)),
        }
    }

    /// The credential used before a user has set one.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn secret(&self) -> &[u8] {
        self.secret.expose_secret()
    }

    pub fn has_secret(&self) -> bool {
        !self.secret().is_empty()
    }
}

impl Drop for UserAuth {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.token);
    }
}

impl fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAuth")
            .field("token_len", &self.token.len())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A user directory that should carry a level's encryption policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub user_id: UserId,
    pub path: PathBuf,
}
