use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ProtectionLevel, UserId};

pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    /// Wrong secret or token. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Key material is present on disk but malformed.
    #[error("corrupt key material at {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("storage I/O error at {path}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported on this device: {0}")]
    Unsupported(String),

    #[error("invalid state: {0}")]
    StateConflict(String),

    #[error("user {user} has no {level} key")]
    KeyNotFound { user: UserId, level: ProtectionLevel },

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl KeyError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeyError::StorageIo {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        KeyError::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Only directory-level I/O errors are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyError::StorageIo { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            KeyError::Authentication(_) => StatusCode::AuthFailed,
            KeyError::Corruption { .. } => StatusCode::Corrupted,
            KeyError::StorageIo { .. } => StatusCode::StorageIo,
            KeyError::Unsupported(_) => StatusCode::Unsupported,
            KeyError::StateConflict(_) => StatusCode::StateConflict,
            KeyError::KeyNotFound { .. } | KeyError::UserNotFound(_) => StatusCode::NotFound,
            KeyError::InvalidArgument(_) => StatusCode::InvalidArgument,
        }
    }
}

/// Numeric status surfaced to the request layer.
///
/// Callers use it to decide whether to re-prompt for a credential
/// (`AuthFailed`), retry (`StorageIo`), or fall back (`Unsupported`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    AuthFailed = 1,
    StorageIo = 2,
    Corrupted = 3,
    Unsupported = 4,
    NotFound = 5,
    StateConflict = 6,
    InvalidArgument = 7,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl<T> From<&KeyResult<T>> for StatusCode {
    fn from(result: &KeyResult<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct() {
        let auth = KeyError::Authentication("bad secret".into()).status();
        let io = KeyError::io("/x", std::io::Error::from(std::io::ErrorKind::NotFound)).status();
        let unsupported = KeyError::Unsupported("uece".into()).status();
        let missing = KeyError::UserNotFound(100).status();

        assert_ne!(auth, io);
        assert_ne!(io, unsupported);
        assert_ne!(unsupported, missing);
        assert_eq!(auth.as_i32(), 1);
    }

    #[test]
    fn test_only_io_is_retryable() {
        assert!(KeyError::io("/x", std::io::Error::other("disk")).is_retryable());
        assert!(!KeyError::Authentication("nope".into()).is_retryable());
        assert!(!KeyError::corrupt("/x", "short blob").is_retryable());
    }

    #[test]
    fn test_status_from_result() {
        let ok: KeyResult<()> = Ok(());
        assert!(StatusCode::from(&ok).is_ok());
        let err: KeyResult<()> = Err(KeyError::StateConflict("already active".into()));
        assert_eq!(StatusCode::from(&err), StatusCode::StateConflict);
    }
}
