//! Crate-wide error type: one flat enum, `thiserror` derive, `#[from]`
//! conversions for the underlying IO/SQLite/JSON error types, covering
//! every component from process inspection through the HTTP boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("filesystem watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("(platform, version) profile not supported")]
    PlatformUnsupported,

    #[error("permission denied attaching to target process")]
    PermissionDenied,

    #[error("exhaustive scan yielded no validated key")]
    KeyNotFound,

    #[error("page-1 HMAC mismatch: key is incorrect")]
    IncorrectKey,

    #[error("file already begins with the SQLite header; nothing to decrypt")]
    AlreadyDecrypted,

    #[error("page HMAC mismatch past page 1 (page {0})")]
    HashVerificationFailed(u32),

    #[error("encrypted stream size is not a positive multiple of the page size")]
    IncompleteRead,

    #[error("failed writing decrypted output: {0}")]
    WriteFailed(String),

    #[error("no known header matched after decrypting media")]
    UnknownMediaFormat,

    #[error("operation canceled")]
    OperationCanceled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Maps a [`CoreError`] to the CLI exit code. 0 is reserved for success
/// and is never produced here.
impl CoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::KeyNotFound => 2,
            CoreError::IncorrectKey => 3,
            CoreError::WriteFailed(_) => 4,
            CoreError::PermissionDenied => 5,
            CoreError::PlatformUnsupported => 6,
            CoreError::AlreadyDecrypted => 0,
            _ => 1,
        }
    }

    /// True for errors the caller can recover from (retry with another
    /// key, copy the file verbatim, etc.).
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::IncorrectKey | CoreError::AlreadyDecrypted | CoreError::OperationCanceled
        )
    }
}
