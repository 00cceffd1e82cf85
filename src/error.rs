//! Error types for redirfs

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the filter engine and its administrative surface
#[derive(Debug, Error)]
pub enum Error {
    /// Null or malformed argument
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Allocation of a chain, table or node failed
    #[error("Out of memory")]
    OutOfMemory,

    /// Another filter already holds this priority
    #[error("Filter with priority {priority} already exists")]
    AlreadyExists { priority: i32 },

    /// Lookup miss (path, filter, chain member)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration was read but is not usable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Negative errno value matching the kernel-style return codes
    pub fn errno(&self) -> i32 {
        match self {
            Error::Invalid(_) | Error::InvalidConfig(_) => -libc::EINVAL,
            Error::OutOfMemory => -libc::ENOMEM,
            Error::AlreadyExists { .. } => -libc::EEXIST,
            Error::NotFound(_) => -libc::ENOENT,
            Error::Io(e) => e.raw_os_error().map(|code| -code).unwrap_or(-libc::EIO),
            Error::Config(_) | Error::Json(_) => -libc::EIO,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
