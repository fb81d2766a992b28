//! Error kinds reported by the read controller and the group key administrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input. Nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path buffers or the request itself could not be allocated.
    #[error("no memory")]
    NoMemory,

    #[error("not found")]
    NotFound,

    /// Provider, scheduling or send failure.
    #[error("failure: {0:#}")]
    Fail(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::NoMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
