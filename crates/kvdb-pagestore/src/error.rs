//! Local error type for the page store, aggregated into
//! [`kvdb_error::KvError`] at the boundary.

use kvdb_error::KvError;

/// Page store specific errors.
#[derive(Debug, thiserror::Error)]
pub enum PageStoreError {
    /// An underlying filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `create` was called on a page that currently has an open append
    /// handle.
    #[error("page {0} has an open append handle and cannot be (re)created")]
    AppendOpen(String),

    /// `append`/`closeAppend` was called on a page with no open append
    /// handle.
    #[error("page {0} has no open append handle")]
    NotOpenForAppend(String),
}

/// Result alias for this crate's internal error type.
pub type Result<T> = std::result::Result<T, PageStoreError>;

impl From<PageStoreError> for KvError {
    fn from(e: PageStoreError) -> Self {
        match e {
            PageStoreError::Io(io) => KvError::Io(io),
            other => KvError::client(other.to_string()),
        }
    }
}
