//! Local error type for the record log.

use kvdb_error::KvError;

/// Record log specific errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An entry's length header is unreadable or its payload overruns the
    /// page, at an offset the caller should never have addressed.
    #[error("corrupt log entry at lsn {0}")]
    CorruptEntry(u64),

    /// The log has already been closed.
    #[error("record log is closed")]
    Closed,
}

impl From<LogError> for KvError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::CorruptEntry(_) => KvError::corrupt(e.to_string()),
            LogError::Closed => KvError::client(e.to_string()),
        }
    }
}
