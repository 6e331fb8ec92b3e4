//! Workspace-wide error type for `kvdb`.
//!
//! Every crate in the workspace returns [`Result<T>`] and converts its
//! local failures into [`KvError`] at the boundary, matching the spec's
//! error-handling policy (§7): structural corruption is fatal, client
//! errors fail only the offending operation, deadlocks name a victim, and
//! I/O failures are fatal.

use std::fmt;
use std::io;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, KvError>;

/// Top-level error type returned by every public `kvdb-*` API.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The on-disk state is structurally invalid beyond what recovery can
    /// repair (bad framing past the recoverable tail, an undecodable page).
    /// Fatal: the caller must not continue using the database.
    #[error("database corrupt: {0}")]
    Corrupt(String),

    /// The caller passed an invalid argument or operated on a transaction
    /// that is no longer active. Does not affect other in-flight work.
    #[error("client error: {0}")]
    ClientError(String),

    /// A transaction was unilaterally aborted by the engine (deadlock
    /// victim, cancellation, lost connection).
    #[error("aborted: tx {tx_id}: {reason}")]
    Aborted {
        /// The transaction id of the aborted transaction.
        tx_id: u32,
        /// Human-readable reason, e.g. `"deadlock detected"`.
        reason: String,
    },

    /// The underlying page store could not satisfy an allocation.
    #[error("out of space")]
    OutOfSpace,

    /// An I/O error from the underlying filesystem. Fatal.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl KvError {
    /// Build a [`KvError::Corrupt`] from anything `Display`-able.
    pub fn corrupt(msg: impl fmt::Display) -> Self {
        KvError::Corrupt(msg.to_string())
    }

    /// Build a [`KvError::ClientError`] from anything `Display`-able.
    pub fn client(msg: impl fmt::Display) -> Self {
        KvError::ClientError(msg.to_string())
    }

    /// Build a [`KvError::Aborted`] for the given transaction.
    pub fn aborted(tx_id: u32, reason: impl fmt::Display) -> Self {
        KvError::Aborted {
            tx_id,
            reason: reason.to_string(),
        }
    }

    /// True if this error is fatal to the whole database (not just the
    /// current operation or transaction).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, KvError::Corrupt(_) | KvError::Io(_) | KvError::OutOfSpace)
    }
}
