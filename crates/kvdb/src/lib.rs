//! C9: the public KV database façade — `Database::open`, per-transaction
//! `get`/`next`/`find`/`set`/`delete`/`commit`/`rollback` (spec §4.9), and
//! a thin cooperative [`Dispatcher`] exercising the §5 scheduling model.
//!
//! Composes every lower layer behind one handle, the way the teacher's
//! top-level crate composes its pager/WAL/btree/MVCC layers.

pub mod act;
pub mod config;
pub mod database;
pub mod dispatcher;

pub use act::{SetEntryAct, SetEntryConfig};
pub use config::Config;
pub use database::{Database, TxOutcome};
pub use dispatcher::{Dispatcher, Request, Response};
pub use kvdb_types::TxId;
