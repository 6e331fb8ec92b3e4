//! C4: the transaction engine — ARIES-style act logging, commit,
//! rollback, checkpointing and crash recovery (spec §4.6) layered over
//! the record log ([`kvdb_log`]) and transactional page cache
//! ([`kvdb_pager`]).

pub mod engine;
pub mod record;
pub mod table;

pub use engine::{ActConfig, TxnEngine};
pub use record::LogRecord;
pub use table::TxTableEntry;
