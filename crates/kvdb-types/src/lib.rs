//! Core primitive types shared across the `kvdb` workspace: page/namespace
//! addressing, log sequence numbers, record ids, variable-length record
//! ids, and the page-event classification used by recovery.

pub mod event;
pub mod ids;
pub mod limits;
pub mod lsn;
pub mod rid;
pub mod vid;

pub use event::UpdateType;
pub use ids::{Namespace, PageId, PageNo, TxId};
pub use lsn::Lsn;
pub use rid::{Rid, RID_WIRE_LEN};
pub use vid::Vid;
