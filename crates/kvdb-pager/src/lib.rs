//! C3: the transactional page cache — deserialized page objects, pin/
//! evict semantics, and WAL-flush-before-evict (spec §4.5).

pub mod cache;
pub mod objects;
pub mod tx_page;

pub use cache::{LoggedEvent, PageCache};
pub use objects::{
    BranchEvent, BranchNode, ConfigEvent, ConfigPage, LeafEvent, LeafNode, PageEvent, PageKind,
    PageObj, RecordEvent, RecordPage,
};
pub use tx_page::TxPage;
