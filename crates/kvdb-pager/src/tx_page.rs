//! `TxPage`: an in-memory deserialization of a persisted page (spec §3,
//! §4.5).

use kvdb_types::{Lsn, PageId};

use crate::objects::PageObj;

/// A cached page: its deserialized object, whether it currently exists on
/// disk, the LSN of the last ACT/CLR that touched it, and a pin count
/// exempting it from eviction while positive.
#[derive(Debug, Clone)]
pub struct TxPage {
    pub(crate) page_id: PageId,
    pub(crate) page_lsn: Lsn,
    pub(crate) page_exists: bool,
    pub(crate) obj: PageObj,
    pub(crate) pin_count: u32,
    pub(crate) last_touch: u64,
}

impl TxPage {
    /// This page's identity.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// LSN of the last ACT/CLR that modified this page; `Lsn::NONE` if
    /// the page has never been touched since it was loaded.
    #[must_use]
    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    /// Whether this page currently has contents on disk (as of the last
    /// time the cache observed it, not necessarily this instant).
    #[must_use]
    pub fn page_exists(&self) -> bool {
        self.page_exists
    }

    /// The deserialized object this page holds.
    #[must_use]
    pub fn obj(&self) -> &PageObj {
        &self.obj
    }

    /// True while pinned by an in-progress act.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}
