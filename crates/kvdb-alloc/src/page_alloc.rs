//! The page allocator (C5, spec §4.3): per-namespace random-probe
//! allocation over a page object's own `isEmpty()` signal, backed by a
//! `numPages` counter persisted as one entry of a small [`ConfigPage`].

use kvdb_error::Result;
use kvdb_pager::objects::{ConfigEvent, PageEvent, PageKind};
use kvdb_pager::PageCache;
use kvdb_types::{PageId, PageNo};
use rand::Rng;
use tracing::trace;

/// The `ConfigPage` key under which `numPages` is stored. Chosen well
/// above the 25 size-class keys (0..24) so a `PageAllocator` can share its
/// meta page with `RecordAllocator`'s class-head header page.
const NUM_PAGES_KEY: u8 = 250;

/// Allocates/frees pages of one namespace, tracking how many pages have
/// ever been handed out in a small config entry living on `meta_page`.
pub struct PageAllocator {
    managed_ns_kind: PageKind,
    meta_page: PageId,
    /// Page numbers below this are reserved (e.g. a header page) and are
    /// never probed or freed by this allocator.
    reserved: u64,
}

impl PageAllocator {
    /// Open an allocator whose `numPages` counter lives at `meta_page`
    /// (a `ConfigPage`), managing pages of `managed_ns_kind` starting at
    /// `reserved`.
    pub fn open(
        cache: &mut PageCache,
        meta_page: PageId,
        managed_ns_kind: PageKind,
        reserved: u64,
    ) -> Result<Self> {
        cache.pin(meta_page, PageKind::Config)?;
        cache.unpin(meta_page);
        Ok(PageAllocator {
            managed_ns_kind,
            meta_page,
            reserved,
        })
    }

    /// The number of pages ever handed out (the next fresh page number,
    /// absent reuse).
    pub fn num_pages(&self, cache: &mut PageCache) -> Result<u64> {
        cache.pin(self.meta_page, PageKind::Config)?;
        let n = self.read_num_pages(cache);
        cache.unpin(self.meta_page);
        Ok(n)
    }

    fn read_num_pages(&self, cache: &PageCache) -> u64 {
        let Some(page) = cache.page(self.meta_page) else {
            return self.reserved;
        };
        let kvdb_pager::objects::PageObj::Config(cfg) = page.obj() else {
            return self.reserved;
        };
        cfg.entries
            .get(&NUM_PAGES_KEY)
            .map(|bytes| {
                let mut full = [0u8; 8];
                full[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
                u64::from_le_bytes(full)
            })
            .unwrap_or(self.reserved)
    }

    /// Allocate a page: attempts one random probe in `[reserved,
    /// numPages)`; if that candidate's object is empty, reuse it.
    /// Otherwise, append a fresh page at `numPages` and bump the counter.
    /// Must be called within an act already begun on `cache` (the counter
    /// bump is itself a logged event).
    pub fn alloc(
        &mut self,
        cache: &mut PageCache,
        managed_ns: kvdb_types::Namespace,
        rng: &mut impl Rng,
    ) -> Result<PageId> {
        let num_pages = self.num_pages(cache)?;
        if num_pages > self.reserved {
            let probe = rng.gen_range(self.reserved..num_pages);
            let candidate = PageId::new(managed_ns, PageNo::new(probe)?);
            cache.pin(candidate, self.managed_ns_kind)?;
            let is_empty = cache.page(candidate).expect("just pinned").obj().is_empty();
            cache.unpin(candidate);
            if is_empty {
                trace!(page = %candidate, "page allocator reused empty page");
                return Ok(candidate);
            }
        }

        let new_page_no = num_pages.max(self.reserved);
        let new_id = PageId::new(managed_ns, PageNo::new(new_page_no)?);
        let bytes = (new_page_no + 1).to_le_bytes().to_vec();
        cache.do_event(
            self.meta_page,
            PageKind::Config,
            &PageEvent::Config(ConfigEvent::SetValue {
                key: NUM_PAGES_KEY,
                bytes,
            }),
        )?;
        trace!(page = %new_id, "page allocator grew namespace");
        Ok(new_id)
    }

    /// Shrink `numPages` by one page if `hint` is the current last page
    /// and it is now empty (spec §4.3 `freeUnusedPages`; Open Question 2
    /// — only ever shrinks by one page per call, matching the spec's
    /// literal wording rather than walking back repeatedly).
    pub fn free_unused_pages(
        &mut self,
        cache: &mut PageCache,
        managed_ns: kvdb_types::Namespace,
        hint: PageNo,
    ) -> Result<bool> {
        let num_pages = self.num_pages(cache)?;
        if num_pages <= self.reserved || hint.get() != num_pages - 1 {
            return Ok(false);
        }
        let id = PageId::new(managed_ns, hint);
        cache.pin(id, self.managed_ns_kind)?;
        let is_empty = cache.page(id).expect("just pinned").obj().is_empty();
        cache.unpin(id);
        if !is_empty {
            return Ok(false);
        }
        let bytes = (num_pages - 1).to_le_bytes().to_vec();
        cache.do_event(
            self.meta_page,
            PageKind::Config,
            &PageEvent::Config(ConfigEvent::SetValue {
                key: NUM_PAGES_KEY,
                bytes,
            }),
        )?;
        trace!(namespace = %managed_ns, new_num_pages = num_pages - 1, "page allocator shrank namespace");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kvdb_log::RecordLog;
    use kvdb_pager::objects::{PageEvent, RecordEvent};
    use kvdb_pagestore::{DirPageStore, PageStore};
    use kvdb_types::Namespace;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn new_cache(dir: &std::path::Path) -> PageCache {
        let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
        PageCache::new(store, log, 32)
    }

    #[test]
    fn alloc_grows_then_reuses_freed_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let meta = PageId::new(Namespace::from(9), PageNo::new(0).unwrap());
        let managed = Namespace::from(1);
        let mut alloc = PageAllocator::open(&mut cache, meta, PageKind::Record, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        cache.begin_act();
        let p0 = alloc.alloc(&mut cache, managed, &mut rng).unwrap();
        cache.end_act(kvdb_types::Lsn::new(10).unwrap());
        assert_eq!(p0.page_no.get(), 0);
        assert_eq!(alloc.num_pages(&mut cache).unwrap(), 1);

        // Fill page 0 so the next alloc must grow.
        cache.begin_act();
        cache
            .do_event(
                p0,
                PageKind::Record,
                &PageEvent::Record(RecordEvent::CreateEntry { id: 1, bytes: b"x".to_vec() }),
            )
            .unwrap();
        cache.end_act(kvdb_types::Lsn::new(20).unwrap());

        cache.begin_act();
        let p1 = alloc.alloc(&mut cache, managed, &mut rng).unwrap();
        cache.end_act(kvdb_types::Lsn::new(30).unwrap());
        assert_eq!(p1.page_no.get(), 1);
        assert_eq!(alloc.num_pages(&mut cache).unwrap(), 2);

        // Free page 1 and let free_unused_pages reclaim it.
        cache.begin_act();
        cache
            .do_event(
                p1,
                PageKind::Record,
                &PageEvent::Record(RecordEvent::CreateEntry { id: 1, bytes: b"y".to_vec() }),
            )
            .unwrap();
        cache
            .do_event(p1, PageKind::Record, &PageEvent::Record(RecordEvent::DeleteEntry { id: 1 }))
            .unwrap();
        cache.end_act(kvdb_types::Lsn::new(40).unwrap());

        cache.begin_act();
        let shrank = alloc.free_unused_pages(&mut cache, managed, p1.page_no).unwrap();
        cache.end_act(kvdb_types::Lsn::new(50).unwrap());
        assert!(shrank);
        assert_eq!(alloc.num_pages(&mut cache).unwrap(), 1);
    }
}
