//! The record allocator (C6, spec §4.4): variable-length byte-string
//! entries packed onto fixed-size record pages, indexed by a 25-bucket
//! size-class free list rooted in a header `ConfigPage`.

use kvdb_error::{KvError, Result};
use kvdb_pager::objects::{PageEvent, PageKind, PageObj, RecordEvent};
use kvdb_pager::PageCache;
use kvdb_types::{Namespace, PageId, PageNo, Rid};
use rand::Rng;
use tracing::trace;

use crate::page_alloc::PageAllocator;

/// Per-entry framing overhead charged against a page's usable capacity
/// (2-byte entry id + 2-byte length prefix, matching `RecordPage`'s wire
/// format).
const ENTRY_OVERHEAD: usize = 4;
const NUM_CLASSES: u8 = 25;

/// Size-class free lists over one record-data namespace, plus the page
/// allocator that grows it.
pub struct RecordAllocator {
    ns: Namespace,
    header_page: PageId,
    page_alloc: PageAllocator,
    /// Usable bytes per page after the `[sizeClass:1][prev:6][next:6]`
    /// header, used for size-class bucket math.
    page_capacity: usize,
}

fn bucket_size(page_capacity: usize) -> usize {
    (page_capacity / NUM_CLASSES as usize).max(1)
}

fn class_of(used: usize, page_capacity: usize) -> u8 {
    ((used / bucket_size(page_capacity)) as u8).min(NUM_CLASSES - 1)
}

/// The fullest class that still guarantees `req` bytes free on any page
/// it contains, or `None` if even the emptiest class cannot guarantee it
/// (the record is too large for a single page and must be chained, see
/// [`crate::vid_chain`]).
fn candidate_class(page_capacity: usize, req: usize) -> Option<u8> {
    if req > page_capacity {
        return None;
    }
    let bucket = bucket_size(page_capacity);
    let max_allowed_used = page_capacity - req;
    let c = (max_allowed_used + 1) / bucket;
    if c == 0 {
        None
    } else {
        Some((c - 1).min((NUM_CLASSES - 1) as usize) as u8)
    }
}

impl RecordAllocator {
    /// Open a record allocator whose header page (holding the 25 class
    /// heads and the page allocator's `numPages` counter) is page 0 of
    /// `ns`; record-data pages start at page 1.
    pub fn open(cache: &mut PageCache, ns: Namespace, page_capacity: usize) -> Result<Self> {
        let header_page = PageId::new(ns, PageNo::new(0)?);
        cache.pin(header_page, PageKind::Config)?;
        cache.unpin(header_page);
        let page_alloc = PageAllocator::open(cache, header_page, PageKind::Record, 1)?;
        Ok(RecordAllocator {
            ns,
            header_page,
            page_alloc,
            page_capacity,
        })
    }

    fn class_head(&self, cache: &PageCache, class: u8) -> Result<Option<PageNo>> {
        let page = cache
            .page(self.header_page)
            .ok_or_else(|| KvError::corrupt("record allocator header page not pinned"))?;
        let PageObj::Config(cfg) = page.obj() else {
            return Err(KvError::corrupt("record allocator header is not a config page"));
        };
        match cfg.entries.get(&class) {
            None => Ok(None),
            Some(bytes) if bytes.len() < 6 => Err(KvError::corrupt("truncated class head pointer")),
            Some(bytes) => {
                let mut full = [0u8; 8];
                full[0..6].copy_from_slice(&bytes[0..6]);
                Ok(Some(PageNo::new(u64::from_le_bytes(full))?))
            }
        }
    }

    fn set_class_head(&self, cache: &mut PageCache, class: u8, head: Option<PageNo>) -> Result<()> {
        let event = match head {
            Some(pn) => {
                let full = pn.get().to_le_bytes();
                kvdb_pager::objects::ConfigEvent::SetValue {
                    key: class,
                    bytes: full[0..6].to_vec(),
                }
            }
            None => kvdb_pager::objects::ConfigEvent::DeleteValue { key: class },
        };
        cache.do_event(self.header_page, PageKind::Config, &PageEvent::Config(event))?;
        Ok(())
    }

    fn read_page(&self, cache: &mut PageCache, page_no: PageNo) -> Result<(u8, Option<PageNo>, Option<PageNo>, usize, bool)> {
        let id = PageId::new(self.ns, page_no);
        cache.pin(id, PageKind::Record)?;
        let result = {
            let page = cache.page(id).expect("just pinned");
            let PageObj::Record(rp) = page.obj() else {
                return Err(KvError::corrupt("expected a record page"));
            };
            (rp.size_class, rp.prev, rp.next, rp.used_space(), rp.is_empty())
        };
        cache.unpin(id);
        Ok(result)
    }

    fn set_links(&self, cache: &mut PageCache, page_no: PageNo, size_class: u8, prev: Option<PageNo>, next: Option<PageNo>) -> Result<()> {
        let id = PageId::new(self.ns, page_no);
        cache.do_event(
            id,
            PageKind::Record,
            &PageEvent::Record(RecordEvent::SetLinks { size_class, prev, next }),
        )?;
        Ok(())
    }

    fn unlink(&self, cache: &mut PageCache, page_no: PageNo, class: u8) -> Result<()> {
        let (_, prev, next, _, _) = self.read_page(cache, page_no)?;
        if let Some(p) = prev {
            let (pc, pp, _, _, _) = self.read_page(cache, p)?;
            self.set_links(cache, p, pc, pp, next)?;
        } else {
            self.set_class_head(cache, class, next)?;
        }
        if let Some(n) = next {
            let (nc, _, nn, _, _) = self.read_page(cache, n)?;
            self.set_links(cache, n, nc, prev, nn)?;
        }
        Ok(())
    }

    fn link_to_head(&self, cache: &mut PageCache, page_no: PageNo, class: u8) -> Result<()> {
        let old_head = self.class_head(cache, class)?;
        if let Some(h) = old_head {
            let (hc, _, hn, _, _) = self.read_page(cache, h)?;
            self.set_links(cache, h, hc, Some(page_no), hn)?;
        }
        self.set_links(cache, page_no, class, None, old_head)?;
        self.set_class_head(cache, class, Some(page_no))?;
        Ok(())
    }

    fn reclassify(&self, cache: &mut PageCache, page_no: PageNo) -> Result<()> {
        let (old_class, _, _, used, is_empty) = self.read_page(cache, page_no)?;
        let new_class = if is_empty { None } else { Some(class_of(used, self.page_capacity)) };
        if new_class == Some(old_class) {
            return Ok(());
        }
        self.unlink(cache, page_no, old_class)?;
        if let Some(c) = new_class {
            self.link_to_head(cache, page_no, c)?;
        }
        trace!(page = %page_no, old_class, ?new_class, "reclassified record page");
        Ok(())
    }

    /// Allocate storage for `bytes` (which must fit in one page, i.e.
    /// `bytes.len() + overhead <= page_capacity`; larger records are
    /// chained by [`crate::vid_chain`] into multiple entries instead).
    /// Must be called within an act already begun on `cache`.
    pub fn alloc_entry(&mut self, cache: &mut PageCache, bytes: &[u8], rng: &mut impl Rng) -> Result<Rid> {
        let req = bytes.len() + ENTRY_OVERHEAD;
        if req > self.page_capacity {
            return Err(KvError::client("record too large for a single page entry"));
        }
        let mut chosen = None;
        if let Some(mut c) = candidate_class(self.page_capacity, req) {
            loop {
                if let Some(head) = self.class_head(cache, c)? {
                    chosen = Some(head);
                    break;
                }
                if c == 0 {
                    break;
                }
                c -= 1;
            }
        }
        let page_no = match chosen {
            Some(p) => p,
            None => {
                let new_id = self.page_alloc.alloc(cache, self.ns, rng)?;
                self.link_to_head(cache, new_id.page_no, 0)?;
                new_id.page_no
            }
        };
        let entry_id = self.next_entry_id(cache, page_no)?;
        let id = PageId::new(self.ns, page_no);
        cache.do_event(
            id,
            PageKind::Record,
            &PageEvent::Record(RecordEvent::CreateEntry {
                id: entry_id,
                bytes: bytes.to_vec(),
            }),
        )?;
        self.reclassify(cache, page_no)?;
        Ok(Rid::new(page_no, entry_id))
    }

    fn next_entry_id(&self, cache: &mut PageCache, page_no: PageNo) -> Result<u16> {
        let id = PageId::new(self.ns, page_no);
        cache.pin(id, PageKind::Record)?;
        let next = {
            let page = cache.page(id).expect("just pinned");
            let PageObj::Record(rp) = page.obj() else {
                return Err(KvError::corrupt("expected a record page"));
            };
            (0..=u16::MAX).find(|id| !rp.entries.contains_key(id))
        };
        cache.unpin(id);
        next.ok_or_else(|| KvError::corrupt("record page entry ids exhausted"))
    }

    /// Overwrite an entry's bytes and reclassify its page.
    pub fn write_entry_bytes(&mut self, cache: &mut PageCache, rid: Rid, bytes: &[u8]) -> Result<()> {
        let id = PageId::new(self.ns, rid.page_no);
        cache.do_event(
            id,
            PageKind::Record,
            &PageEvent::Record(RecordEvent::WriteEntry {
                id: rid.entry_id,
                bytes: bytes.to_vec(),
            }),
        )?;
        self.reclassify(cache, rid.page_no)
    }

    /// Delete an entry, reclassifying (and potentially freeing) its page.
    pub fn delete_entry(&mut self, cache: &mut PageCache, rid: Rid) -> Result<()> {
        let id = PageId::new(self.ns, rid.page_no);
        cache.do_event(
            id,
            PageKind::Record,
            &PageEvent::Record(RecordEvent::DeleteEntry { id: rid.entry_id }),
        )?;
        self.reclassify(cache, rid.page_no)?;
        self.page_alloc.free_unused_pages(cache, self.ns, rid.page_no)?;
        Ok(())
    }

    /// Read an entry's raw bytes.
    pub fn read_entry(&self, cache: &mut PageCache, rid: Rid) -> Result<Vec<u8>> {
        let id = PageId::new(self.ns, rid.page_no);
        cache.pin(id, PageKind::Record)?;
        let bytes = {
            let page = cache.page(id).expect("just pinned");
            let PageObj::Record(rp) = page.obj() else {
                return Err(KvError::corrupt("expected a record page"));
            };
            rp.entries
                .get(&rid.entry_id)
                .cloned()
                .ok_or_else(|| KvError::corrupt("record entry missing"))?
        };
        cache.unpin(id);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kvdb_log::RecordLog;
    use kvdb_pagestore::{DirPageStore, PageStore};
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn new_cache(dir: &std::path::Path) -> PageCache {
        let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
        PageCache::new(store, log, 64)
    }

    #[test]
    fn alloc_write_read_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let ns = Namespace::from(2);
        let mut alloc = RecordAllocator::open(&mut cache, ns, 200).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        cache.begin_act();
        let rid = alloc.alloc_entry(&mut cache, b"hello world", &mut rng).unwrap();
        cache.end_act(kvdb_types::Lsn::new(10).unwrap());

        assert_eq!(alloc.read_entry(&mut cache, rid).unwrap(), b"hello world");

        cache.begin_act();
        alloc.write_entry_bytes(&mut cache, rid, b"updated").unwrap();
        cache.end_act(kvdb_types::Lsn::new(20).unwrap());
        assert_eq!(alloc.read_entry(&mut cache, rid).unwrap(), b"updated");

        cache.begin_act();
        alloc.delete_entry(&mut cache, rid).unwrap();
        cache.end_act(kvdb_types::Lsn::new(30).unwrap());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let ns = Namespace::from(2);
        let mut alloc = RecordAllocator::open(&mut cache, ns, 16).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        cache.begin_act();
        let err = alloc.alloc_entry(&mut cache, &[0u8; 32], &mut rng).unwrap_err();
        cache.end_act(kvdb_types::Lsn::new(1).unwrap());
        assert!(matches!(err, KvError::ClientError(_)));
    }
}
