//! The transactional page cache (C3, spec §4.5): a bounded LRU of
//! [`TxPage`]s shared across namespaces, enforcing WAL-flush-before-evict.

use std::sync::Arc;

use hashbrown::HashMap;
use kvdb_error::{KvError, Result};
use kvdb_log::RecordLog;
use kvdb_pagestore::PageStore;
use kvdb_types::{Lsn, Namespace, PageId, PageNo, UpdateType};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::objects::{PageEvent, PageKind, PageObj};
use crate::tx_page::TxPage;

/// One logged event plus its address, ready to fold into an ACT/CLR
/// record body (spec §3 "each event sub-record carries (update_type, ns,
/// page_number, event_bytes)").
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub update_type: UpdateType,
    pub namespace: Namespace,
    pub page_no: PageNo,
    pub event_bytes: Vec<u8>,
}

#[derive(Default)]
struct ActBuf {
    touched: Vec<PageId>,
    events: Vec<LoggedEvent>,
}

/// A bounded LRU cache of deserialized pages shared across all namespaces
/// of one database.
pub struct PageCache {
    store: Arc<dyn PageStore>,
    log: Arc<Mutex<RecordLog>>,
    capacity: usize,
    entries: HashMap<PageId, TxPage>,
    /// Dirty page table: page id to the LSN of the oldest unflushed
    /// change (spec §3 DPT).
    dpt: HashMap<PageId, Lsn>,
    clock: u64,
    current_act: Option<ActBuf>,
}

impl PageCache {
    /// Create a cache backed by `store` and `log`, holding at most
    /// `capacity` resident pages.
    pub fn new(store: Arc<dyn PageStore>, log: Arc<Mutex<RecordLog>>, capacity: usize) -> Self {
        PageCache {
            store,
            log,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            dpt: HashMap::new(),
            clock: 0,
            current_act: None,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn load(&mut self, page_id: PageId, kind: PageKind) -> Result<()> {
        if self.entries.contains_key(&page_id) {
            return Ok(());
        }
        self.evict_one_if_over_capacity()?;
        let raw = self.store.read(page_id.namespace, page_id.page_no)?;
        let (page_lsn, page_exists, obj) = match raw {
            Some(bytes) => {
                if bytes.len() < 6 {
                    return Err(KvError::corrupt(format!("page {page_id} shorter than lsn prefix")));
                }
                let mut full = [0u8; 8];
                full[0..6].copy_from_slice(&bytes[0..6]);
                let lsn = Lsn::new(u64::from_le_bytes(full))?;
                let obj = PageObj::deserialize(kind, &bytes[6..])?;
                (lsn, true, obj)
            }
            None => (Lsn::NONE, false, PageObj::default_of_kind(kind)),
        };
        let touch = self.tick();
        self.entries.insert(
            page_id,
            TxPage {
                page_id,
                page_lsn,
                page_exists,
                obj,
                pin_count: 0,
                last_touch: touch,
            },
        );
        Ok(())
    }

    /// Pin a page for the duration of the caller's hold, loading it from
    /// disk (or synthesizing an empty default object of `kind`) if it is
    /// not already resident.
    pub fn pin(&mut self, page_id: PageId, kind: PageKind) -> Result<()> {
        self.load(page_id, kind)?;
        let touch = self.tick();
        let entry = self.entries.get_mut(&page_id).expect("just loaded");
        entry.pin_count += 1;
        entry.last_touch = touch;
        Ok(())
    }

    /// Release one pin on a page. Does not touch its `pageLsn` or DPT
    /// membership — use [`end_act`](Self::end_act) for that.
    pub fn unpin(&mut self, page_id: PageId) {
        if let Some(entry) = self.entries.get_mut(&page_id) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// Read-only access to a pinned page's current object.
    #[must_use]
    pub fn page(&self, page_id: PageId) -> Option<&TxPage> {
        self.entries.get(&page_id)
    }

    /// Begin a fresh act: the cache will accumulate touched pages and
    /// logged events until [`end_act`](Self::end_act) is called.
    pub fn begin_act(&mut self) {
        self.current_act = Some(ActBuf::default());
    }

    /// Pin a page (on its first touch this act) and apply `event` to it,
    /// appending `(update_type, namespace, page_num, event.serialize())`
    /// to the current act's event buffer (`doEvent`, spec §4.5 steps 1-4).
    pub fn do_event(&mut self, page_id: PageId, kind: PageKind, event: &PageEvent) -> Result<UpdateType> {
        let act = self
            .current_act
            .as_mut()
            .ok_or_else(|| KvError::corrupt("do_event called outside an act"))?;
        let first_touch = !act.touched.contains(&page_id);

        self.load(page_id, kind)?;
        let touch = self.tick();
        let entry = self.entries.get_mut(&page_id).expect("just loaded");
        if first_touch {
            entry.pin_count += 1;
        }
        entry.last_touch = touch;

        let was_empty = entry.obj.is_empty();
        entry.obj.apply(event)?;
        let update_type = UpdateType::classify(was_empty, entry.obj.is_empty());
        trace!(page = %page_id, ?update_type, "applied page event");

        let act = self.current_act.as_mut().expect("checked above");
        if first_touch {
            act.touched.push(page_id);
        }
        act.events.push(LoggedEvent {
            update_type,
            namespace: page_id.namespace,
            page_no: page_id.page_no,
            event_bytes: event.serialize(),
        });
        Ok(update_type)
    }

    /// Events the current act has logged so far, without ending it. The
    /// transaction engine needs these to assemble an ACT/CLR record body
    /// before it knows that record's own LSN, which [`end_act`](Self::end_act)
    /// requires as an argument.
    #[must_use]
    pub fn current_act_events(&self) -> &[LoggedEvent] {
        self.current_act.as_ref().map(|a| a.events.as_slice()).unwrap_or(&[])
    }

    /// Finalize the current act (`doAct` step 5, spec §4.6): for every
    /// page touched, set `pageLsn`, add it to the DPT if absent, and
    /// release its pin. Returns the act's collected events for the
    /// caller to fold into the ACT/CLR log record body.
    pub fn end_act(&mut self, act_lsn: Lsn) -> Vec<LoggedEvent> {
        let act = self.current_act.take().unwrap_or_default();
        for &page_id in &act.touched {
            if let Some(entry) = self.entries.get_mut(&page_id) {
                entry.page_lsn = act_lsn;
                entry.page_exists = !entry.obj.is_empty();
            }
            self.dpt.entry(page_id).or_insert(act_lsn);
            self.unpin(page_id);
        }
        act.events
    }

    /// Begin a fresh redo act (recovery's `redoAct`, spec §4.6): like
    /// [`begin_act`](Self::begin_act) but events are supplied (not
    /// produced), so no event buffer is needed.
    pub fn begin_redo_act(&mut self) {
        self.current_act = Some(ActBuf::default());
    }

    /// Pin a page (on its first touch this redo act) and apply `event` to
    /// it only if the page's current emptiness matches what `update_type`
    /// implies it was before (`redoEvent`, spec §4.5). Returns whether the
    /// event was applied.
    pub fn redo_do_event(
        &mut self,
        page_id: PageId,
        kind: PageKind,
        event: &PageEvent,
        update_type: UpdateType,
    ) -> Result<bool> {
        let act = self
            .current_act
            .as_mut()
            .ok_or_else(|| KvError::corrupt("redo_do_event called outside a redo act"))?;
        let first_touch = !act.touched.contains(&page_id);

        self.load(page_id, kind)?;
        let touch = self.tick();
        let entry = self.entries.get_mut(&page_id).expect("just loaded");
        if first_touch {
            entry.pin_count += 1;
        }
        entry.last_touch = touch;

        if entry.obj.is_empty() != update_type.expects_empty_before() {
            if first_touch {
                self.current_act.as_mut().expect("checked above").touched.push(page_id);
            }
            return Ok(false);
        }
        entry.obj.apply(event)?;

        if first_touch {
            self.current_act.as_mut().expect("checked above").touched.push(page_id);
        }
        Ok(true)
    }

    /// Finalize the current redo act: same bookkeeping as
    /// [`end_act`](Self::end_act), without an event buffer to return.
    pub fn end_redo_act(&mut self, act_lsn: Lsn) {
        let act = self.current_act.take().unwrap_or_default();
        for &page_id in &act.touched {
            if let Some(entry) = self.entries.get_mut(&page_id) {
                entry.page_lsn = act_lsn;
                entry.page_exists = !entry.obj.is_empty();
            }
            self.dpt.entry(page_id).or_insert(act_lsn);
            self.unpin(page_id);
        }
    }

    fn persist(&mut self, page_id: PageId) -> Result<()> {
        let entry = self.entries.get(&page_id).expect("present during evict/flush");
        if entry.obj.is_empty() {
            self.store.delete(page_id.namespace, page_id.page_no)?;
        } else {
            let mut bytes = Vec::new();
            let lsn_bytes = entry.page_lsn.get().to_le_bytes();
            bytes.extend_from_slice(&lsn_bytes[0..6]);
            bytes.extend_from_slice(&entry.obj.serialize());
            if self.store.exists(page_id.namespace, page_id.page_no)? {
                self.store.write(page_id.namespace, page_id.page_no, &bytes)?;
            } else {
                self.store.create(page_id.namespace, page_id.page_no, Some(&bytes))?;
            }
        }
        Ok(())
    }

    /// Flush and persist a single page (spec §4.5 eviction steps 1-4),
    /// without removing it from the cache.
    fn flush_entry(&mut self, page_id: PageId) -> Result<()> {
        if !self.dpt.contains_key(&page_id) {
            return Ok(());
        }
        let page_lsn = self.entries.get(&page_id).map(|e| e.page_lsn).unwrap_or(Lsn::NONE);
        self.log.lock().flush_to_point(page_lsn)?;
        self.persist(page_id)?;
        self.dpt.remove(&page_id);
        Ok(())
    }

    fn evict_one_if_over_capacity(&mut self) -> Result<()> {
        if self.entries.len() < self.capacity {
            return Ok(());
        }
        let victim = self
            .entries
            .values()
            .filter(|e| e.pin_count == 0)
            .min_by_key(|e| e.last_touch)
            .map(|e| e.page_id);
        let Some(victim) = victim else {
            // Every resident page is pinned; allow transient overflow
            // rather than block (acts are bounded and short-lived).
            return Ok(());
        };
        self.flush_entry(victim)?;
        self.entries.remove(&victim);
        Ok(())
    }

    /// Flush and evict every dirty page whose `rec_lsn` is older than
    /// `before` (used by checkpoint's `flushLimitSize` tightening, spec
    /// §4.6).
    pub fn evict_older_than(&mut self, before: Lsn) -> Result<()> {
        let candidates: Vec<PageId> = self
            .dpt
            .iter()
            .filter(|&(_, &rec_lsn)| rec_lsn < before)
            .map(|(&id, _)| id)
            .collect();
        for id in candidates {
            self.flush_entry(id)?;
            if self.entries.get(&id).is_some_and(|e| e.pin_count == 0) {
                self.entries.remove(&id);
            }
        }
        Ok(())
    }

    /// Flush every dirty page (used at checkpoint/close time).
    pub fn flush_all(&mut self) -> Result<()> {
        let ids: Vec<PageId> = self.dpt.keys().copied().collect();
        for id in ids {
            self.flush_entry(id)?;
        }
        Ok(())
    }

    /// A snapshot of the dirty page table for a checkpoint record.
    #[must_use]
    pub fn dpt_snapshot(&self) -> Vec<(PageId, Lsn)> {
        self.dpt.iter().map(|(&id, &lsn)| (id, lsn)).collect()
    }

    /// The minimum `rec_lsn` across the DPT, if non-empty.
    #[must_use]
    pub fn min_dpt_rec_lsn(&self) -> Option<Lsn> {
        self.dpt.values().copied().min()
    }

    /// Seed the DPT from a checkpoint record read during recovery.
    pub fn seed_dpt(&mut self, page_id: PageId, rec_lsn: Lsn) {
        self.dpt.entry(page_id).or_insert(rec_lsn);
    }

    /// Drop a resident page's cached state without persisting it. Used
    /// only by recovery when a page is known to be superseded.
    pub fn invalidate(&mut self, page_id: PageId) {
        self.entries.remove(&page_id);
    }

    /// Convenience to build a [`PageId`] from a raw namespace/page pair.
    pub fn page_id(ns: u8, page_no: u64) -> Result<PageId> {
        Ok(PageId::new(Namespace::from(ns), PageNo::new(page_no)?))
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "error flushing page cache on drop");
        }
    }
}
