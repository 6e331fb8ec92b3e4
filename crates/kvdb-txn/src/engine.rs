//! The transaction engine (C4, spec §4.6): `doAct`/commit/rollback,
//! checkpointing, and ARIES-style crash recovery layered over the page
//! cache and record log.

use std::sync::Arc;

use hashbrown::HashMap;
use kvdb_error::{KvError, Result};
use kvdb_log::RecordLog;
use kvdb_pager::{LoggedEvent, PageCache, PageEvent};
use kvdb_types::{Lsn, PageId, TxId};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::record::LogRecord;
use crate::table::TxTableEntry;

/// The mutation vocabulary of one page-cache user (the KV façade's
/// `SetEntryConfig` and friends), driven through `doAct`/undo by the
/// engine without the engine needing to know what kind of act it is.
pub trait ActConfig {
    /// The act's own parameters (e.g. "set key K to value V").
    type Act;

    /// Apply `act` against `cache` inside an already-open act (the caller
    /// has called [`PageCache::begin_act`]), returning bytes sufficient
    /// to undo it later.
    fn do_act(&mut self, cache: &mut PageCache, act: &Self::Act) -> Result<Vec<u8>>;

    /// Apply the inverse of a previously recorded act, given the
    /// `undo_info` it returned from [`do_act`](Self::do_act). Also runs
    /// inside an already-open act.
    fn undo_act(&mut self, cache: &mut PageCache, undo_info: &[u8]) -> Result<()>;
}

/// Driver for one database's write-ahead logging, act bookkeeping and
/// recovery, generic over the kind of act `C` knows how to perform and
/// undo.
pub struct TxnEngine<C: ActConfig> {
    log: Arc<Mutex<RecordLog>>,
    config: C,
    tt: HashMap<TxId, TxTableEntry>,
    last_cp_lsn: Lsn,
    /// Checkpoint automatically once the log has grown this many bytes'
    /// worth of LSN space since the last one.
    auto_checkpoint_bytes: u64,
    /// If set, a checkpoint also evicts and flushes every dirty page
    /// whose `rec_lsn` is older than `end - flush_limit_size` (spec
    /// §4.6's `flushLimitSize` tightening).
    flush_limit_size: Option<u64>,
}

impl<C: ActConfig> TxnEngine<C> {
    /// Wrap an already-open log and recover from it if it holds any
    /// uncommitted work, yielding control to `yield_fn` periodically
    /// (spec §5: recovery must cooperate with other scheduled work).
    pub fn open(
        log: Arc<Mutex<RecordLog>>,
        cache: &mut PageCache,
        config: C,
        auto_checkpoint_bytes: u64,
        flush_limit_size: Option<u64>,
        mut yield_fn: impl FnMut(),
    ) -> Result<Self> {
        let mut engine = TxnEngine {
            log,
            config,
            tt: HashMap::new(),
            last_cp_lsn: Lsn::NONE,
            auto_checkpoint_bytes,
            flush_limit_size,
        };
        engine.recover(cache, &mut yield_fn)?;
        Ok(engine)
    }

    /// Transactions with at least one outstanding (uncommitted) act.
    #[must_use]
    pub fn active_tx_ids(&self) -> Vec<TxId> {
        self.tt.keys().copied().collect()
    }

    /// Perform one act against `cache`, logging it and updating the
    /// transaction table (`doAct`, spec §4.6).
    pub fn do_act(&mut self, cache: &mut PageCache, tx_id: TxId, act: &C::Act) -> Result<()> {
        let prev_lsn = self.tt.get(&tx_id).map_or(Lsn::NONE, |e| e.last_lsn);

        cache.begin_act();
        let undo_info = self.config.do_act(cache, act)?;
        let events = cache.current_act_events().to_vec();

        let record = LogRecord::Act {
            tx_id,
            prev_lsn,
            undo_info,
            events,
        };
        let act_lsn = self.log.lock().append_record(&record.serialize())?;
        cache.end_act(act_lsn);

        let entry = self.tt.entry(tx_id).or_insert(TxTableEntry {
            first_lsn: act_lsn,
            last_lsn: act_lsn,
            undo_nxt_lsn: act_lsn,
        });
        entry.last_lsn = act_lsn;
        entry.undo_nxt_lsn = act_lsn;

        trace!(tx = tx_id.get(), lsn = %act_lsn, "logged act");
        self.maybe_auto_checkpoint(cache)?;
        Ok(())
    }

    /// Commit a transaction: append a COMMIT record, force the log
    /// durable up to it, and drop the transaction's table entry.
    pub fn commit(&mut self, tx_id: TxId) -> Result<()> {
        if !self.tt.contains_key(&tx_id) {
            // A transaction with no acts yet has nothing to make durable.
            return Ok(());
        }
        let record = LogRecord::Commit { tx_id };
        let lsn = self.log.lock().append_record(&record.serialize())?;
        self.log.lock().flush_to_point(lsn)?;
        self.tt.remove(&tx_id);
        debug!(tx = tx_id.get(), "committed");
        Ok(())
    }

    /// Undo one step of `tx_id`'s outstanding work: read the record at
    /// its `undo_nxt_lsn`, and for an ACT, invoke [`ActConfig::undo_act`]
    /// and append a CLR recording the next step; for a CLR, simply
    /// advance `undo_nxt_lsn` along its chain.
    fn undo_step(&mut self, cache: &mut PageCache, tx_id: TxId) -> Result<()> {
        let entry = *self
            .tt
            .get(&tx_id)
            .ok_or_else(|| KvError::client(format!("no outstanding work for tx {}", tx_id.get())))?;
        let (bytes, _next) = self.log.lock().get_record(entry.undo_nxt_lsn)?;
        match LogRecord::deserialize(&bytes)? {
            LogRecord::Act { prev_lsn, undo_info, .. } => {
                cache.begin_act();
                self.config.undo_act(cache, &undo_info)?;
                let events = cache.current_act_events().to_vec();
                let clr = LogRecord::Clr {
                    tx_id,
                    prev_lsn: entry.last_lsn,
                    undo_nxt_lsn: prev_lsn,
                    events,
                };
                let clr_lsn = self.log.lock().append_record(&clr.serialize())?;
                cache.end_act(clr_lsn);
                let e = self.tt.get_mut(&tx_id).expect("checked above");
                e.last_lsn = clr_lsn;
                e.undo_nxt_lsn = prev_lsn;
            }
            LogRecord::Clr { undo_nxt_lsn, .. } => {
                self.tt.get_mut(&tx_id).expect("checked above").undo_nxt_lsn = undo_nxt_lsn;
            }
            other => {
                return Err(KvError::corrupt(format!(
                    "unexpected record kind {other:?} in undo chain for tx {}",
                    tx_id.get()
                )));
            }
        }
        Ok(())
    }

    /// Roll back a transaction's entire outstanding work (spec §4.6
    /// `rollback`), undoing acts from most to least recent.
    pub fn rollback(&mut self, cache: &mut PageCache, tx_id: TxId) -> Result<()> {
        while self.tt.get(&tx_id).is_some_and(|e| e.undo_nxt_lsn.is_some()) {
            self.undo_step(cache, tx_id)?;
        }
        self.tt.remove(&tx_id);
        debug!(tx = tx_id.get(), "rolled back");
        Ok(())
    }

    /// Tighten the cache per `flush_limit_size`, snapshot the
    /// transaction table and dirty page table into a CHECKPOINT record,
    /// and trim the log to what the snapshot still needs (spec §4.6
    /// `checkpoint`).
    pub fn checkpoint(&mut self, cache: &mut PageCache) -> Result<()> {
        if let Some(limit) = self.flush_limit_size {
            let end = self.log.lock().get_end();
            let threshold = Lsn::from_raw(end.get().saturating_sub(limit));
            cache.evict_older_than(threshold)?;
        }

        let tt: Vec<(TxId, TxTableEntry)> = self.tt.iter().map(|(&k, &v)| (k, v)).collect();
        let dpt: Vec<(PageId, Lsn)> = cache.dpt_snapshot();

        let record = LogRecord::Checkpoint {
            tt: tt.clone(),
            dpt: dpt.clone(),
        };
        let cp_lsn = self.log.lock().append_record(&record.serialize())?;
        self.last_cp_lsn = cp_lsn;

        let mut trim_lsn = cp_lsn;
        for (_, entry) in &tt {
            trim_lsn = trim_lsn.min(entry.first_lsn);
        }
        for &(_, rec_lsn) in &dpt {
            trim_lsn = trim_lsn.min(rec_lsn);
        }
        self.log.lock().trim_to_point(trim_lsn)?;
        debug!(cp_lsn = %cp_lsn, trim_lsn = %trim_lsn, "checkpoint written");
        Ok(())
    }

    /// Checkpoint if the log has grown enough since the last one to
    /// warrant it (spec §4.6: bound recovery time and log length).
    fn maybe_auto_checkpoint(&mut self, cache: &mut PageCache) -> Result<()> {
        let end = self.log.lock().get_end();
        if end.get().saturating_sub(self.last_cp_lsn.get()) >= self.auto_checkpoint_bytes {
            self.checkpoint(cache)?;
        }
        Ok(())
    }

    /// Apply every event of an ACT/CLR record during redo, each one
    /// guarded by the ARIES page-LSN check (spec §4.6 step 3: redo an
    /// event only if the page's on-cache `pageLsn` predates this act).
    fn redo_record_events(&mut self, cache: &mut PageCache, act_lsn: Lsn, events: &[LoggedEvent]) -> Result<()> {
        cache.begin_redo_act();
        for logged in events {
            let event = PageEvent::deserialize(&logged.event_bytes)?;
            let kind = event.kind();
            let page_id = PageId::new(logged.namespace, logged.page_no);
            cache.pin(page_id, kind)?;
            let page_lsn = cache.page(page_id).map_or(Lsn::NONE, kvdb_pager::TxPage::page_lsn);
            cache.unpin(page_id);
            if page_lsn < act_lsn {
                cache.redo_do_event(page_id, kind, &event, logged.update_type)?;
            }
        }
        cache.end_redo_act(act_lsn);
        Ok(())
    }

    /// Recover from the log after reopening a database: find the last
    /// checkpoint, redo forward from it, undo every transaction left
    /// uncommitted, and write a fresh checkpoint (spec §4.6 `recover`).
    fn recover(&mut self, cache: &mut PageCache, yield_fn: &mut impl FnMut()) -> Result<()> {
        if self.log.lock().is_empty() {
            return Ok(());
        }
        let end = self.log.lock().get_end();

        // Pass 1: find the last checkpoint, if any.
        let mut last_checkpoint = None;
        let mut lsn = self.log.lock().get_start();
        let mut scanned = 0u64;
        while lsn < end {
            let (bytes, next) = self.log.lock().get_record(lsn)?;
            if let LogRecord::Checkpoint { tt, dpt } = LogRecord::deserialize(&bytes)? {
                last_checkpoint = Some((lsn, tt, dpt));
            }
            lsn = next;
            scanned += 1;
            if scanned % 256 == 0 {
                yield_fn();
            }
        }

        let (analysis_lsn, seed_tt, seed_dpt) = match last_checkpoint {
            Some((cp_lsn, tt, dpt)) => {
                let dpt_min = dpt.iter().map(|&(_, rec_lsn)| rec_lsn).min();
                let start = dpt_min.map_or(cp_lsn, |m| cp_lsn.min(m));
                (start, tt, dpt)
            }
            None => (self.log.lock().get_start(), Vec::new(), Vec::new()),
        };
        self.tt = seed_tt.into_iter().collect();
        for (page_id, rec_lsn) in seed_dpt {
            cache.seed_dpt(page_id, rec_lsn);
        }

        // Pass 2: analysis + redo, scanning forward from the analysis
        // start so every dirty page is brought current.
        let mut lsn = analysis_lsn;
        let mut scanned = 0u64;
        while lsn < end {
            let (bytes, next) = self.log.lock().get_record(lsn)?;
            match LogRecord::deserialize(&bytes)? {
                LogRecord::Act { tx_id, events, .. } => {
                    self.redo_record_events(cache, lsn, &events)?;
                    let e = self.tt.entry(tx_id).or_insert(TxTableEntry {
                        first_lsn: lsn,
                        last_lsn: lsn,
                        undo_nxt_lsn: lsn,
                    });
                    e.last_lsn = lsn;
                    e.undo_nxt_lsn = lsn;
                }
                LogRecord::Clr {
                    tx_id,
                    undo_nxt_lsn,
                    events,
                    ..
                } => {
                    self.redo_record_events(cache, lsn, &events)?;
                    let e = self.tt.entry(tx_id).or_insert(TxTableEntry {
                        first_lsn: lsn,
                        last_lsn: lsn,
                        undo_nxt_lsn,
                    });
                    e.last_lsn = lsn;
                    e.undo_nxt_lsn = undo_nxt_lsn;
                }
                LogRecord::Commit { tx_id } => {
                    self.tt.remove(&tx_id);
                }
                LogRecord::Checkpoint { .. } => {}
            }
            lsn = next;
            scanned += 1;
            if scanned % 256 == 0 {
                yield_fn();
            }
        }

        // Pass 3: undo every transaction left active, oldest work first
        // (largest `undo_nxt_lsn` first, per spec §4.6).
        loop {
            let next_tx = self
                .tt
                .iter()
                .filter(|(_, e)| e.undo_nxt_lsn.is_some())
                .max_by_key(|(_, e)| e.undo_nxt_lsn)
                .map(|(&tx, _)| tx);
            let Some(tx_id) = next_tx else { break };
            self.undo_step(cache, tx_id)?;
            yield_fn();
        }
        self.tt.clear();

        // Force a full flush-and-trim checkpoint once recovery settles.
        let saved = self.flush_limit_size;
        self.flush_limit_size = Some(0);
        self.checkpoint(cache)?;
        self.flush_limit_size = saved;
        Ok(())
    }

    /// Give back the act config (used by callers that need to recover
    /// state it owns, e.g. reading a root pointer after recovery).
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Mutable access to the act config.
    pub fn config_mut(&mut self) -> &mut C {
        &mut self.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kvdb_pager::{ConfigEvent, PageEvent, PageKind, PageObj};
    use kvdb_pagestore::MemPageStore;
    use kvdb_types::{Namespace, PageNo};
    use parking_lot::Mutex;

    use super::*;

    /// An act against a single well-known config page: set or delete one
    /// key, self-contained enough to keep this crate's tests from
    /// depending on `kvdb-btree`.
    #[derive(Debug, Clone)]
    enum TestAct {
        Set { key: u8, value: Vec<u8> },
        Delete { key: u8 },
    }

    struct TestConfig {
        page_id: PageId,
    }

    impl TestConfig {
        fn key_value(&self, cache: &PageCache, key: u8) -> Option<Vec<u8>> {
            match cache.page(self.page_id)?.obj() {
                PageObj::Config(c) => c.entries.get(&key).cloned(),
                _ => None,
            }
        }
    }

    impl ActConfig for TestConfig {
        type Act = TestAct;

        fn do_act(&mut self, cache: &mut PageCache, act: &TestAct) -> Result<Vec<u8>> {
            cache.pin(self.page_id, PageKind::Config)?;
            let key = match act {
                TestAct::Set { key, .. } | TestAct::Delete { key } => *key,
            };
            let old = self.key_value(cache, key);
            cache.unpin(self.page_id);

            let event = match act {
                TestAct::Set { key, value } => ConfigEvent::SetValue {
                    key: *key,
                    bytes: value.clone(),
                },
                TestAct::Delete { key } => ConfigEvent::DeleteValue { key: *key },
            };
            cache.do_event(self.page_id, PageKind::Config, &PageEvent::Config(event))?;

            let mut undo = vec![key];
            match old {
                Some(v) => {
                    undo.push(1);
                    undo.push(v.len() as u8);
                    undo.extend_from_slice(&v);
                }
                None => undo.push(0),
            }
            Ok(undo)
        }

        fn undo_act(&mut self, cache: &mut PageCache, undo_info: &[u8]) -> Result<()> {
            let key = undo_info[0];
            let event = if undo_info[1] == 1 {
                let len = undo_info[2] as usize;
                ConfigEvent::SetValue {
                    key,
                    bytes: undo_info[3..3 + len].to_vec(),
                }
            } else {
                ConfigEvent::DeleteValue { key }
            };
            cache.do_event(self.page_id, PageKind::Config, &PageEvent::Config(event))?;
            Ok(())
        }
    }

    fn config_page_id() -> PageId {
        PageId::new(Namespace::from(1), PageNo::new(0).unwrap())
    }

    fn fresh(store: Arc<MemPageStore>) -> (Arc<Mutex<RecordLog>>, PageCache) {
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 256).unwrap()));
        let cache = PageCache::new(store, log.clone(), 16);
        (log, cache)
    }

    fn value_of(cache: &PageCache, config: &TestConfig, key: u8) -> Option<Vec<u8>> {
        config.key_value(cache, key)
    }

    #[test]
    fn do_act_then_commit_persists_the_value() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());
        let (log, mut cache) = fresh(store);
        let config = TestConfig { page_id: config_page_id() };
        let mut engine = TxnEngine::open(log, &mut cache, config, 1 << 20, None, || {}).unwrap();

        let tx = TxId::new(1).unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 5, value: vec![9, 9] })
            .unwrap();
        engine.commit(tx).unwrap();

        assert_eq!(value_of(&cache, engine.config(), 5), Some(vec![9, 9]));
        assert!(engine.active_tx_ids().is_empty());
    }

    #[test]
    fn rollback_undoes_a_single_act() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());
        let (log, mut cache) = fresh(store);
        let config = TestConfig { page_id: config_page_id() };
        let mut engine = TxnEngine::open(log, &mut cache, config, 1 << 20, None, || {}).unwrap();

        let tx = TxId::new(1).unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 5, value: vec![1] })
            .unwrap();
        engine.rollback(&mut cache, tx).unwrap();

        assert_eq!(value_of(&cache, engine.config(), 5), None);
        assert!(engine.active_tx_ids().is_empty());
    }

    #[test]
    fn rollback_chains_clrs_across_several_acts() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());
        let (log, mut cache) = fresh(store);
        let config = TestConfig { page_id: config_page_id() };
        let mut engine = TxnEngine::open(log, &mut cache, config, 1 << 20, None, || {}).unwrap();

        let tx = TxId::new(1).unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 7, value: vec![1] })
            .unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 7, value: vec![2] })
            .unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 7, value: vec![3] })
            .unwrap();
        assert_eq!(value_of(&cache, engine.config(), 7), Some(vec![3]));

        engine.rollback(&mut cache, tx).unwrap();
        assert_eq!(value_of(&cache, engine.config(), 7), None);
    }

    #[test]
    fn checkpoint_trims_the_log_past_committed_work() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());
        let (log, mut cache) = fresh(store);
        let config = TestConfig { page_id: config_page_id() };
        let mut engine = TxnEngine::open(log.clone(), &mut cache, config, 1 << 20, None, || {}).unwrap();

        let tx = TxId::new(1).unwrap();
        engine
            .do_act(&mut cache, tx, &TestAct::Set { key: 1, value: vec![1] })
            .unwrap();
        engine.commit(tx).unwrap();

        let start_before = log.lock().get_start();
        engine.checkpoint(&mut cache).unwrap();
        let start_after = log.lock().get_start();
        assert!(start_after >= start_before);
    }

    #[test]
    fn recovery_rolls_back_an_uncommitted_act_after_a_simulated_crash() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());

        {
            let (log, mut cache) = fresh(store.clone());
            let config = TestConfig { page_id: config_page_id() };
            let mut engine = TxnEngine::open(log, &mut cache, config, 1 << 20, None, || {}).unwrap();
            let tx = TxId::new(1).unwrap();
            engine
                .do_act(&mut cache, tx, &TestAct::Set { key: 3, value: vec![42] })
                .unwrap();
            // No commit: `engine`/`cache`/`log` drop here, simulating a crash
            // with this transaction's only act still outstanding.
        }

        let (log2, mut cache2) = fresh(store);
        let config2 = TestConfig { page_id: config_page_id() };
        let engine2 = TxnEngine::open(log2, &mut cache2, config2, 1 << 20, None, || {}).unwrap();

        assert_eq!(value_of(&cache2, engine2.config(), 3), None);
        assert!(engine2.active_tx_ids().is_empty());
    }

    #[test]
    fn recovery_keeps_a_committed_act_after_a_simulated_crash() {
        let store: Arc<MemPageStore> = Arc::new(MemPageStore::new());

        {
            let (log, mut cache) = fresh(store.clone());
            let config = TestConfig { page_id: config_page_id() };
            let mut engine = TxnEngine::open(log, &mut cache, config, 1 << 20, None, || {}).unwrap();
            let tx = TxId::new(1).unwrap();
            engine
                .do_act(&mut cache, tx, &TestAct::Set { key: 3, value: vec![42] })
                .unwrap();
            engine.commit(tx).unwrap();
        }

        let (log2, mut cache2) = fresh(store);
        let config2 = TestConfig { page_id: config_page_id() };
        let engine2 = TxnEngine::open(log2, &mut cache2, config2, 1 << 20, None, || {}).unwrap();

        assert_eq!(value_of(&cache2, engine2.config(), 3), Some(vec![42]));
    }
}
