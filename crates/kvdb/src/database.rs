//! `Database`: the open handle tying the page store, record log, page
//! cache, transaction engine, B+ tree and lock manager together behind
//! one set of per-transaction operations (spec §4.9, §4.11 "Database
//! open/close").

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use hashbrown::HashSet;
use kvdb_btree::BTree;
use kvdb_error::{KvError, Result};
use kvdb_lock::{AcquireOutcome, LockManager, ResourceId};
use kvdb_log::RecordLog;
use kvdb_pager::PageCache;
use kvdb_pagestore::{DirPageStore, PageStore};
use kvdb_txn::TxnEngine;
use kvdb_types::TxId;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::act::{SetEntryAct, SetEntryConfig};
use crate::config::Config;

/// Recovery yields to whatever else would be scheduled roughly every
/// 100ms of wall time (spec §5 "recovery throttling"). There is no real
/// dispatcher to yield to outside of [`crate::Dispatcher`], so the open
/// path just measures time and no-ops.
const RECOVERY_YIELD_INTERVAL: Duration = Duration::from_millis(100);

const LOCK_DIR: &str = "lock";
const LOCK_FILE: &str = "lock.bin";

/// The result of a façade operation that may have blocked on a lock
/// (spec §5: a worker suspends "when waiting for a lock"). A direct
/// caller driving one transaction at a time never sees `Blocked`; the
/// cooperative [`crate::Dispatcher`] requeues a blocked worker and
/// retries it once the resource it wants is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome<T> {
    Done(T),
    Blocked,
}

/// An open database. Owns every layer below the façade; `Drop` flushes
/// and releases the directory lock, matching the teacher's top-level
/// crate composing its lower layers behind one handle.
pub struct Database {
    _root: PathBuf,
    _lock_file: File,
    #[allow(dead_code)]
    store: Arc<dyn PageStore>,
    log: Arc<Mutex<RecordLog>>,
    cache: PageCache,
    engine: TxnEngine<SetEntryConfig>,
    locks: LockManager,
    active: HashSet<TxId>,
    next_tx_id: u32,
    closed: bool,
}

impl Database {
    /// Open (creating if necessary) a database directory, running crash
    /// recovery if the log holds outstanding work (spec §4.11).
    pub fn open(root: &Path, config: Config) -> Result<Self> {
        fs::create_dir_all(root.join(LOCK_DIR))?;
        let lock_file = File::create(root.join(LOCK_DIR).join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| KvError::client(format!("database at {} is already open: {e}", root.display())))?;

        let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(root)?);
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), config.page_size)?));
        let mut cache = PageCache::new(store.clone(), log.clone(), config.cache_capacity);

        let tree = BTree::open(
            &mut cache,
            config.meta_ns(),
            config.leaf_ns(),
            config.branch_ns(),
            config.kv_ns(),
            config.kv_page_capacity,
            config.btree_config(),
        )?;
        let act_config = SetEntryConfig::new(tree);

        let mut last_yield = Instant::now();
        let engine = TxnEngine::open(log.clone(), &mut cache, act_config, config.auto_checkpoint_bytes, config.flush_limit_size, || {
            if last_yield.elapsed() >= RECOVERY_YIELD_INTERVAL {
                last_yield = Instant::now();
            }
        })?;

        info!(root = %root.display(), "database opened");
        Ok(Database {
            _root: root.to_path_buf(),
            _lock_file: lock_file,
            store,
            log,
            cache,
            engine,
            locks: LockManager::new(),
            active: HashSet::new(),
            next_tx_id: 1,
            closed: false,
        })
    }

    /// Flush the log and mark the database closed. Idempotent; dropping
    /// an open `Database` calls this too.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.cache.flush_all()?;
        self.log.lock().close()?;
        self.closed = true;
        debug!("database closed");
        Ok(())
    }

    /// Begin a new transaction (spec §4.9 state machine: starts `ACTIVE`).
    /// No log record is written until its first act.
    pub fn begin(&mut self) -> TxId {
        let id = TxId::new(self.next_tx_id).expect("tx id counter stays within MAX_TX_ID for any realistic session");
        self.next_tx_id += 1;
        self.active.insert(id);
        id
    }

    fn require_active(&self, tx_id: TxId) -> Result<()> {
        if self.active.contains(&tx_id) {
            Ok(())
        } else {
            Err(KvError::client(format!("transaction {} is not active", tx_id.get())))
        }
    }

    fn tree_search(&mut self, key: &[u8]) -> Result<(Option<(Vec<u8>, Vec<u8>)>, Option<(Vec<u8>, Vec<u8>)>)> {
        self.engine.config().tree.search(&mut self.cache, key)
    }

    /// `get(key)` (spec §4.9): shared content lock, then an exact-match
    /// tree lookup.
    pub fn get(&mut self, tx_id: TxId, key: &[u8]) -> Result<TxOutcome<Option<Vec<u8>>>> {
        self.require_active(tx_id)?;
        if self.locks.acquire_get(tx_id, key) != AcquireOutcome::Granted {
            return Ok(TxOutcome::Blocked);
        }
        let (_, next) = self.tree_search(key)?;
        Ok(TxOutcome::Done(next.filter(|(k, _)| k == key).map(|(_, v)| v)))
    }

    /// `next(key_or_none)` (spec §4.9): smallest key strictly greater than
    /// `key` (or the smallest key in the tree if `key` is `None`). Locks
    /// the fence below the result plus the result's own content, and
    /// re-verifies both are still the true neighbours once granted —
    /// a concurrent transaction may have inserted between the initial
    /// search and the lock being granted, which moves the candidate
    /// fence and must be retried against the new neighbour.
    pub fn next(&mut self, tx_id: TxId, key: Option<&[u8]>) -> Result<TxOutcome<Option<(Vec<u8>, Vec<u8>)>>> {
        self.require_active(tx_id)?;
        let target = match key {
            Some(k) => {
                let mut v = k.to_vec();
                v.push(0);
                v
            }
            None => Vec::new(),
        };
        loop {
            let (prev, next) = self.tree_search(&target)?;
            let key_present = next.as_ref().is_some_and(|(k, _)| k == &target);
            let prev_key = prev.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            let next_key = next.as_ref().map(|(k, _)| k.clone());

            match self.locks.acquire_next(tx_id, key_present, &target, &prev_key, next_key.as_deref()) {
                AcquireOutcome::Blocked(_) => return Ok(TxOutcome::Blocked),
                AcquireOutcome::Granted => {}
            }
            if key_present {
                return Ok(TxOutcome::Done(next));
            }

            let (prev2, next2) = self.tree_search(&target)?;
            let prev_key2 = prev2.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            let next_key2 = next2.as_ref().map(|(k, _)| k.clone());
            if prev_key2 == prev_key && next_key2 == next_key {
                return Ok(TxOutcome::Done(next2));
            }
            self.locks.release_one(tx_id, &ResourceId::fence(prev_key));
            if let Some(nk) = next_key {
                self.locks.release_one(tx_id, &ResourceId::content(nk));
            }
        }
    }

    /// `find(key)` (spec §4.9): acquire both-sided fences around `key`
    /// and return the flanking pairs, re-verifying them the same way
    /// [`Self::next`] does.
    pub fn find(&mut self, tx_id: TxId, key: &[u8]) -> Result<TxOutcome<(Option<(Vec<u8>, Vec<u8>)>, Option<(Vec<u8>, Vec<u8>)>)>> {
        self.require_active(tx_id)?;
        loop {
            let (prev, next) = self.tree_search(key)?;
            let key_present = next.as_ref().is_some_and(|(k, _)| k.as_slice() == key);
            let prev_key = prev.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            let next_key = next.as_ref().map(|(k, _)| k.clone());

            if self.locks.acquire_next(tx_id, key_present, key, &prev_key, next_key.as_deref()) != AcquireOutcome::Granted {
                return Ok(TxOutcome::Blocked);
            }
            if self.locks.acquire_prev(tx_id, key, prev.as_ref().map(|(k, _)| k.as_slice())) != AcquireOutcome::Granted {
                return Ok(TxOutcome::Blocked);
            }

            let (prev2, next2) = self.tree_search(key)?;
            let prev_key2 = prev2.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            let next_key2 = next2.as_ref().map(|(k, _)| k.clone());
            if prev_key2 == prev_key && next_key2 == next_key {
                return Ok(TxOutcome::Done((prev2, next2)));
            }
            self.locks.release_one(tx_id, &ResourceId::fence(prev_key.clone()));
            self.locks.release_one(tx_id, &ResourceId::fence(key.to_vec()));
            if let Some(nk) = next_key {
                self.locks.release_one(tx_id, &ResourceId::content(nk));
            }
        }
    }

    /// `set(key, value)` (spec §4.9): exclusive content lock, plus (if
    /// `key` is new) an exclusive fence lock on its predecessor to block
    /// a concurrent phantom insert in the same gap. The fence candidate
    /// is re-verified after the lock is granted; if a concurrent insert
    /// moved it, the stale fence is released and the whole acquire is
    /// retried against the tree's current state.
    pub fn set(&mut self, tx_id: TxId, key: &[u8], value: &[u8]) -> Result<TxOutcome<()>> {
        self.require_active(tx_id)?;
        loop {
            let (prev, next) = self.tree_search(key)?;
            let key_exists = next.as_ref().is_some_and(|(k, _)| k.as_slice() == key);
            let prev_key = prev.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());

            match self.locks.acquire_set(tx_id, key, key_exists, &prev_key) {
                AcquireOutcome::Blocked(_) => return Ok(TxOutcome::Blocked),
                AcquireOutcome::Granted => {}
            }
            if key_exists {
                self.engine.do_act(&mut self.cache, tx_id, &SetEntryAct::Set { key: key.to_vec(), value: value.to_vec() })?;
                return Ok(TxOutcome::Done(()));
            }

            let (prev2, _) = self.tree_search(key)?;
            let prev_key2 = prev2.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            if prev_key2 == prev_key {
                self.engine.do_act(&mut self.cache, tx_id, &SetEntryAct::Set { key: key.to_vec(), value: value.to_vec() })?;
                return Ok(TxOutcome::Done(()));
            }
            self.locks.release_one(tx_id, &ResourceId::fence(prev_key));
        }
    }

    /// `delete(key)` (spec §4.9): a no-op if `key` is absent; otherwise
    /// exclusive content lock plus an exclusive fence lock on the
    /// predecessor (protecting the gap the deletion leaves behind),
    /// re-verified the same way [`Self::set`] does.
    pub fn delete(&mut self, tx_id: TxId, key: &[u8]) -> Result<TxOutcome<()>> {
        self.require_active(tx_id)?;
        loop {
            let (prev, next) = self.tree_search(key)?;
            let key_exists = next.as_ref().is_some_and(|(k, _)| k.as_slice() == key);
            let prev_key = prev.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());

            match self.locks.acquire_delete(tx_id, key, key_exists, &prev_key) {
                AcquireOutcome::Blocked(_) => return Ok(TxOutcome::Blocked),
                AcquireOutcome::Granted => {}
            }
            if !key_exists {
                return Ok(TxOutcome::Done(()));
            }

            let (prev2, next2) = self.tree_search(key)?;
            let still_exists = next2.as_ref().is_some_and(|(k, _)| k.as_slice() == key);
            let prev_key2 = prev2.as_ref().map_or_else(Vec::new, |(k, _)| k.clone());
            if still_exists && prev_key2 == prev_key {
                self.engine.do_act(&mut self.cache, tx_id, &SetEntryAct::Delete { key: key.to_vec() })?;
                return Ok(TxOutcome::Done(()));
            }
            self.locks.release_one(tx_id, &ResourceId::fence(prev_key));
            if !still_exists {
                return Ok(TxOutcome::Done(()));
            }
        }
    }

    /// `commit()` (spec §4.9): make the transaction's work durable,
    /// release every lock it holds, and close it out.
    pub fn commit(&mut self, tx_id: TxId) -> Result<()> {
        self.require_active(tx_id)?;
        self.engine.commit(tx_id)?;
        self.locks.release_all(tx_id);
        self.active.remove(&tx_id);
        Ok(())
    }

    /// `rollback()` (spec §4.9): undo the transaction's work, release its
    /// locks, and close it out.
    pub fn rollback(&mut self, tx_id: TxId) -> Result<()> {
        self.require_active(tx_id)?;
        self.engine.rollback(&mut self.cache, tx_id)?;
        self.locks.release_all(tx_id);
        self.active.remove(&tx_id);
        Ok(())
    }

    /// Abort a transaction unilaterally (spec §5: deadlock victim or lost
    /// connection). Equivalent to [`Self::rollback`] but tolerant of a
    /// transaction that never became active in the engine's own table.
    pub fn abort(&mut self, tx_id: TxId, reason: &str) -> Result<()> {
        debug!(tx = tx_id.get(), reason, "aborting transaction");
        self.rollback(tx_id)
    }

    /// Force a checkpoint now, independent of the auto-checkpoint
    /// threshold.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.engine.checkpoint(&mut self.cache)
    }

    /// Run one pass of deadlock detection, aborting every victim found
    /// and returning their ids (spec §5: "a periodic deadlock-detection
    /// task").
    pub fn break_deadlocks(&mut self) -> Result<Vec<TxId>> {
        let victims = self.locks.break_deadlocks();
        for &victim in &victims {
            if self.active.contains(&victim) {
                self.abort(victim, "deadlock detected")?;
            }
        }
        Ok(victims)
    }

    /// Resume a transaction blocked on a lock, if its wait precondition
    /// now holds (spec §5: the dispatcher "resumes any worker whose wait
    /// precondition may now be true").
    #[must_use]
    pub fn retry_lock(&mut self, tx_id: TxId) -> Option<AcquireOutcome> {
        self.locks.retry(tx_id)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "error closing database on drop");
        }
    }
}
