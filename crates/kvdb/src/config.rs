//! Database configuration: sizing knobs for the page cache, the log, and
//! the B+ tree, plus an optional `config.json` sidecar (spec §6.1 layout,
//! `kvdb-btree::BTreeConfig`).

use std::fs;
use std::path::Path;

use kvdb_btree::BTreeConfig;
use kvdb_error::Result;
use kvdb_types::Namespace;
use serde::{Deserialize, Serialize};

/// Reserved namespaces for a single-tree database. Namespace 0 is taken by
/// the record log itself (`kvdb_types::limits::LOG_NAMESPACE`).
pub const META_NAMESPACE: u8 = 1;
pub const LEAF_NAMESPACE: u8 = 2;
pub const BRANCH_NAMESPACE: u8 = 3;
pub const KV_NAMESPACE: u8 = 4;

const SIDECAR_FILE: &str = "config.json";

/// Knobs a [`crate::Database::open`] needs but the on-disk layout doesn't
/// carry on its own. Serializable so a database directory can pin its own
/// settings in a `config.json` sidecar, matching the teacher's pattern of
/// a small `serde`-backed settings struct next to the data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Page size used for both the record log and every data namespace.
    pub page_size: u32,
    /// Page-cache capacity, in pages.
    pub cache_capacity: usize,
    /// Checkpoint automatically once the log has grown this many LSN
    /// units since the last one (spec §4.6).
    pub auto_checkpoint_bytes: u64,
    /// If set, a checkpoint also flushes and evicts dirty pages older
    /// than `end - flush_limit_size` (spec §4.6 `flushLimitSize`).
    pub flush_limit_size: Option<u64>,
    /// Page capacity (in entries) of the record-allocator pages backing
    /// key/value VID overflow chains.
    pub kv_page_capacity: usize,

    /// Upper bound on an inline VID's encoded length before it chains
    /// through the record allocator.
    pub max_vid_len: usize,
    /// Payload bytes per VID continuation chunk.
    pub vid_chunk_size: usize,
    /// Usable bytes on a leaf page before a split is required.
    pub leaf_page_capacity: usize,
    /// Usable bytes on a branch page before a split is required.
    pub branch_page_capacity: usize,
    /// A leaf below this wire size must steal or merge.
    pub leaf_min_used_space: usize,
    /// A branch below this wire size must steal or merge.
    pub branch_min_used_space: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 4096,
            cache_capacity: 1024,
            auto_checkpoint_bytes: 1 << 20,
            flush_limit_size: None,
            kv_page_capacity: 256,
            max_vid_len: 24,
            vid_chunk_size: 1024,
            leaf_page_capacity: 3600,
            branch_page_capacity: 3600,
            leaf_min_used_space: 900,
            branch_min_used_space: 900,
        }
    }
}

impl Config {
    pub(crate) fn meta_ns(&self) -> Namespace {
        Namespace::from(META_NAMESPACE)
    }

    pub(crate) fn leaf_ns(&self) -> Namespace {
        Namespace::from(LEAF_NAMESPACE)
    }

    pub(crate) fn branch_ns(&self) -> Namespace {
        Namespace::from(BRANCH_NAMESPACE)
    }

    pub(crate) fn kv_ns(&self) -> Namespace {
        Namespace::from(KV_NAMESPACE)
    }

    pub(crate) fn btree_config(&self) -> BTreeConfig {
        BTreeConfig {
            max_vid_len: self.max_vid_len,
            vid_chunk_size: self.vid_chunk_size,
            leaf_page_capacity: self.leaf_page_capacity,
            branch_page_capacity: self.branch_page_capacity,
            leaf_min_used_space: self.leaf_min_used_space,
            branch_min_used_space: self.branch_min_used_space,
        }
    }

    /// Load `config.json` from `root` if present, else fall back to
    /// [`Config::default`].
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join(SIDECAR_FILE);
        if !path.exists() {
            return Ok(Config::default());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| kvdb_error::KvError::corrupt(format!("malformed {SIDECAR_FILE}: {e}")))
    }

    /// Write this configuration as `root/config.json`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).expect("Config serializes infallibly");
        fs::write(root.join(SIDECAR_FILE), bytes)?;
        Ok(())
    }
}
