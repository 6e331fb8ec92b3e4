//! Ordered B+ tree over VID-keyed leaves (C7, spec §4.7): `search`,
//! `insert`, `delete`, leaf/branch split and merge/steal rebalancing,
//! and root-height tracking.

pub mod ops;

use std::cmp::Ordering;

use kvdb_alloc::{vid_chain, PageAllocator, RecordAllocator};
use kvdb_error::{KvError, Result};
use kvdb_pager::objects::{BranchEvent, BranchNode, ConfigEvent, LeafEvent, LeafNode, PageEvent, PageKind, PageObj};
use kvdb_pager::PageCache;
use kvdb_types::{Namespace, PageId, PageNo, Vid};
use rand::Rng;
use tracing::trace;

/// Sizing knobs a tree needs but does not own: VID inline/chunk budgets
/// and the page-capacity/underflow thresholds that drive split and
/// merge decisions. Constructed by the caller (`kvdb::Config`) from the
/// database's configured page size.
#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Upper bound on an inline VID's encoded length before it must
    /// chain through the record allocator.
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

/// `ConfigPage` keys on the root-pointer meta page.
const ROOT_HEIGHT_KEY: u8 = 0;
const ROOT_PAGE_KEY: u8 = 1;

/// An ordered B+ tree. Leaves and branches live in their own namespaces
/// (spec §4.7/§3: "each node lives in its own namespace"); a small
/// bookkeeping namespace holds the root pointer and the two node-page
/// allocators' counters.
pub struct BTree {
    leaf_ns: Namespace,
    branch_ns: Namespace,
    root_meta: PageId,
    leaf_alloc: PageAllocator,
    branch_alloc: PageAllocator,
    kv_alloc: RecordAllocator,
    config: BTreeConfig,
}

struct Frame {
    page_no: PageNo,
    child_idx: usize,
}

impl BTree {
    /// Open a tree whose bookkeeping lives in `meta_ns`: page 0 holds the
    /// root pointer, page 1 the leaf page allocator's counter, page 2 the
    /// branch page allocator's counter. `kv_ns` is a record namespace
    /// (opened separately by the caller via [`RecordAllocator::open`])
    /// shared by key/value VID overflow chains.
    pub fn open(
        cache: &mut PageCache,
        meta_ns: Namespace,
        leaf_ns: Namespace,
        branch_ns: Namespace,
        kv_ns: Namespace,
        kv_page_capacity: usize,
        config: BTreeConfig,
    ) -> Result<Self> {
        let root_meta = PageId::new(meta_ns, PageNo::new(0)?);
        cache.pin(root_meta, PageKind::Config)?;
        cache.unpin(root_meta);

        let leaf_meta = PageId::new(meta_ns, PageNo::new(1)?);
        let leaf_alloc = PageAllocator::open(cache, leaf_meta, PageKind::Leaf, 1)?;
        let branch_meta = PageId::new(meta_ns, PageNo::new(2)?);
        let branch_alloc = PageAllocator::open(cache, branch_meta, PageKind::Branch, 0)?;
        let kv_alloc = RecordAllocator::open(cache, kv_ns, kv_page_capacity)?;

        Ok(BTree {
            leaf_ns,
            branch_ns,
            root_meta,
            leaf_alloc,
            branch_alloc,
            kv_alloc,
            config,
        })
    }

    fn root(&self, cache: &mut PageCache) -> Result<(u8, PageNo)> {
        cache.pin(self.root_meta, PageKind::Config)?;
        let result = {
            let page = cache.page(self.root_meta).expect("just pinned");
            let PageObj::Config(cfg) = page.obj() else {
                return Err(KvError::corrupt("root meta page is not a config page"));
            };
            let height = cfg.entries.get(&ROOT_HEIGHT_KEY).map(|b| b[0]).unwrap_or(0);
            let page_no = cfg
                .entries
                .get(&ROOT_PAGE_KEY)
                .map(|b| {
                    let mut full = [0u8; 8];
                    full[0..6].copy_from_slice(&b[0..6]);
                    u64::from_le_bytes(full)
                })
                .unwrap_or(0);
            (height, PageNo::new(page_no)?)
        };
        cache.unpin(self.root_meta);
        Ok(result)
    }

    fn set_root(&self, cache: &mut PageCache, height: u8, page_no: PageNo) -> Result<()> {
        cache.do_event(
            self.root_meta,
            PageKind::Config,
            &PageEvent::Config(ConfigEvent::SetValue {
                key: ROOT_HEIGHT_KEY,
                bytes: vec![height],
            }),
        )?;
        let full = page_no.get().to_le_bytes();
        cache.do_event(
            self.root_meta,
            PageKind::Config,
            &PageEvent::Config(ConfigEvent::SetValue {
                key: ROOT_PAGE_KEY,
                bytes: full[0..6].to_vec(),
            }),
        )?;
        Ok(())
    }

    fn leaf_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.leaf_ns, page_no)
    }

    fn branch_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.branch_ns, page_no)
    }

    fn read_leaf(&self, cache: &mut PageCache, page_no: PageNo) -> Result<LeafNode> {
        let id = self.leaf_id(page_no);
        cache.pin(id, PageKind::Leaf)?;
        let leaf = {
            let page = cache.page(id).expect("just pinned");
            let PageObj::Leaf(l) = page.obj() else {
                return Err(KvError::corrupt("expected a leaf page"));
            };
            l.clone()
        };
        cache.unpin(id);
        Ok(leaf)
    }

    fn read_branch(&self, cache: &mut PageCache, page_no: PageNo) -> Result<BranchNode> {
        let id = self.branch_id(page_no);
        cache.pin(id, PageKind::Branch)?;
        let branch = {
            let page = cache.page(id).expect("just pinned");
            let PageObj::Branch(b) = page.obj() else {
                return Err(KvError::corrupt("expected a branch page"));
            };
            b.clone()
        };
        cache.unpin(id);
        Ok(branch)
    }

    /// `flank_index` wants `key.cmp(target)`; `vid_chain::cmp` gives back
    /// `target.cmp(key)`, so flip it here rather than at every call site.
    fn key_cmp(&self, cache: &mut PageCache, target: &[u8], vid: &Vid) -> Result<Ordering> {
        vid_chain::cmp(cache, &self.kv_alloc, target, vid, self.config.vid_chunk_size).map(Ordering::reverse)
    }

    fn store_vid(&mut self, cache: &mut PageCache, bytes: &[u8], rng: &mut impl Rng) -> Result<Vid> {
        vid_chain::store(cache, &mut self.kv_alloc, bytes, self.config.max_vid_len, self.config.vid_chunk_size, rng)
    }

    fn read_vid(&self, cache: &mut PageCache, vid: &Vid) -> Result<Vec<u8>> {
        vid_chain::read(cache, &self.kv_alloc, vid, self.config.vid_chunk_size)
    }

    fn free_vid(&mut self, cache: &mut PageCache, vid: &Vid) -> Result<()> {
        vid_chain::free(cache, &mut self.kv_alloc, vid, self.config.vid_chunk_size)
    }

    /// Descend from the root to the leaf that would hold `target`,
    /// recording the branch path taken.
    fn descend(&self, cache: &mut PageCache, target: &[u8]) -> Result<(Vec<Frame>, PageNo)> {
        let (mut height, mut page_no) = self.root(cache)?;
        let mut path = Vec::new();
        while height > 0 {
            let branch = self.read_branch(cache, page_no)?;
            let (i_low, _) = ops::flank_index(branch.separators.len(), &mut |i| self.key_cmp(cache, target, &branch.separators[i]))?;
            let child_idx = i_low + 1;
            path.push(Frame { page_no, child_idx });
            page_no = branch.children[child_idx];
            height -= 1;
        }
        Ok((path, page_no))
    }

    /// `search(key)` (spec §4.7): returns `(prev, next)` such that
    /// `prev.key < key <= next.key`, resolving across leaf boundaries
    /// when the match falls at the edge of a leaf's entries.
    pub fn search(&self, cache: &mut PageCache, target: &[u8]) -> Result<(Option<(Vec<u8>, Vec<u8>)>, Option<(Vec<u8>, Vec<u8>)>)> {
        let (_, leaf_page) = self.descend(cache, target)?;
        let leaf = self.read_leaf(cache, leaf_page)?;
        let (i_low, i_high) = ops::flank_index(leaf.keys.len(), &mut |i| self.key_cmp(cache, target, &leaf.keys[i]))?;

        let prev = if i_low > 0 {
            Some(self.materialize(cache, &leaf.keys[i_low - 1], &leaf.vals[i_low - 1])?)
        } else if let Some(prev_page) = leaf.prev {
            let prev_leaf = self.read_leaf(cache, prev_page)?;
            prev_leaf
                .keys
                .last()
                .zip(prev_leaf.vals.last())
                .map(|(k, v)| self.materialize(cache, k, v))
                .transpose()?
        } else {
            None
        };

        let next = if i_high < leaf.keys.len() {
            Some(self.materialize(cache, &leaf.keys[i_high], &leaf.vals[i_high])?)
        } else if let Some(next_page) = leaf.next {
            let next_leaf = self.read_leaf(cache, next_page)?;
            next_leaf
                .keys
                .first()
                .zip(next_leaf.vals.first())
                .map(|(k, v)| self.materialize(cache, k, v))
                .transpose()?
        } else {
            None
        };

        Ok((prev, next))
    }

    fn materialize(&self, cache: &mut PageCache, key: &Vid, val: &Vid) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.read_vid(cache, key)?, self.read_vid(cache, val)?))
    }

    /// `insert(key, value)` (spec §4.7): overwrites the value if `key`
    /// already exists, else inserts a new entry, splitting leaves (and
    /// propagating splits up through branches, growing the root if
    /// necessary) as pages overflow.
    pub fn insert(&mut self, cache: &mut PageCache, key: &[u8], value: &[u8], rng: &mut impl Rng) -> Result<()> {
        let (path, leaf_page) = self.descend(cache, key)?;
        let mut leaf = self.read_leaf(cache, leaf_page)?;
        let (i_low, i_high) = ops::flank_index(leaf.keys.len(), &mut |i| self.key_cmp(cache, key, &leaf.keys[i]))?;

        if i_high == i_low + 1 {
            let old_val = leaf.vals[i_low].clone();
            self.free_vid(cache, &old_val)?;
            let new_val = self.store_vid(cache, value, rng)?;
            cache.do_event(self.leaf_id(leaf_page), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::SetValue { idx: i_low, val: new_val.clone() }))?;
            leaf.vals[i_low] = new_val;
        } else {
            let key_vid = self.store_vid(cache, key, rng)?;
            let val_vid = self.store_vid(cache, value, rng)?;
            cache.do_event(
                self.leaf_id(leaf_page),
                PageKind::Leaf,
                &PageEvent::Leaf(LeafEvent::InsertEntry { idx: i_high, key: key_vid.clone(), val: val_vid.clone() }),
            )?;
            leaf.keys.insert(i_high, key_vid);
            leaf.vals.insert(i_high, val_vid);
        }

        if leaf.wire_len() > self.config.leaf_page_capacity {
            self.split_leaf(cache, path, leaf_page, leaf, rng)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, cache: &mut PageCache, mut path: Vec<Frame>, page_no: PageNo, leaf: LeafNode, rng: &mut impl Rng) -> Result<()> {
        let split_at = ops::leaf_split_index(&leaf.keys, &leaf.vals);
        let left_keys = leaf.keys[..split_at].to_vec();
        let left_vals = leaf.vals[..split_at].to_vec();
        let right_keys = leaf.keys[split_at..].to_vec();
        let right_vals = leaf.vals[split_at..].to_vec();

        let last_left = self.read_vid(cache, left_keys.last().expect("non-empty left half"))?;
        let first_right = self.read_vid(cache, right_keys.first().expect("non-empty right half"))?;
        let sep_bytes = ops::shortest_separator(&last_left, &first_right);
        let sep_vid = self.store_vid(cache, &sep_bytes, rng)?;

        let new_page = self.leaf_alloc.alloc(cache, self.leaf_ns, rng)?.page_no;
        cache.do_event(
            self.leaf_id(new_page),
            PageKind::Leaf,
            &PageEvent::Leaf(LeafEvent::ReplaceAll {
                prev: Some(page_no),
                next: leaf.next,
                keys: right_keys,
                vals: right_vals,
            }),
        )?;
        if let Some(old_next) = leaf.next {
            let old_next_leaf = self.read_leaf(cache, old_next)?;
            cache.do_event(
                self.leaf_id(old_next),
                PageKind::Leaf,
                &PageEvent::Leaf(LeafEvent::SetLinks { prev: Some(new_page), next: old_next_leaf.next }),
            )?;
        }
        cache.do_event(
            self.leaf_id(page_no),
            PageKind::Leaf,
            &PageEvent::Leaf(LeafEvent::ReplaceAll {
                prev: leaf.prev,
                next: Some(new_page),
                keys: left_keys,
                vals: left_vals,
            }),
        )?;
        trace!(left = %page_no, right = %new_page, "leaf split");

        match path.pop() {
            None => self.new_root(cache, 1, page_no, new_page, sep_vid, rng),
            Some(frame) => self.insert_child(cache, path, frame, new_page, sep_vid, rng),
        }
    }

    fn new_root(&mut self, cache: &mut PageCache, height: u8, left: PageNo, right: PageNo, sep: Vid, rng: &mut impl Rng) -> Result<()> {
        let new_page = self.branch_alloc.alloc(cache, self.branch_ns, rng)?.page_no;
        cache.do_event(
            self.branch_id(new_page),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll {
                height,
                children: vec![left, right],
                separators: vec![sep],
            }),
        )?;
        self.set_root(cache, height, new_page)?;
        trace!(page = %new_page, height, "btree grew a new root");
        Ok(())
    }

    fn insert_child(&mut self, cache: &mut PageCache, path: Vec<Frame>, frame: Frame, new_child: PageNo, sep: Vid, rng: &mut impl Rng) -> Result<()> {
        let mut branch = self.read_branch(cache, frame.page_no)?;
        let child_idx = frame.child_idx;
        cache.do_event(
            self.branch_id(frame.page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::InsertChild { child_idx: child_idx + 1, sep_idx: child_idx, child: new_child, sep: sep.clone() }),
        )?;
        branch.children.insert(child_idx + 1, new_child);
        branch.separators.insert(child_idx, sep);

        if branch.wire_len() <= self.config.branch_page_capacity {
            return Ok(());
        }
        self.split_branch(cache, path, frame.page_no, branch, rng)
    }

    fn split_branch(&mut self, cache: &mut PageCache, path: Vec<Frame>, page_no: PageNo, branch: BranchNode, rng: &mut impl Rng) -> Result<()> {
        let split_at = ops::branch_split_index(&branch.children, &branch.separators);
        let sep = branch.separators[split_at].clone();

        let left_children = branch.children[..=split_at].to_vec();
        let left_separators = branch.separators[..split_at].to_vec();
        let right_children = branch.children[split_at + 1..].to_vec();
        let right_separators = branch.separators[split_at + 1..].to_vec();

        let new_page = self.branch_alloc.alloc(cache, self.branch_ns, rng)?.page_no;
        cache.do_event(
            self.branch_id(new_page),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: branch.height, children: right_children, separators: right_separators }),
        )?;
        cache.do_event(
            self.branch_id(page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: branch.height, children: left_children, separators: left_separators }),
        )?;
        trace!(left = %page_no, right = %new_page, "branch split");

        let mut path = path;
        match path.pop() {
            None => self.new_root(cache, branch.height + 1, page_no, new_page, sep, rng),
            Some(frame) => self.insert_child(cache, path, frame, new_page, sep, rng),
        }
    }

    /// `delete(key)` (spec §4.7): a no-op if `key` is absent; otherwise
    /// removes the entry and frees its value, rebalancing leaves (and
    /// propagating through branches, collapsing the root if it ends up
    /// with a single child) on underflow.
    pub fn delete(&mut self, cache: &mut PageCache, key: &[u8]) -> Result<()> {
        let (path, leaf_page) = self.descend(cache, key)?;
        let mut leaf = self.read_leaf(cache, leaf_page)?;
        let (i_low, i_high) = ops::flank_index(leaf.keys.len(), &mut |i| self.key_cmp(cache, key, &leaf.keys[i]))?;
        if i_high != i_low + 1 {
            return Ok(());
        }

        let old_val = leaf.vals[i_low].clone();
        self.free_vid(cache, &old_val)?;
        cache.do_event(self.leaf_id(leaf_page), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::RemoveEntry { idx: i_low }))?;
        leaf.keys.remove(i_low);
        leaf.vals.remove(i_low);

        if leaf.wire_len() >= self.config.leaf_min_used_space || path.is_empty() {
            return Ok(());
        }
        self.rebalance_leaf(cache, path, leaf_page, leaf)
    }

    fn rebalance_leaf(&mut self, cache: &mut PageCache, mut path: Vec<Frame>, page_no: PageNo, mut leaf: LeafNode) -> Result<()> {
        let frame = path.pop().expect("leaf underflow only rebalances under a parent branch");
        let parent = self.read_branch(cache, frame.page_no)?;

        if frame.child_idx > 0 {
            let left_no = parent.children[frame.child_idx - 1];
            let mut left = self.read_leaf(cache, left_no)?;
            if !left.keys.is_empty() && left.wire_len() - left.keys.last().unwrap().wire_len() - left.vals.last().unwrap().wire_len() >= self.config.leaf_min_used_space {
                let key = left.keys.pop().unwrap();
                let val = left.vals.pop().unwrap();
                cache.do_event(self.leaf_id(left_no), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::RemoveEntry { idx: left.keys.len() }))?;
                cache.do_event(
                    self.leaf_id(page_no),
                    PageKind::Leaf,
                    &PageEvent::Leaf(LeafEvent::InsertEntry { idx: 0, key: key.clone(), val: val.clone() }),
                )?;
                leaf.keys.insert(0, key.clone());
                leaf.vals.insert(0, val);
                let sep_idx = frame.child_idx - 1;
                cache.do_event(
                    self.branch_id(frame.page_no),
                    PageKind::Branch,
                    &PageEvent::Branch(BranchEvent::ReplaceAll {
                        height: parent.height,
                        children: parent.children.clone(),
                        separators: replace_at(&parent.separators, sep_idx, key),
                    }),
                )?;
                trace!(from = %left_no, to = %page_no, "leaf stole from left sibling");
                return Ok(());
            }
        }

        if frame.child_idx + 1 < parent.children.len() {
            let right_no = parent.children[frame.child_idx + 1];
            let mut right = self.read_leaf(cache, right_no)?;
            if !right.keys.is_empty() && right.wire_len() - right.keys.first().unwrap().wire_len() - right.vals.first().unwrap().wire_len() >= self.config.leaf_min_used_space {
                let key = right.keys.remove(0);
                let val = right.vals.remove(0);
                let new_sep = right.keys.first().cloned().unwrap_or_else(|| key.clone());
                cache.do_event(self.leaf_id(right_no), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::RemoveEntry { idx: 0 }))?;
                cache.do_event(
                    self.leaf_id(page_no),
                    PageKind::Leaf,
                    &PageEvent::Leaf(LeafEvent::InsertEntry { idx: leaf.keys.len(), key: key.clone(), val: val.clone() }),
                )?;
                leaf.keys.push(key);
                leaf.vals.push(val);
                let sep_idx = frame.child_idx;
                cache.do_event(
                    self.branch_id(frame.page_no),
                    PageKind::Branch,
                    &PageEvent::Branch(BranchEvent::ReplaceAll {
                        height: parent.height,
                        children: parent.children.clone(),
                        separators: replace_at(&parent.separators, sep_idx, new_sep),
                    }),
                )?;
                trace!(from = %right_no, to = %page_no, "leaf stole from right sibling");
                return Ok(());
            }
        }

        if frame.child_idx > 0 {
            let left_no = parent.children[frame.child_idx - 1];
            return self.merge_leaves(cache, path, frame, left_no, page_no);
        }
        let right_no = parent.children[frame.child_idx + 1];
        self.merge_leaves(cache, path, frame, page_no, right_no)
    }

    fn merge_leaves(&mut self, cache: &mut PageCache, path: Vec<Frame>, frame: Frame, left_no: PageNo, right_no: PageNo) -> Result<()> {
        let left = self.read_leaf(cache, left_no)?;
        let right = self.read_leaf(cache, right_no)?;
        let mut keys = left.keys;
        keys.extend(right.keys);
        let mut vals = left.vals;
        vals.extend(right.vals);

        cache.do_event(
            self.leaf_id(left_no),
            PageKind::Leaf,
            &PageEvent::Leaf(LeafEvent::ReplaceAll { prev: left.prev, next: right.next, keys, vals }),
        )?;
        if let Some(next) = right.next {
            let next_leaf = self.read_leaf(cache, next)?;
            cache.do_event(self.leaf_id(next), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::SetLinks { prev: Some(left_no), next: next_leaf.next }))?;
        }
        cache.do_event(self.leaf_id(right_no), PageKind::Leaf, &PageEvent::Leaf(LeafEvent::ReplaceAll { prev: None, next: None, keys: vec![], vals: vec![] }))?;
        self.leaf_alloc.free_unused_pages(cache, self.leaf_ns, right_no)?;
        trace!(survivor = %left_no, removed = %right_no, "leaves merged");

        let removed_idx = frame.child_idx.max(1);
        self.remove_child(cache, path, frame.page_no, removed_idx)
    }

    fn remove_child(&mut self, cache: &mut PageCache, mut path: Vec<Frame>, branch_page: PageNo, removed_child_idx: usize) -> Result<()> {
        let mut branch = self.read_branch(cache, branch_page)?;
        let sep_idx = removed_child_idx - 1;
        cache.do_event(
            self.branch_id(branch_page),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::RemoveChild { child_idx: removed_child_idx, sep_idx }),
        )?;
        branch.children.remove(removed_child_idx);
        branch.separators.remove(sep_idx);

        if branch.children.len() == 1 {
            let only_child = branch.children[0];
            let (root_height, root_page) = self.root(cache)?;
            if root_page == branch_page {
                self.set_root(cache, root_height.saturating_sub(1), only_child)?;
                cache.do_event(
                    self.branch_id(branch_page),
                    PageKind::Branch,
                    &PageEvent::Branch(BranchEvent::ReplaceAll { height: 0, children: vec![], separators: vec![] }),
                )?;
                self.branch_alloc.free_unused_pages(cache, self.branch_ns, branch_page)?;
                trace!(old_root = %branch_page, new_root = %only_child, "root collapsed");
                return Ok(());
            }
        }

        if branch.wire_len() >= self.config.branch_min_used_space || path.is_empty() {
            return Ok(());
        }
        self.rebalance_branch(cache, path, branch_page, branch)
    }

    fn rebalance_branch(&mut self, cache: &mut PageCache, mut path: Vec<Frame>, page_no: PageNo, branch: BranchNode) -> Result<()> {
        let frame = path.pop().expect("branch underflow only rebalances under a parent");
        let parent = self.read_branch(cache, frame.page_no)?;

        if frame.child_idx > 0 {
            let left_no = parent.children[frame.child_idx - 1];
            let left = self.read_branch(cache, left_no)?;
            if left.separators.len() >= 2 {
                return self.steal_branch_left(cache, frame, left_no, left, page_no, branch, parent);
            }
        }
        if frame.child_idx + 1 < parent.children.len() {
            let right_no = parent.children[frame.child_idx + 1];
            let right = self.read_branch(cache, right_no)?;
            if right.separators.len() >= 2 {
                return self.steal_branch_right(cache, frame, page_no, branch, right_no, right, parent);
            }
        }

        if frame.child_idx > 0 {
            let left_no = parent.children[frame.child_idx - 1];
            return self.merge_branches(cache, path, frame, left_no, page_no);
        }
        let right_no = parent.children[frame.child_idx + 1];
        self.merge_branches(cache, path, frame, page_no, right_no)
    }

    /// Rotate a branch's surplus last child/separator into `page_no`
    /// through the parent separator at `frame.child_idx - 1`.
    fn steal_branch_left(
        &mut self,
        cache: &mut PageCache,
        frame: Frame,
        left_no: PageNo,
        mut left: BranchNode,
        page_no: PageNo,
        mut branch: BranchNode,
        parent: BranchNode,
    ) -> Result<()> {
        let moved_child = left.children.pop().expect("left has >= 2 children");
        let promoted_sep = left.separators.pop().expect("left has >= 2 separators");
        let sep_idx = frame.child_idx - 1;
        let down_sep = parent.separators[sep_idx].clone();

        cache.do_event(
            self.branch_id(left_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: left.height, children: left.children, separators: left.separators }),
        )?;
        branch.children.insert(0, moved_child);
        branch.separators.insert(0, down_sep);
        cache.do_event(
            self.branch_id(page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: branch.height, children: branch.children, separators: branch.separators }),
        )?;
        cache.do_event(
            self.branch_id(frame.page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll {
                height: parent.height,
                children: parent.children.clone(),
                separators: replace_at(&parent.separators, sep_idx, promoted_sep),
            }),
        )?;
        trace!(from = %left_no, to = %page_no, "branch stole from left sibling");
        Ok(())
    }

    /// Rotate a branch's surplus first child/separator into `page_no`
    /// through the parent separator at `frame.child_idx`.
    fn steal_branch_right(
        &mut self,
        cache: &mut PageCache,
        frame: Frame,
        page_no: PageNo,
        mut branch: BranchNode,
        right_no: PageNo,
        mut right: BranchNode,
        parent: BranchNode,
    ) -> Result<()> {
        let moved_child = right.children.remove(0);
        let promoted_sep = right.separators.remove(0);
        let sep_idx = frame.child_idx;
        let down_sep = parent.separators[sep_idx].clone();

        branch.children.push(moved_child);
        branch.separators.push(down_sep);
        cache.do_event(
            self.branch_id(page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: branch.height, children: branch.children, separators: branch.separators }),
        )?;
        cache.do_event(
            self.branch_id(right_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: right.height, children: right.children, separators: right.separators }),
        )?;
        cache.do_event(
            self.branch_id(frame.page_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll {
                height: parent.height,
                children: parent.children.clone(),
                separators: replace_at(&parent.separators, sep_idx, promoted_sep),
            }),
        )?;
        trace!(from = %right_no, to = %page_no, "branch stole from right sibling");
        Ok(())
    }

    fn merge_branches(&mut self, cache: &mut PageCache, path: Vec<Frame>, frame: Frame, left_no: PageNo, right_no: PageNo) -> Result<()> {
        let parent = self.read_branch(cache, frame.page_no)?;
        let left = self.read_branch(cache, left_no)?;
        let right = self.read_branch(cache, right_no)?;
        let pulled_sep_idx = parent
            .children
            .iter()
            .position(|&c| c == left_no)
            .expect("left_no is a child of its own parent");
        let pulled_sep = parent.separators[pulled_sep_idx].clone();

        let mut children = left.children;
        children.extend(right.children);
        let mut separators = left.separators;
        separators.push(pulled_sep);
        separators.extend(right.separators);

        cache.do_event(
            self.branch_id(left_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: left.height, children, separators }),
        )?;
        cache.do_event(
            self.branch_id(right_no),
            PageKind::Branch,
            &PageEvent::Branch(BranchEvent::ReplaceAll { height: 0, children: vec![], separators: vec![] }),
        )?;
        self.branch_alloc.free_unused_pages(cache, self.branch_ns, right_no)?;
        trace!(survivor = %left_no, removed = %right_no, "branches merged");

        let removed_idx = pulled_sep_idx + 1;
        self.remove_child(cache, path, frame.page_no, removed_idx)
    }
}

fn replace_at(v: &[Vid], idx: usize, new: Vid) -> Vec<Vid> {
    let mut out = v.to_vec();
    out[idx] = new;
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kvdb_log::RecordLog;
    use kvdb_pagestore::{DirPageStore, PageStore};
    use kvdb_types::Lsn;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn new_cache(dir: &std::path::Path) -> PageCache {
        let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
        PageCache::new(store, log, 128)
    }

    fn small_config() -> BTreeConfig {
        BTreeConfig {
            max_vid_len: 24,
            vid_chunk_size: 32,
            leaf_page_capacity: 80,
            branch_page_capacity: 80,
            leaf_min_used_space: 10,
            branch_min_used_space: 10,
        }
    }

    fn new_tree(cache: &mut PageCache) -> BTree {
        BTree::open(cache, Namespace::from(10), Namespace::from(11), Namespace::from(12), Namespace::from(13), 200, small_config()).unwrap()
    }

    #[test]
    fn insert_then_search_finds_exact_and_flanks() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let mut tree = new_tree(&mut cache);
        let mut rng = StdRng::seed_from_u64(1);

        cache.begin_act();
        tree.insert(&mut cache, b"b", b"2", &mut rng).unwrap();
        tree.insert(&mut cache, b"d", b"4", &mut rng).unwrap();
        cache.end_act(Lsn::new(1).unwrap());

        let (prev, next) = tree.search(&mut cache, b"c").unwrap();
        assert_eq!(prev, Some((b"b".to_vec(), b"2".to_vec())));
        assert_eq!(next, Some((b"d".to_vec(), b"4".to_vec())));

        let (prev, next) = tree.search(&mut cache, b"d").unwrap();
        assert_eq!(prev, Some((b"b".to_vec(), b"2".to_vec())));
        assert_eq!(next, Some((b"d".to_vec(), b"4".to_vec())));
    }

    #[test]
    fn many_inserts_force_a_split_and_stay_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let mut tree = new_tree(&mut cache);
        let mut rng = StdRng::seed_from_u64(2);

        cache.begin_act();
        for i in 0..40u32 {
            let key = format!("key{i:04}");
            let val = format!("val{i:04}");
            tree.insert(&mut cache, key.as_bytes(), val.as_bytes(), &mut rng).unwrap();
        }
        cache.end_act(Lsn::new(1).unwrap());

        for i in 0..40u32 {
            let key = format!("key{i:04}");
            let (_, next) = tree.search(&mut cache, key.as_bytes()).unwrap();
            assert_eq!(next.unwrap().0, key.as_bytes());
        }
    }

    #[test]
    fn insert_overwrite_then_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let mut tree = new_tree(&mut cache);
        let mut rng = StdRng::seed_from_u64(3);

        cache.begin_act();
        tree.insert(&mut cache, b"k", b"v1", &mut rng).unwrap();
        tree.insert(&mut cache, b"k", b"v2", &mut rng).unwrap();
        cache.end_act(Lsn::new(1).unwrap());
        let (_, next) = tree.search(&mut cache, b"k").unwrap();
        assert_eq!(next.unwrap().1, b"v2");

        cache.begin_act();
        tree.delete(&mut cache, b"k").unwrap();
        cache.end_act(Lsn::new(2).unwrap());
        let (_, next) = tree.search(&mut cache, b"k").unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn delete_of_missing_key_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let mut tree = new_tree(&mut cache);

        cache.begin_act();
        tree.delete(&mut cache, b"absent").unwrap();
        cache.end_act(Lsn::new(1).unwrap());
    }

    #[test]
    fn many_inserts_then_deletes_drain_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(dir.path());
        let mut tree = new_tree(&mut cache);
        let mut rng = StdRng::seed_from_u64(4);

        cache.begin_act();
        for i in 0..40u32 {
            let key = format!("key{i:04}");
            tree.insert(&mut cache, key.as_bytes(), b"v", &mut rng).unwrap();
        }
        cache.end_act(Lsn::new(1).unwrap());

        cache.begin_act();
        for i in 0..40u32 {
            let key = format!("key{i:04}");
            tree.delete(&mut cache, key.as_bytes()).unwrap();
        }
        cache.end_act(Lsn::new(2).unwrap());

        for i in 0..40u32 {
            let key = format!("key{i:04}");
            let (_, next) = tree.search(&mut cache, key.as_bytes()).unwrap();
            assert!(next.is_none() || next.unwrap().0 != key.as_bytes());
        }
    }
}

#[cfg(test)]
mod proptests {
    use std::sync::Arc;

    use kvdb_log::RecordLog;
    use kvdb_pagestore::{DirPageStore, PageStore};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn new_cache(dir: &std::path::Path) -> PageCache {
        let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
        let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
        PageCache::new(store, log, 128)
    }

    fn small_config() -> BTreeConfig {
        BTreeConfig {
            max_vid_len: 24,
            vid_chunk_size: 32,
            leaf_page_capacity: 80,
            branch_page_capacity: 80,
            leaf_min_used_space: 10,
            branch_min_used_space: 10,
        }
    }

    fn new_tree(cache: &mut PageCache) -> BTree {
        BTree::open(cache, Namespace::from(10), Namespace::from(11), Namespace::from(12), Namespace::from(13), 200, small_config()).unwrap()
    }

    fn key_bytes(n: u16) -> Vec<u8> {
        format!("key{n:05}").into_bytes()
    }

    /// Walk every entry front-to-back via `search`'s next-key trick (the
    /// same NUL-suffix target `kvdb::Database::next` uses), returning the
    /// keys in tree order.
    fn walk_all(cache: &mut PageCache, tree: &BTree) -> Vec<Vec<u8>> {
        let mut cursor: Option<Vec<u8>> = None;
        let mut out = Vec::new();
        loop {
            let target = cursor.as_ref().map_or_else(Vec::new, |c| {
                let mut v = c.clone();
                v.push(0);
                v
            });
            let (_, next) = tree.search(cache, &target).unwrap();
            let Some((k, _)) = next else { break };
            cursor = Some(k.clone());
            out.push(k);
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Whatever order keys are inserted in, the tree always reports
        /// them back in sorted order (spec §4.7 ordering invariant), and
        /// every inserted key is findable with its value intact.
        #[test]
        fn insert_any_order_yields_sorted_tree(keys in prop::collection::hash_set(0u16..500, 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let mut cache = new_cache(dir.path());
            let mut tree = new_tree(&mut cache);
            let mut rng = StdRng::seed_from_u64(7);

            let keys: Vec<u16> = keys.into_iter().collect();
            cache.begin_act();
            for &k in &keys {
                let kb = key_bytes(k);
                tree.insert(&mut cache, &kb, &kb, &mut rng).unwrap();
            }
            cache.end_act(kvdb_types::Lsn::new(1).unwrap());

            let mut expected: Vec<Vec<u8>> = keys.iter().map(|&k| key_bytes(k)).collect();
            expected.sort_unstable();
            prop_assert_eq!(walk_all(&mut cache, &tree), expected);

            for &k in &keys {
                let kb = key_bytes(k);
                let (_, next) = tree.search(&mut cache, &kb).unwrap();
                prop_assert_eq!(next, Some((kb.clone(), kb)));
            }
        }

        /// Deleting a subset of inserted keys leaves exactly the
        /// complement, still in sorted order, with no orphaned branch
        /// separators pointing at freed pages (a corrupt tree would fail
        /// `walk_all`'s descent well before the assertion).
        #[test]
        fn delete_subset_leaves_exact_complement(
            keys in prop::collection::hash_set(0u16..500, 1..40),
            drop_every in 2u16..5,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut cache = new_cache(dir.path());
            let mut tree = new_tree(&mut cache);
            let mut rng = StdRng::seed_from_u64(99);

            let keys: Vec<u16> = keys.into_iter().collect();
            cache.begin_act();
            for &k in &keys {
                let kb = key_bytes(k);
                tree.insert(&mut cache, &kb, &kb, &mut rng).unwrap();
            }
            cache.end_act(kvdb_types::Lsn::new(1).unwrap());

            let (deleted, kept): (Vec<u16>, Vec<u16>) = keys.iter().copied().partition(|k| k % drop_every == 0);

            cache.begin_act();
            for &k in &deleted {
                tree.delete(&mut cache, &key_bytes(k)).unwrap();
            }
            cache.end_act(kvdb_types::Lsn::new(2).unwrap());

            let mut expected: Vec<Vec<u8>> = kept.iter().map(|&k| key_bytes(k)).collect();
            expected.sort_unstable();
            prop_assert_eq!(walk_all(&mut cache, &tree), expected);

            for &k in &deleted {
                let kb = key_bytes(k);
                let (_, next) = tree.search(&mut cache, &kb).unwrap();
                prop_assert_ne!(next.map(|(found, _)| found), Some(kb));
            }
        }
    }
}
