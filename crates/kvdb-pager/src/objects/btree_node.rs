//! B+ tree leaf/branch page objects (C7 wire format, spec §6.1):
//! - Leaf: `[keysLen:2][prev:6][next:6] [val_vid]* [key_vid]*`
//! - Branch: `[height:1][childrenLen:1][keysLen:1] [child:6]* [key_vid]*`

use kvdb_error::{KvError, Result};
use kvdb_types::{PageNo, Vid};

const NO_LINK: u64 = (1u64 << 48) - 1;

fn link_bytes(link: Option<PageNo>) -> [u8; 6] {
    let raw = link.map_or(NO_LINK, PageNo::get);
    let full = raw.to_le_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&full[0..6]);
    out
}

fn link_from_bytes(bytes: &[u8]) -> Result<Option<PageNo>> {
    let mut full = [0u8; 8];
    full[0..6].copy_from_slice(bytes);
    let raw = u64::from_le_bytes(full);
    if raw == NO_LINK {
        Ok(None)
    } else {
        Ok(Some(PageNo::new(raw)?))
    }
}

/// A B+ tree leaf node: parallel key/value VID arrays plus the doubly
/// linked list pointers that tie leaves together in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Previous leaf in key order, if any.
    pub prev: Option<PageNo>,
    /// Next leaf in key order, if any.
    pub next: Option<PageNo>,
    /// Keys in ascending order.
    pub keys: Vec<Vid>,
    /// Values, parallel to `keys`.
    pub vals: Vec<Vid>,
}

impl LeafNode {
    /// True if this leaf holds no entries (the page is logically free).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wire-encoded size of this leaf's `serialize()` output, used for
    /// fill/underflow calculations without materializing the bytes.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        2 + 6 + 6 + self.keys.iter().map(Vid::wire_len).sum::<usize>()
            + self.vals.iter().map(Vid::wire_len).sum::<usize>()
    }

    /// Serialize to the on-disk byte layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.keys.len() as u16).to_le_bytes());
        out.extend_from_slice(&link_bytes(self.prev));
        out.extend_from_slice(&link_bytes(self.next));
        for v in &self.vals {
            v.encode_into(&mut out);
        }
        for k in &self.keys {
            k.encode_into(&mut out);
        }
        out
    }

    /// Deserialize from the on-disk byte layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(LeafNode::default());
        }
        if bytes.len() < 14 {
            return Err(KvError::corrupt("truncated leaf header"));
        }
        let keys_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let prev = link_from_bytes(&bytes[2..8])?;
        let next = link_from_bytes(&bytes[8..14])?;
        let mut pos = 14usize;
        let mut vals = Vec::with_capacity(keys_len);
        for _ in 0..keys_len {
            let (vid, used) = Vid::decode(&bytes[pos..])?;
            vals.push(vid);
            pos += used;
        }
        let mut keys = Vec::with_capacity(keys_len);
        for _ in 0..keys_len {
            let (vid, used) = Vid::decode(&bytes[pos..])?;
            keys.push(vid);
            pos += used;
        }
        Ok(LeafNode { prev, next, keys, vals })
    }
}

/// A B+ tree branch node: `children.len() == separators.len() + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchNode {
    /// Height above the leaf level (leaves are height 0).
    pub height: u8,
    /// Child page numbers, one more than `separators`.
    pub children: Vec<PageNo>,
    /// Separator keys between adjacent children.
    pub separators: Vec<Vid>,
}

impl BranchNode {
    /// True if this branch has no children (only possible transiently
    /// during a root collapse).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Wire-encoded size of this branch's `serialize()` output.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        3 + self.children.len() * 6 + self.separators.iter().map(Vid::wire_len).sum::<usize>()
    }

    /// Serialize to the on-disk byte layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.height);
        out.push(self.children.len() as u8);
        out.push(self.separators.len() as u8);
        for c in &self.children {
            let full = c.get().to_le_bytes();
            out.extend_from_slice(&full[0..6]);
        }
        for s in &self.separators {
            s.encode_into(&mut out);
        }
        out
    }

    /// Deserialize from the on-disk byte layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(BranchNode::default());
        }
        if bytes.len() < 3 {
            return Err(KvError::corrupt("truncated branch header"));
        }
        let height = bytes[0];
        let children_len = bytes[1] as usize;
        let keys_len = bytes[2] as usize;
        let mut pos = 3usize;
        let mut children = Vec::with_capacity(children_len);
        for _ in 0..children_len {
            if pos + 6 > bytes.len() {
                return Err(KvError::corrupt("truncated branch children"));
            }
            let mut full = [0u8; 8];
            full[0..6].copy_from_slice(&bytes[pos..pos + 6]);
            children.push(PageNo::new(u64::from_le_bytes(full))?);
            pos += 6;
        }
        let mut separators = Vec::with_capacity(keys_len);
        for _ in 0..keys_len {
            let (vid, used) = Vid::decode(&bytes[pos..])?;
            separators.push(vid);
            pos += used;
        }
        Ok(BranchNode {
            height,
            children,
            separators,
        })
    }
}

/// Mutating events applied to a [`LeafNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafEvent {
    /// Set the sibling links.
    SetLinks { prev: Option<PageNo>, next: Option<PageNo> },
    /// Insert a new (key, value) pair at `idx`.
    InsertEntry { idx: usize, key: Vid, val: Vid },
    /// Replace the value at `idx` (key unchanged).
    SetValue { idx: usize, val: Vid },
    /// Remove the entry at `idx`.
    RemoveEntry { idx: usize },
    /// Wholesale replace of this leaf's contents; used for the bulk
    /// rewrites that occur during split/merge/steal, where diffing a
    /// minimal per-entry event stream buys nothing (the whole page is
    /// being rewritten either way).
    ReplaceAll {
        prev: Option<PageNo>,
        next: Option<PageNo>,
        keys: Vec<Vid>,
        vals: Vec<Vid>,
    },
}

impl LeafEvent {
    /// Apply this event to a leaf in place.
    pub fn apply(&self, leaf: &mut LeafNode) -> Result<()> {
        match self {
            LeafEvent::SetLinks { prev, next } => {
                leaf.prev = *prev;
                leaf.next = *next;
            }
            LeafEvent::InsertEntry { idx, key, val } => {
                leaf.keys.insert(*idx, key.clone());
                leaf.vals.insert(*idx, val.clone());
            }
            LeafEvent::SetValue { idx, val } => {
                leaf.vals[*idx] = val.clone();
            }
            LeafEvent::RemoveEntry { idx } => {
                leaf.keys.remove(*idx);
                leaf.vals.remove(*idx);
            }
            LeafEvent::ReplaceAll { prev, next, keys, vals } => {
                leaf.prev = *prev;
                leaf.next = *next;
                leaf.keys = keys.clone();
                leaf.vals = vals.clone();
            }
        }
        Ok(())
    }

    /// Serialize this event's body.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            LeafEvent::SetLinks { prev, next } => {
                out.push(0);
                out.extend_from_slice(&link_bytes(*prev));
                out.extend_from_slice(&link_bytes(*next));
            }
            LeafEvent::InsertEntry { idx, key, val } => {
                out.push(1);
                out.extend_from_slice(&(*idx as u16).to_le_bytes());
                key.encode_into(&mut out);
                val.encode_into(&mut out);
            }
            LeafEvent::SetValue { idx, val } => {
                out.push(2);
                out.extend_from_slice(&(*idx as u16).to_le_bytes());
                val.encode_into(&mut out);
            }
            LeafEvent::RemoveEntry { idx } => {
                out.push(3);
                out.extend_from_slice(&(*idx as u16).to_le_bytes());
            }
            LeafEvent::ReplaceAll { prev, next, keys, vals } => {
                out.push(4);
                out.extend_from_slice(&link_bytes(*prev));
                out.extend_from_slice(&link_bytes(*next));
                out.extend_from_slice(&(keys.len() as u16).to_le_bytes());
                for v in vals {
                    v.encode_into(&mut out);
                }
                for k in keys {
                    k.encode_into(&mut out);
                }
            }
        }
        out
    }

    /// Deserialize an event body produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(KvError::corrupt("empty leaf event"));
        }
        match bytes[0] {
            0 => {
                if bytes.len() < 13 {
                    return Err(KvError::corrupt("truncated leaf event"));
                }
                Ok(LeafEvent::SetLinks {
                    prev: link_from_bytes(&bytes[1..7])?,
                    next: link_from_bytes(&bytes[7..13])?,
                })
            }
            1 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated leaf event"));
                }
                let idx = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
                let (key, used) = Vid::decode(&bytes[3..])?;
                let (val, _) = Vid::decode(&bytes[3 + used..])?;
                Ok(LeafEvent::InsertEntry { idx, key, val })
            }
            2 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated leaf event"));
                }
                let idx = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
                let (val, _) = Vid::decode(&bytes[3..])?;
                Ok(LeafEvent::SetValue { idx, val })
            }
            3 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated leaf event"));
                }
                Ok(LeafEvent::RemoveEntry {
                    idx: u16::from_le_bytes([bytes[1], bytes[2]]) as usize,
                })
            }
            4 => {
                if bytes.len() < 15 {
                    return Err(KvError::corrupt("truncated leaf event"));
                }
                let prev = link_from_bytes(&bytes[1..7])?;
                let next = link_from_bytes(&bytes[7..13])?;
                let keys_len = u16::from_le_bytes([bytes[13], bytes[14]]) as usize;
                let mut pos = 15usize;
                let mut vals = Vec::with_capacity(keys_len);
                for _ in 0..keys_len {
                    let (vid, used) = Vid::decode(&bytes[pos..])?;
                    vals.push(vid);
                    pos += used;
                }
                let mut keys = Vec::with_capacity(keys_len);
                for _ in 0..keys_len {
                    let (vid, used) = Vid::decode(&bytes[pos..])?;
                    keys.push(vid);
                    pos += used;
                }
                Ok(LeafEvent::ReplaceAll { prev, next, keys, vals })
            }
            other => Err(KvError::corrupt(format!("bad leaf event tag {other}"))),
        }
    }
}

/// Mutating events applied to a [`BranchNode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchEvent {
    /// Set the height (used when a new root branch is created).
    SetHeight { height: u8 },
    /// Insert a child pointer and the separator preceding it at `idx`
    /// (separator at `idx - 1`, child at `idx`).
    InsertChild { child_idx: usize, sep_idx: usize, child: PageNo, sep: Vid },
    /// Remove a child pointer and an adjoining separator.
    RemoveChild { child_idx: usize, sep_idx: usize },
    /// Wholesale replace, used for split/merge bulk rewrites (see
    /// [`LeafEvent::ReplaceAll`]).
    ReplaceAll {
        height: u8,
        children: Vec<PageNo>,
        separators: Vec<Vid>,
    },
}

impl BranchEvent {
    /// Apply this event to a branch in place.
    pub fn apply(&self, branch: &mut BranchNode) -> Result<()> {
        match self {
            BranchEvent::SetHeight { height } => {
                branch.height = *height;
            }
            BranchEvent::InsertChild { child_idx, sep_idx, child, sep } => {
                branch.children.insert(*child_idx, *child);
                branch.separators.insert(*sep_idx, sep.clone());
            }
            BranchEvent::RemoveChild { child_idx, sep_idx } => {
                branch.children.remove(*child_idx);
                branch.separators.remove(*sep_idx);
            }
            BranchEvent::ReplaceAll { height, children, separators } => {
                branch.height = *height;
                branch.children = children.clone();
                branch.separators = separators.clone();
            }
        }
        Ok(())
    }

    /// Serialize this event's body.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            BranchEvent::SetHeight { height } => {
                out.push(0);
                out.push(*height);
            }
            BranchEvent::InsertChild { child_idx, sep_idx, child, sep } => {
                out.push(1);
                out.extend_from_slice(&(*child_idx as u8).to_le_bytes());
                out.extend_from_slice(&(*sep_idx as u8).to_le_bytes());
                out.extend_from_slice(&link_bytes(Some(*child)));
                sep.encode_into(&mut out);
            }
            BranchEvent::RemoveChild { child_idx, sep_idx } => {
                out.push(2);
                out.push(*child_idx as u8);
                out.push(*sep_idx as u8);
            }
            BranchEvent::ReplaceAll { height, children, separators } => {
                out.push(3);
                out.push(*height);
                out.push(children.len() as u8);
                out.push(separators.len() as u8);
                for c in children {
                    out.extend_from_slice(&link_bytes(Some(*c)));
                }
                for s in separators {
                    s.encode_into(&mut out);
                }
            }
        }
        out
    }

    /// Deserialize an event body produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(KvError::corrupt("empty branch event"));
        }
        match bytes[0] {
            0 => {
                if bytes.len() < 2 {
                    return Err(KvError::corrupt("truncated branch event"));
                }
                Ok(BranchEvent::SetHeight { height: bytes[1] })
            }
            1 => {
                if bytes.len() < 9 {
                    return Err(KvError::corrupt("truncated branch event"));
                }
                let child_idx = bytes[1] as usize;
                let sep_idx = bytes[2] as usize;
                let child = link_from_bytes(&bytes[3..9])?
                    .ok_or_else(|| KvError::corrupt("branch event child link missing"))?;
                let (sep, _) = Vid::decode(&bytes[9..])?;
                Ok(BranchEvent::InsertChild { child_idx, sep_idx, child, sep })
            }
            2 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated branch event"));
                }
                Ok(BranchEvent::RemoveChild {
                    child_idx: bytes[1] as usize,
                    sep_idx: bytes[2] as usize,
                })
            }
            3 => {
                if bytes.len() < 4 {
                    return Err(KvError::corrupt("truncated branch event"));
                }
                let height = bytes[1];
                let children_len = bytes[2] as usize;
                let seps_len = bytes[3] as usize;
                let mut pos = 4usize;
                let mut children = Vec::with_capacity(children_len);
                for _ in 0..children_len {
                    if pos + 6 > bytes.len() {
                        return Err(KvError::corrupt("truncated branch event children"));
                    }
                    let child = link_from_bytes(&bytes[pos..pos + 6])?
                        .ok_or_else(|| KvError::corrupt("branch event child link missing"))?;
                    children.push(child);
                    pos += 6;
                }
                let mut separators = Vec::with_capacity(seps_len);
                for _ in 0..seps_len {
                    let (vid, used) = Vid::decode(&bytes[pos..])?;
                    separators.push(vid);
                    pos += used;
                }
                Ok(BranchEvent::ReplaceAll { height, children, separators })
            }
            other => Err(KvError::corrupt(format!("bad branch event tag {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(n: u64) -> PageNo {
        PageNo::new(n).unwrap()
    }

    #[test]
    fn leaf_round_trips_with_links() {
        let leaf = LeafNode {
            prev: Some(pn(3)),
            next: None,
            keys: vec![Vid::inline(vec![1, 2]), Vid::inline(vec![3])],
            vals: vec![Vid::inline(vec![9]), Vid::inline(vec![8, 8])],
        };
        let bytes = leaf.serialize();
        assert_eq!(bytes.len(), leaf.wire_len());
        assert_eq!(LeafNode::deserialize(&bytes).unwrap(), leaf);
    }

    #[test]
    fn branch_round_trips() {
        let branch = BranchNode {
            height: 2,
            children: vec![pn(0), pn(1), pn(2)],
            separators: vec![Vid::inline(vec![5]), Vid::inline(vec![10])],
        };
        let bytes = branch.serialize();
        assert_eq!(bytes.len(), branch.wire_len());
        assert_eq!(BranchNode::deserialize(&bytes).unwrap(), branch);
    }

    #[test]
    fn leaf_event_round_trips() {
        let events = vec![
            LeafEvent::SetLinks { prev: Some(pn(1)), next: None },
            LeafEvent::InsertEntry { idx: 0, key: Vid::inline(vec![1]), val: Vid::inline(vec![2]) },
            LeafEvent::SetValue { idx: 0, val: Vid::inline(vec![3]) },
            LeafEvent::RemoveEntry { idx: 0 },
        ];
        for e in events {
            let bytes = e.serialize();
            assert_eq!(LeafEvent::deserialize(&bytes).unwrap(), e);
        }
    }

    #[test]
    fn branch_event_round_trips() {
        let events = vec![
            BranchEvent::SetHeight { height: 1 },
            BranchEvent::InsertChild {
                child_idx: 1,
                sep_idx: 0,
                child: pn(7),
                sep: Vid::inline(vec![1, 2, 3]),
            },
            BranchEvent::RemoveChild { child_idx: 0, sep_idx: 0 },
        ];
        for e in events {
            let bytes = e.serialize();
            assert_eq!(BranchEvent::deserialize(&bytes).unwrap(), e);
        }
    }

    #[test]
    fn leaf_empty_bytes_is_default() {
        assert_eq!(LeafNode::deserialize(&[]).unwrap(), LeafNode::default());
    }
}
