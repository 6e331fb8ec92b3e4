//! Record page object (C6 wire format, spec §6.1):
//! `[sizeClass:1][prev:6][next:6] [ [entryId:2][len:2][bytes] ]*`

use std::collections::BTreeMap;

use kvdb_error::{KvError, Result};
use kvdb_types::PageNo;

const NO_LINK: u64 = (1u64 << 48) - 1;

/// A page holding a size-class free-list node's worth of variable-length
/// byte entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPage {
    /// This page's current size class (0..25).
    pub size_class: u8,
    /// Previous page in this size class's free list.
    pub prev: Option<PageNo>,
    /// Next page in this size class's free list.
    pub next: Option<PageNo>,
    /// Entry id to payload bytes.
    pub entries: BTreeMap<u16, Vec<u8>>,
}

impl RecordPage {
    /// True if this page holds no entries (eligible to be freed by the
    /// page allocator).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of entry payload bytes (used for size-class calculation).
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Serialize to the on-disk byte layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.size_class);
        out.extend_from_slice(&link_bytes(self.prev));
        out.extend_from_slice(&link_bytes(self.next));
        for (id, bytes) in &self.entries {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Deserialize from the on-disk byte layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(RecordPage::default());
        }
        if bytes.len() < 13 {
            return Err(KvError::corrupt("truncated record page header"));
        }
        let size_class = bytes[0];
        let prev = link_from_bytes(&bytes[1..7])?;
        let next = link_from_bytes(&bytes[7..13])?;
        let mut entries = BTreeMap::new();
        let mut pos = 13usize;
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(KvError::corrupt("truncated record entry header"));
            }
            let id = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            let len = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(KvError::corrupt("truncated record entry payload"));
            }
            entries.insert(id, bytes[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(RecordPage {
            size_class,
            prev,
            next,
            entries,
        })
    }
}

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

/// Mutating events applied to a [`RecordPage`] (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Create a new entry with the given id and bytes.
    CreateEntry { id: u16, bytes: Vec<u8> },
    /// Delete an existing entry.
    DeleteEntry { id: u16 },
    /// Overwrite an existing entry's bytes.
    WriteEntry { id: u16, bytes: Vec<u8> },
    /// Update the page's size class and free-list links.
    SetLinks {
        size_class: u8,
        prev: Option<PageNo>,
        next: Option<PageNo>,
    },
}

impl RecordEvent {
    /// Apply this event to a record page in place.
    pub fn apply(&self, page: &mut RecordPage) -> Result<()> {
        match self {
            RecordEvent::CreateEntry { id, bytes } => {
                page.entries.insert(*id, bytes.clone());
            }
            RecordEvent::DeleteEntry { id } => {
                page.entries.remove(id);
            }
            RecordEvent::WriteEntry { id, bytes } => {
                page.entries.insert(*id, bytes.clone());
            }
            RecordEvent::SetLinks { size_class, prev, next } => {
                page.size_class = *size_class;
                page.prev = *prev;
                page.next = *next;
            }
        }
        Ok(())
    }

    /// Serialize this event to bytes (event body, without the
    /// `(updateType, ns, page)` envelope added by the log record codec).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RecordEvent::CreateEntry { id, bytes } => {
                out.push(0);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            RecordEvent::DeleteEntry { id } => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
            RecordEvent::WriteEntry { id, bytes } => {
                out.push(2);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            RecordEvent::SetLinks { size_class, prev, next } => {
                out.push(3);
                out.push(*size_class);
                out.extend_from_slice(&link_bytes(*prev));
                out.extend_from_slice(&link_bytes(*next));
            }
        }
        out
    }

    /// Deserialize an event body produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(KvError::corrupt("empty record event"));
        }
        match bytes[0] {
            0 | 2 => {
                if bytes.len() < 7 {
                    return Err(KvError::corrupt("truncated record event"));
                }
                let id = u16::from_le_bytes([bytes[1], bytes[2]]);
                let len = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
                if bytes.len() < 7 + len {
                    return Err(KvError::corrupt("truncated record event payload"));
                }
                let payload = bytes[7..7 + len].to_vec();
                Ok(if bytes[0] == 0 {
                    RecordEvent::CreateEntry { id, bytes: payload }
                } else {
                    RecordEvent::WriteEntry { id, bytes: payload }
                })
            }
            1 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated record event"));
                }
                Ok(RecordEvent::DeleteEntry {
                    id: u16::from_le_bytes([bytes[1], bytes[2]]),
                })
            }
            3 => {
                if bytes.len() < 14 {
                    return Err(KvError::corrupt("truncated record event"));
                }
                let size_class = bytes[1];
                let prev = link_from_bytes(&bytes[2..8])?;
                let next = link_from_bytes(&bytes[8..14])?;
                Ok(RecordEvent::SetLinks { size_class, prev, next })
            }
            other => Err(KvError::corrupt(format!("bad record event tag {other}"))),
        }
    }
}
