//! Record ids: a page number plus an intra-page entry slot.

use std::fmt;

use kvdb_error::{KvError, Result};

use crate::ids::PageNo;
use crate::limits::MAX_PAGE_NO;

/// Wire size of an encoded [`Rid`]: 6-byte page number + 2-byte entry id.
pub const RID_WIRE_LEN: usize = 8;

/// A record id: the page holding an entry plus the entry's slot within
/// that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    /// The record page this entry lives on.
    pub page_no: PageNo,
    /// The intra-page entry slot.
    pub entry_id: u16,
}

impl Rid {
    /// Build a record id.
    #[must_use]
    pub fn new(page_no: PageNo, entry_id: u16) -> Self {
        Rid { page_no, entry_id }
    }

    /// Encode as the 8-byte wire form: 6-byte LE page number, 2-byte LE
    /// entry id.
    #[must_use]
    pub fn encode(self) -> [u8; RID_WIRE_LEN] {
        let mut buf = [0u8; RID_WIRE_LEN];
        let p = self.page_no.get().to_le_bytes();
        buf[0..6].copy_from_slice(&p[0..6]);
        buf[6..8].copy_from_slice(&self.entry_id.to_le_bytes());
        buf
    }

    /// Decode from an 8-byte wire slice.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RID_WIRE_LEN {
            return Err(KvError::corrupt("truncated rid"));
        }
        let mut p = [0u8; 8];
        p[0..6].copy_from_slice(&buf[0..6]);
        let page_no = u64::from_le_bytes(p);
        if page_no > MAX_PAGE_NO {
            return Err(KvError::corrupt("rid page number out of range"));
        }
        let entry_id = u16::from_le_bytes([buf[6], buf[7]]);
        Ok(Rid {
            page_no: PageNo::new(page_no)?,
            entry_id,
        })
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid({},{})", self.page_no, self.entry_id)
    }
}
