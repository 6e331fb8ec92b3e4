//! Variable-length record ids (VIDs): an inline byte prefix, optionally
//! chained through a [`Rid`] to further pages when the record does not
//! fit entirely inline.
//!
//! Wire format (spec §6.1): a little-endian `lenFlag: u16` followed by
//! `lenFlag / 2` bytes of inline prefix, and — if `lenFlag` is odd — a
//! trailing [`Rid`] pointing at the rest of the record. The chain walk
//! itself (reading/freeing/comparing across continuation pages) needs
//! access to the record allocator and lives in `kvdb-alloc`; this type is
//! purely the addressable value plus its codec.

use kvdb_error::{KvError, Result};

use crate::rid::{Rid, RID_WIRE_LEN};

/// A variable-length record id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vid {
    /// Inline byte prefix of the record.
    pub prefix: Vec<u8>,
    /// If present, the record continues at this `Rid`.
    pub cont: Option<Rid>,
}

impl Vid {
    /// A VID that inlines the entire record, no continuation.
    #[must_use]
    pub fn inline(bytes: Vec<u8>) -> Self {
        Vid {
            prefix: bytes,
            cont: None,
        }
    }

    /// A VID whose prefix is followed by a continuation chain.
    #[must_use]
    pub fn chained(prefix: Vec<u8>, cont: Rid) -> Self {
        Vid {
            prefix,
            cont: Some(cont),
        }
    }

    /// Encoded wire length of this VID.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        2 + self.prefix.len() + if self.cont.is_some() { RID_WIRE_LEN } else { 0 }
    }

    /// Encode this VID onto `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let len_flag: u16 = (self.prefix.len() as u16) * 2 + u16::from(self.cont.is_some());
        out.extend_from_slice(&len_flag.to_le_bytes());
        out.extend_from_slice(&self.prefix);
        if let Some(rid) = self.cont {
            out.extend_from_slice(&rid.encode());
        }
    }

    /// Decode a VID starting at `buf[0..]`, returning the VID and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(KvError::corrupt("truncated vid length"));
        }
        let len_flag = u16::from_le_bytes([buf[0], buf[1]]);
        let has_cont = len_flag % 2 == 1;
        let prefix_len = (len_flag / 2) as usize;
        let mut pos = 2usize;
        if buf.len() < pos + prefix_len {
            return Err(KvError::corrupt("truncated vid prefix"));
        }
        let prefix = buf[pos..pos + prefix_len].to_vec();
        pos += prefix_len;
        let cont = if has_cont {
            if buf.len() < pos + RID_WIRE_LEN {
                return Err(KvError::corrupt("truncated vid continuation"));
            }
            let rid = Rid::decode(&buf[pos..pos + RID_WIRE_LEN])?;
            pos += RID_WIRE_LEN;
            Some(rid)
        } else {
            None
        };
        Ok((Vid { prefix, cont }, pos))
    }
}
