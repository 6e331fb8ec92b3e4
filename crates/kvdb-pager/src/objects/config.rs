//! Config page object (C9 wire format, spec §6.1):
//! `[ [key:1][valLen:1][valBytes] ]*`

use std::collections::BTreeMap;

use kvdb_error::{KvError, Result};

/// A page of small key/value settings (B+ tree root pointers, database
/// format version, and similar bootstrap state read at open time).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPage {
    /// Single-byte keys to their value bytes (at most 255 bytes each).
    pub entries: BTreeMap<u8, Vec<u8>>,
}

impl ConfigPage {
    /// True if no settings have been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the on-disk byte layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, val) in &self.entries {
            out.push(*key);
            out.push(val.len() as u8);
            out.extend_from_slice(val);
        }
        out
    }

    /// Deserialize from the on-disk byte layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + 2 > bytes.len() {
                return Err(KvError::corrupt("truncated config entry header"));
            }
            let key = bytes[pos];
            let len = bytes[pos + 1] as usize;
            pos += 2;
            if pos + len > bytes.len() {
                return Err(KvError::corrupt("truncated config entry value"));
            }
            entries.insert(key, bytes[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(ConfigPage { entries })
    }
}

/// Mutating events applied to a [`ConfigPage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// Set (or overwrite) a key's value.
    SetValue { key: u8, bytes: Vec<u8> },
    /// Remove a key.
    DeleteValue { key: u8 },
}

impl ConfigEvent {
    /// Apply this event to a config page in place.
    pub fn apply(&self, page: &mut ConfigPage) -> Result<()> {
        match self {
            ConfigEvent::SetValue { key, bytes } => {
                page.entries.insert(*key, bytes.clone());
            }
            ConfigEvent::DeleteValue { key } => {
                page.entries.remove(key);
            }
        }
        Ok(())
    }

    /// Serialize this event to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ConfigEvent::SetValue { key, bytes } => {
                out.push(0);
                out.push(*key);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            ConfigEvent::DeleteValue { key } => {
                out.push(1);
                out.push(*key);
            }
        }
        out
    }

    /// Deserialize an event body produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(KvError::corrupt("empty config event"));
        }
        match bytes[0] {
            0 => {
                if bytes.len() < 3 {
                    return Err(KvError::corrupt("truncated config event"));
                }
                let key = bytes[1];
                let len = bytes[2] as usize;
                if bytes.len() < 3 + len {
                    return Err(KvError::corrupt("truncated config event value"));
                }
                Ok(ConfigEvent::SetValue {
                    key,
                    bytes: bytes[3..3 + len].to_vec(),
                })
            }
            1 => {
                if bytes.len() < 2 {
                    return Err(KvError::corrupt("truncated config event"));
                }
                Ok(ConfigEvent::DeleteValue { key: bytes[1] })
            }
            other => Err(KvError::corrupt(format!("bad config event tag {other}"))),
        }
    }
}
