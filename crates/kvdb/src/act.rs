//! `SetEntryAct`/`SetEntryConfig` (spec §4.9): the one act kind the KV
//! façade drives through [`kvdb_txn::ActConfig`] — insert or delete a key
//! in the B+ tree, producing undo info that reverses exactly that change.

use kvdb_btree::BTree;
use kvdb_error::Result;
use kvdb_pager::PageCache;
use kvdb_txn::ActConfig;

/// A single KV mutation: set a key to a value, or delete it.
#[derive(Debug, Clone)]
pub enum SetEntryAct {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Drives [`SetEntryAct`] against a single [`BTree`], producing undo info
/// per spec §4.9: length-prefixed key, optionally followed by a
/// length-prefixed old value. Presence of the old value means undo
/// re-inserts it; absence means undo deletes the key (a no-op if the key
/// was never there to begin with).
pub struct SetEntryConfig {
    pub(crate) tree: BTree,
}

impl SetEntryConfig {
    pub(crate) fn new(tree: BTree) -> Self {
        SetEntryConfig { tree }
    }

    fn existing_value(&self, cache: &mut PageCache, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (_, next) = self.tree.search(cache, key)?;
        Ok(next.filter(|(k, _)| k == key).map(|(_, v)| v))
    }
}

fn encode_undo(key: &[u8], old_value: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + old_value.map_or(0, |v| 4 + v.len()));
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    if let Some(v) = old_value {
        out.extend_from_slice(&(v.len() as u32).to_be_bytes());
        out.extend_from_slice(v);
    }
    out
}

fn decode_undo(undo_info: &[u8]) -> Result<(&[u8], Option<&[u8]>)> {
    if undo_info.len() < 4 {
        return Err(kvdb_error::KvError::corrupt("truncated undo info key length"));
    }
    let key_len = u32::from_be_bytes(undo_info[0..4].try_into().unwrap()) as usize;
    if undo_info.len() < 4 + key_len {
        return Err(kvdb_error::KvError::corrupt("truncated undo info key"));
    }
    let key = &undo_info[4..4 + key_len];
    let rest = &undo_info[4 + key_len..];
    if rest.is_empty() {
        return Ok((key, None));
    }
    if rest.len() < 4 {
        return Err(kvdb_error::KvError::corrupt("truncated undo info value length"));
    }
    let val_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
    if rest.len() < 4 + val_len {
        return Err(kvdb_error::KvError::corrupt("truncated undo info value"));
    }
    Ok((key, Some(&rest[4..4 + val_len])))
}

impl ActConfig for SetEntryConfig {
    type Act = SetEntryAct;

    fn do_act(&mut self, cache: &mut PageCache, act: &SetEntryAct) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        match act {
            SetEntryAct::Set { key, value } => {
                let old = self.existing_value(cache, key)?;
                self.tree.insert(cache, key, value, &mut rng)?;
                Ok(encode_undo(key, old.as_deref()))
            }
            SetEntryAct::Delete { key } => {
                let old = self.existing_value(cache, key)?;
                if old.is_some() {
                    self.tree.delete(cache, key)?;
                }
                Ok(encode_undo(key, old.as_deref()))
            }
        }
    }

    fn undo_act(&mut self, cache: &mut PageCache, undo_info: &[u8]) -> Result<()> {
        let (key, old_value) = decode_undo(undo_info)?;
        let mut rng = rand::thread_rng();
        match old_value {
            Some(value) => self.tree.insert(cache, key, value, &mut rng),
            None => self.tree.delete(cache, key),
        }
    }
}
