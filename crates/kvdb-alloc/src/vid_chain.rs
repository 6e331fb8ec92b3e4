//! VID chain operations (spec §4.4): reading, freeing, and streaming
//! comparison across the RID-linked continuation of a record that did
//! not fit inline.

use std::cmp::Ordering;

use kvdb_error::Result;
use kvdb_pager::PageCache;
use kvdb_types::{Rid, Vid, RID_WIRE_LEN};
use rand::Rng;

use crate::record_alloc::RecordAllocator;

/// Store `bytes` as a VID: inline whole if it is no longer than
/// `max_vid_len - 2`; otherwise store the first
/// `max_vid_len - 2 - sizeof(RID)` bytes inline and chain the rest
/// through `chunk_size`-byte record entries linked by [`Rid`]s (spec
/// §4.4). The final chained slice is always shorter than `chunk_size`,
/// which is how [`read`]/[`cmp`] tell it apart from one with a
/// continuation still to follow.
pub fn store(
    cache: &mut PageCache,
    alloc: &mut RecordAllocator,
    bytes: &[u8],
    max_vid_len: usize,
    chunk_size: usize,
    rng: &mut impl Rng,
) -> Result<Vid> {
    let inline_threshold = max_vid_len.saturating_sub(2);
    if bytes.len() <= inline_threshold {
        return Ok(Vid::inline(bytes.to_vec()));
    }
    let prefix_len = inline_threshold.saturating_sub(RID_WIRE_LEN);
    let (prefix, rest) = bytes.split_at(prefix_len);
    let mut chunks: Vec<&[u8]> = rest.chunks(chunk_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let mut cont: Option<Rid> = None;
    for chunk in chunks.into_iter().rev() {
        let mut body = chunk.to_vec();
        if let Some(next) = cont {
            body.extend_from_slice(&next.encode());
        }
        let rid = alloc.alloc_entry(cache, &body, rng)?;
        cont = Some(rid);
    }
    Ok(Vid::chained(prefix.to_vec(), cont.expect("at least one chunk")))
}

/// Reconstruct the full byte string addressed by `vid`, walking its
/// continuation chain.
pub fn read(cache: &mut PageCache, alloc: &RecordAllocator, vid: &Vid, chunk_size: usize) -> Result<Vec<u8>> {
    let mut out = vid.prefix.clone();
    let mut next = vid.cont;
    while let Some(rid) = next {
        let bytes = alloc.read_entry(cache, rid)?;
        next = split_chunk(&bytes, chunk_size, &mut out)?;
    }
    Ok(out)
}

fn split_chunk(bytes: &[u8], chunk_size: usize, out: &mut Vec<u8>) -> Result<Option<Rid>> {
    if bytes.len() >= chunk_size + RID_WIRE_LEN {
        out.extend_from_slice(&bytes[..chunk_size]);
        Ok(Some(Rid::decode(&bytes[chunk_size..chunk_size + RID_WIRE_LEN])?))
    } else {
        out.extend_from_slice(bytes);
        Ok(None)
    }
}

/// Unlink and free every entry in `vid`'s continuation chain (the inline
/// prefix itself needs no freeing — it lives in the VID value, not a
/// record page).
pub fn free(cache: &mut PageCache, alloc: &mut RecordAllocator, vid: &Vid, chunk_size: usize) -> Result<()> {
    let mut next = vid.cont;
    while let Some(rid) = next {
        let bytes = alloc.read_entry(cache, rid)?;
        next = split_chunk(&bytes, chunk_size, &mut Vec::new())?;
        alloc.delete_entry(cache, rid)?;
    }
    Ok(())
}

/// Lexicographically compare `s` against the byte string addressed by
/// `vid`, streaming the VID's chain one chunk at a time rather than
/// materializing it (spec §4.4 `cmp(str, vid)`).
pub fn cmp(cache: &mut PageCache, alloc: &RecordAllocator, s: &[u8], vid: &Vid, chunk_size: usize) -> Result<Ordering> {
    let mut s_pos = 0usize;
    let mut chunk_owned = vid.prefix.clone();
    let mut cont = vid.cont;
    loop {
        let take = chunk_owned.len().min(s.len() - s_pos);
        match s[s_pos..s_pos + take].cmp(&chunk_owned[..take]) {
            Ordering::Equal => {}
            other => return Ok(other),
        }
        s_pos += take;
        if take < chunk_owned.len() {
            return Ok(Ordering::Less);
        }
        if s_pos == s.len() {
            return Ok(if cont.is_none() { Ordering::Equal } else { Ordering::Less });
        }
        let Some(rid) = cont else {
            return Ok(Ordering::Greater);
        };
        let bytes = alloc.read_entry(cache, rid)?;
        let mut next_chunk = Vec::new();
        cont = split_chunk(&bytes, chunk_size, &mut next_chunk)?;
        chunk_owned = next_chunk;
    }
}
