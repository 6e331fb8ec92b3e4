//! Pure tree-shape helpers that need no page cache access: flank-index
//! binary search, leaf/branch split points, and shortest-separator
//! computation (spec §4.7).

use std::cmp::Ordering;

use kvdb_error::Result;
use kvdb_types::Vid;

/// Binary search a node's `len` keys for a target. `cmp_at(i)` must
/// return `key[i].cmp(target)`. Returns `(i_low, i_high)`: keys
/// `[0..i_low)` are all strictly less than the target and keys
/// `[i_high..len)` are all strictly greater. `i_low == i_high` unless an
/// exact match exists, in which case `i_high == i_low + 1` and
/// `keys[i_low]` is the match (spec's "for equal keys, iLow == iHigh"
/// describes the common no-match case, where both bounds collapse to
/// the single insertion point).
pub fn flank_index(len: usize, cmp_at: &mut impl FnMut(usize) -> Result<Ordering>) -> Result<(usize, usize)> {
    let i_low = partition_point(len, &mut |i| Ok(cmp_at(i)? == Ordering::Less))?;
    let i_high = partition_point(len, &mut |i| Ok(cmp_at(i)? != Ordering::Greater))?;
    Ok((i_low, i_high))
}

fn partition_point(len: usize, pred: &mut impl FnMut(usize) -> Result<bool>) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = len;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid)? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// The index at which a leaf's entries should be split so the left
/// portion holds the first half (by cumulative wire size) of the
/// entries, per `getSplitIndex` (spec §4.7). Always returns an index in
/// `1..keys.len()` for `keys.len() >= 2`, so both halves are non-empty.
pub fn leaf_split_index(keys: &[Vid], vals: &[Vid]) -> usize {
    debug_assert_eq!(keys.len(), vals.len());
    let total: usize = keys.iter().map(Vid::wire_len).sum::<usize>() + vals.iter().map(Vid::wire_len).sum::<usize>();
    let half = total / 2;
    let mut acc = 0usize;
    for (i, (k, v)) in keys.iter().zip(vals).enumerate() {
        acc += k.wire_len() + v.wire_len();
        if acc >= half {
            return (i + 1).clamp(1, keys.len().saturating_sub(1).max(1));
        }
    }
    keys.len().saturating_sub(1).max(1)
}

/// The index of the separator to pull up when a branch splits. The
/// pulled-up separator at `separators[idx]` is removed from both
/// resulting branches (it moves to the parent); `children[0..=idx]` and
/// `separators[0..idx]` stay on the left, `children[idx+1..]` and
/// `separators[idx+1..]` move to the right.
pub fn branch_split_index(children: &[kvdb_types::PageNo], separators: &[Vid]) -> usize {
    debug_assert_eq!(children.len(), separators.len() + 1);
    let total: usize = separators.iter().map(Vid::wire_len).sum::<usize>() + children.len() * 6;
    let half = total / 2;
    let mut acc = 6usize;
    for (i, s) in separators.iter().enumerate() {
        acc += s.wire_len() + 6;
        if acc >= half {
            return i.clamp(0, separators.len().saturating_sub(1));
        }
    }
    separators.len().saturating_sub(1)
}

/// The shortest byte string `s` with `l < s <= r` (spec §4.7). `r[0..=k]`
/// where `k` is the first index at which `l` and `r` differ, treating
/// `l` running out of bytes before `r` as a difference at `k ==
/// l.len()` (so a proper prefix relationship still yields a separator
/// strictly greater than `l`). Defensive fallback when `l == r`: return
/// `r` itself.
pub fn shortest_separator(l: &[u8], r: &[u8]) -> Vec<u8> {
    if l == r {
        return r.to_vec();
    }
    let n = l.len().min(r.len());
    let k = (0..n).find(|&i| l[i] != r[i]).unwrap_or(n);
    let take = (k + 1).min(r.len());
    r[..take].to_vec()
}
