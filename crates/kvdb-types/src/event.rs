//! Event classification for page mutations recorded by the transactional
//! page cache (spec §4.5).

use kvdb_error::{KvError, Result};

/// Classifies how a page's `isEmpty()` status changed across a single
/// `doEvent` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// The page was empty before and after (a no-op mutation of an empty
    /// object, or an event applied to a page that stays logically
    /// vacant).
    Empty,
    /// The page was empty before, non-empty after: a fresh allocation.
    Created,
    /// The page was non-empty before, empty after: a logical free.
    Deleted,
    /// The page was non-empty before and after: an ordinary mutation.
    Altered,
}

impl UpdateType {
    /// Classify a transition given the page's emptiness before and after
    /// an event was applied.
    #[must_use]
    pub fn classify(was_empty: bool, is_empty: bool) -> Self {
        match (was_empty, is_empty) {
            (true, true) => UpdateType::Empty,
            (true, false) => UpdateType::Created,
            (false, true) => UpdateType::Deleted,
            (false, false) => UpdateType::Altered,
        }
    }

    /// The expected pre-event emptiness for this update type, used by
    /// `redoEvent`'s guard (§4.5): redo only if the page's current state
    /// matches what this update type implies it was before.
    #[must_use]
    pub fn expects_empty_before(self) -> bool {
        matches!(self, UpdateType::Empty | UpdateType::Created)
    }

    /// Wire tag (spec §6.1: `ACT=0/CLR=1/COMMIT=2/CHECKPOINT=3` are log
    /// record tags; this is the per-event `updateType:1` tag).
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            UpdateType::Empty => 0,
            UpdateType::Created => 1,
            UpdateType::Deleted => 2,
            UpdateType::Altered => 3,
        }
    }

    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(UpdateType::Empty),
            1 => Ok(UpdateType::Created),
            2 => Ok(UpdateType::Deleted),
            3 => Ok(UpdateType::Altered),
            other => Err(KvError::corrupt(format!("bad update type tag {other}"))),
        }
    }
}
