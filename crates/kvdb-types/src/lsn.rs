//! Log sequence numbers.

use std::fmt;

use kvdb_error::{KvError, Result};

use crate::limits::MAX_LSN;

/// A log sequence number: an absolute byte offset into the logical log
/// page stream. `Lsn::NONE` (value 0) means "no such record" and is never
/// produced by [`kvdb_log`](../../kvdb_log/index.html)'s `appendRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    /// The reserved "no LSN" sentinel.
    pub const NONE: Lsn = Lsn(0);

    /// Construct an LSN from a raw byte offset, rejecting out-of-range
    /// values.
    pub fn new(offset: u64) -> Result<Self> {
        if offset > MAX_LSN {
            return Err(KvError::corrupt(format!("lsn {offset} exceeds {MAX_LSN}")));
        }
        Ok(Lsn(offset))
    }

    /// Construct an LSN from a raw offset without bounds checking. Used
    /// internally once a value has already been validated or computed
    /// from in-range arithmetic.
    #[must_use]
    pub fn from_raw(offset: u64) -> Self {
        debug_assert!(offset <= MAX_LSN);
        Lsn(offset)
    }

    /// The raw byte offset.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    /// True if this is the `NONE` sentinel.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True if this LSN refers to an actual record.
    #[must_use]
    pub fn is_some(self) -> bool {
        !self.is_none()
    }

    /// The page number (0-based) this offset falls into, given a page
    /// size.
    #[must_use]
    pub fn page_no(self, page_size: u32) -> u64 {
        self.0 / u64::from(page_size)
    }

    /// The intra-page byte offset, given a page size.
    #[must_use]
    pub fn page_offset(self, page_size: u32) -> u32 {
        (self.0 % u64::from(page_size)) as u32
    }

    /// Build an LSN from a page number and intra-page offset.
    #[must_use]
    pub fn from_page(page_no: u64, offset: u32, page_size: u32) -> Self {
        Lsn(page_no * u64::from(page_size) + u64::from(offset))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
