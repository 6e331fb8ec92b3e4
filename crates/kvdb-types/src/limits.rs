//! Numeric limits from spec §6.1.

/// Largest namespace id representable on disk.
pub const MAX_NAMESPACE: u16 = 255;
/// Largest page number representable on disk (48 bits).
pub const MAX_PAGE_NO: u64 = (1u64 << 48) - 1;
/// Largest LSN representable on disk (48 bits).
pub const MAX_LSN: u64 = (1u64 << 48) - 1;
/// Largest transaction id representable on disk (24 bits).
pub const MAX_TX_ID: u32 = (1u32 << 24) - 1;
/// Largest configurable page size.
pub const MAX_PAGE_SIZE: u32 = 65535;
/// Reserved namespace holding the record log's own pages.
pub const LOG_NAMESPACE: u8 = 0;
