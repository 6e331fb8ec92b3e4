//! C2: the record log — an append-only logical stream of variable-length
//! byte records, framed into entries over fixed-size pages of a single
//! [`PageStore`] namespace, addressed by LSN (spec §4.2).

mod error;
mod framing;

use std::sync::Arc;

use kvdb_error::{KvError, Result};
use kvdb_pagestore::PageStore;
use kvdb_types::limits::LOG_NAMESPACE;
use kvdb_types::{Lsn, Namespace, PageNo};
use tracing::{debug, trace, warn};

pub use error::LogError;
pub use framing::{decode_len, encode_len, len_bytes_for_page_size};

/// An append-only logical record log over page store namespace 0.
pub struct RecordLog {
    store: Arc<dyn PageStore>,
    namespace: Namespace,
    page_size: u32,
    len_bytes: usize,
    tail_page_no: u64,
    /// Bytes of the tail page already handed to `PageStore::append`.
    tail_flushed_len: u32,
    /// Bytes appended in memory but not yet flushed to the store.
    tail_buf: Vec<u8>,
    first_lsn: Lsn,
    closed: bool,
}

impl RecordLog {
    /// Open (creating if empty) a record log over `namespace` of `store`,
    /// running torn-record recovery if the namespace already has pages.
    pub fn open(store: Arc<dyn PageStore>, namespace: Namespace, page_size: u32) -> Result<Self> {
        let len_bytes = len_bytes_for_page_size(page_size);
        let pages = store.list_pages(namespace)?;
        if pages.is_empty() {
            return Self::create_fresh(store, namespace, page_size, len_bytes);
        }
        Self::recover(store, namespace, page_size, len_bytes, pages)
    }

    fn create_fresh(
        store: Arc<dyn PageStore>,
        namespace: Namespace,
        page_size: u32,
        len_bytes: usize,
    ) -> Result<Self> {
        store.create_open(namespace, PageNo::new(0)?)?;
        let mut log = RecordLog {
            store,
            namespace,
            page_size,
            len_bytes,
            tail_page_no: 0,
            tail_flushed_len: 0,
            tail_buf: Vec::new(),
            first_lsn: Lsn::NONE,
            closed: false,
        };
        // The very first entry of the very first page is always a
        // zero-length, inaccessible stub (spec §4.2); this keeps lsn 0
        // reserved as `Lsn::NONE`.
        log.write_entry(&[])?;
        log.flush_to_point(log.end_lsn())?;
        log.first_lsn = log.end_lsn();
        debug!(namespace = %namespace, "created fresh record log");
        Ok(log)
    }

    /// Torn-record recovery (spec §4.2): walk back from the highest
    /// existing page until the tail is unambiguous, then rewrite it with
    /// only its surviving complete entries.
    fn recover(
        store: Arc<dyn PageStore>,
        namespace: Namespace,
        page_size: u32,
        len_bytes: usize,
        mut pages: std::collections::BTreeSet<PageNo>,
    ) -> Result<Self> {
        let mut tail_page_no = pages.iter().max().copied().unwrap().get();
        let (found, bytes) = loop {
            let page = PageNo::new(tail_page_no)?;
            let bytes = store.read(namespace, page)?.unwrap_or_default();
            let found = parse_complete_entries(&bytes, len_bytes);
            let full_or_empty = bytes.is_empty() || (page_size as usize - bytes.len()) < len_bytes;

            if full_or_empty && found.len() <= 1 {
                if tail_page_no == 0 {
                    break (found, bytes);
                }
                warn!(page = tail_page_no, "discarding ambiguous torn tail page during recovery");
                store.delete(namespace, page)?;
                pages.remove(&page);
                tail_page_no -= 1;
                continue;
            }
            if full_or_empty {
                let mut found = found;
                warn!(page = tail_page_no, "dropping torn last entry during recovery");
                found.pop();
                break (found, bytes);
            }
            break (found, bytes);
        };

        let tail_page = PageNo::new(tail_page_no)?;
        let mut rebuilt = Vec::new();
        for (start, len) in &found {
            rebuilt.extend_from_slice(&encode_len(*len, len_bytes));
            rebuilt.extend_from_slice(&bytes[start + len_bytes..start + len_bytes + len]);
        }
        if store.exists(namespace, tail_page)? {
            store.write(namespace, tail_page, &rebuilt)?;
        } else {
            store.create(namespace, tail_page, Some(&rebuilt))?;
        }
        store.open_append(namespace, tail_page)?;

        let head_page_no = pages.iter().min().map(|p| p.get()).unwrap_or(tail_page_no);
        let first_lsn = if head_page_no == 0 {
            Lsn::from_page(0, len_bytes as u32, page_size)
        } else {
            Lsn::from_page(head_page_no, 0, page_size)
        };

        debug!(tail_page = tail_page_no, first_lsn = %first_lsn, "record log recovered");
        Ok(RecordLog {
            store,
            namespace,
            page_size,
            len_bytes,
            tail_page_no,
            tail_flushed_len: rebuilt.len() as u32,
            tail_buf: Vec::new(),
            first_lsn,
            closed: false,
        })
    }

    /// The LSN of the oldest still-addressable record.
    #[must_use]
    pub fn get_start(&self) -> Lsn {
        self.first_lsn
    }

    /// The LSN one past the last appended byte.
    #[must_use]
    pub fn get_end(&self) -> Lsn {
        self.end_lsn()
    }

    /// True if the log contains no records past its start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get_start() == self.get_end()
    }

    fn end_lsn(&self) -> Lsn {
        Lsn::from_page(
            self.tail_page_no,
            self.tail_flushed_len + self.tail_buf.len() as u32,
            self.page_size,
        )
    }

    fn tail_len(&self) -> u32 {
        self.tail_flushed_len + self.tail_buf.len() as u32
    }

    fn write_entry(&mut self, data: &[u8]) -> Result<()> {
        self.tail_buf.extend_from_slice(&encode_len(data.len(), self.len_bytes));
        self.tail_buf.extend_from_slice(data);
        Ok(())
    }

    fn rotate_tail_page(&mut self) -> Result<()> {
        self.flush_to_point(self.end_lsn())?;
        self.store.close_append(self.namespace, PageNo::new(self.tail_page_no)?)?;
        self.tail_page_no += 1;
        self.store.create_open(self.namespace, PageNo::new(self.tail_page_no)?)?;
        self.tail_flushed_len = 0;
        self.tail_buf.clear();
        Ok(())
    }

    /// Append a logical record, splitting it across entries/pages as
    /// needed. Returns the LSN of its first entry.
    pub fn append_record(&mut self, record: &[u8]) -> Result<Lsn> {
        if self.closed {
            return Err(LogError::Closed.into());
        }
        let mut remaining = record;
        let mut first_lsn = None;
        loop {
            let free = self.page_size - self.tail_len();
            if (free as usize) < self.len_bytes {
                self.rotate_tail_page()?;
                continue;
            }
            let max_payload = free as usize - self.len_bytes;
            let chunk_len = remaining.len().min(max_payload);
            if first_lsn.is_none() {
                first_lsn = Some(self.end_lsn());
            }
            self.write_entry(&remaining[..chunk_len])?;
            remaining = &remaining[chunk_len..];
            if remaining.is_empty() {
                if self.tail_len() == self.page_size {
                    // The record ended exactly at a page boundary: the
                    // reader needs an explicit zero-length continuation
                    // marker on the next page to know not to keep reading.
                    self.rotate_tail_page()?;
                    self.write_entry(&[])?;
                }
                break;
            }
        }
        trace!(lsn = %first_lsn.unwrap(), len = record.len(), "appended record");
        Ok(first_lsn.unwrap())
    }

    fn read_page_bytes(&self, page_no: u64) -> Result<Vec<u8>> {
        if page_no == self.tail_page_no {
            let mut bytes = self
                .store
                .read(self.namespace, PageNo::new(page_no)?)?
                .unwrap_or_default();
            bytes.extend_from_slice(&self.tail_buf);
            Ok(bytes)
        } else {
            self.store
                .read(self.namespace, PageNo::new(page_no)?)?
                .ok_or_else(|| KvError::corrupt(format!("log page {page_no} missing")))
        }
    }

    /// Read the record starting at `lsn`, returning its bytes and the LSN
    /// of the next record.
    pub fn get_record(&self, lsn: Lsn) -> Result<(Vec<u8>, Lsn)> {
        let mut cur_page = lsn.page_no(self.page_size);
        let mut cur_offset = lsn.page_offset(self.page_size);
        let mut out = Vec::new();
        loop {
            let bytes = self.read_page_bytes(cur_page)?;
            let off = cur_offset as usize;
            if off + self.len_bytes > bytes.len() {
                return Err(LogError::CorruptEntry(lsn.get()).into());
            }
            let len = decode_len(&bytes[off..off + self.len_bytes]);
            let data_start = off + self.len_bytes;
            let data_end = data_start + len;
            if data_end > bytes.len() {
                return Err(LogError::CorruptEntry(lsn.get()).into());
            }
            out.extend_from_slice(&bytes[data_start..data_end]);
            if data_end as u32 == self.page_size {
                cur_page += 1;
                cur_offset = 0;
                continue;
            }
            let next = Lsn::from_page(cur_page, data_end as u32, self.page_size);
            return Ok((out, next));
        }
    }

    /// Flush buffered bytes to disk so that everything up to and
    /// including `lsn` is durable. Also flushes regardless of `lsn` when
    /// the on-disk tail page is still empty: recovery can't tell a torn
    /// tail from an intentionally-empty one unless whatever is currently
    /// buffered (e.g. a page-boundary continuation marker) actually makes
    /// it to disk.
    pub fn flush_to_point(&mut self, lsn: Lsn) -> Result<()> {
        let target_page = lsn.page_no(self.page_size);
        let on_disk_tail_empty = self.tail_flushed_len == 0 && !self.tail_buf.is_empty();
        if target_page < self.tail_page_no && !on_disk_tail_empty {
            return Ok(());
        }
        if !self.tail_buf.is_empty() {
            self.store
                .append(self.namespace, PageNo::new(self.tail_page_no)?, &self.tail_buf)?;
            self.tail_flushed_len += self.tail_buf.len() as u32;
            self.tail_buf.clear();
        }
        Ok(())
    }

    /// Delete whole pages strictly before `lsn`'s page and advance
    /// `getStart()` to `lsn`.
    pub fn trim_to_point(&mut self, lsn: Lsn) -> Result<()> {
        let target_page = lsn.page_no(self.page_size);
        let from_page = self.first_lsn.page_no(self.page_size);
        for p in from_page..target_page {
            if p == self.tail_page_no {
                break;
            }
            self.store.delete(self.namespace, PageNo::new(p)?)?;
        }
        self.first_lsn = lsn;
        debug!(new_start = %lsn, "trimmed record log");
        Ok(())
    }

    /// Flush and close the tail append handle.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_to_point(self.end_lsn())?;
        self.store.close_append(self.namespace, PageNo::new(self.tail_page_no)?)?;
        self.closed = true;
        Ok(())
    }

    /// Convenience constructor using the reserved log namespace (0).
    pub fn open_default(store: Arc<dyn PageStore>, page_size: u32) -> Result<Self> {
        Self::open(store, Namespace::from(LOG_NAMESPACE), page_size)
    }
}

impl Drop for RecordLog {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(error = %e, "error closing record log on drop");
            }
        }
    }
}

/// Scan entries from offset 0, stopping at the first one whose length
/// header is unparsable or whose payload overruns `bytes`. Returns
/// `(offset, len)` of each complete entry found.
fn parse_complete_entries(bytes: &[u8], len_bytes: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset + len_bytes > bytes.len() {
            break;
        }
        let len = decode_len(&bytes[offset..offset + len_bytes]);
        let data_end = offset + len_bytes + len;
        if data_end > bytes.len() {
            break;
        }
        out.push((offset, len));
        offset = data_end;
    }
    out
}
