use std::sync::Arc;

use kvdb_pagestore::{DirPageStore, PageStore};
use kvdb_log::RecordLog;
use kvdb_types::Namespace;
use proptest::prelude::*;

fn open_log(dir: &std::path::Path, page_size: u32) -> RecordLog {
    let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
    RecordLog::open(store, Namespace::from(0), page_size).unwrap()
}

#[test]
fn round_trip_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(dir.path(), 64);
    let records: Vec<Vec<u8>> = vec![
        b"hello".to_vec(),
        vec![b'x'; 200], // spans multiple 64-byte pages
        b"".to_vec(),
        b"tail record".to_vec(),
    ];
    let mut lsns = Vec::new();
    for r in &records {
        lsns.push(log.append_record(r).unwrap());
    }
    for (i, lsn) in lsns.iter().enumerate() {
        let (data, next) = log.get_record(*lsn).unwrap();
        assert_eq!(&data, &records[i]);
        if i + 1 < lsns.len() {
            assert_eq!(next, lsns[i + 1]);
        } else {
            assert_eq!(next, log.get_end());
        }
    }
}

#[test]
fn exact_page_boundary_record_gets_stub_terminator() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(dir.path(), 32);
    // len_bytes for 32 is 1, so the first record after the initial stub
    // starts at offset 1 and leaves 30 bytes of payload room before
    // needing to rotate. Pick a length that exactly fills what's left.
    let free_after_stub = 32 - 1 - 1; // page_size - len_bytes(stub) - len_bytes(this entry header)
    let r = vec![b'a'; free_after_stub];
    let lsn = log.append_record(&r).unwrap();
    let r2 = b"next".to_vec();
    let lsn2 = log.append_record(&r2).unwrap();
    let (data, next) = log.get_record(lsn).unwrap();
    assert_eq!(data, r);
    assert_eq!(next, lsn2);
    let (data2, _) = log.get_record(lsn2).unwrap();
    assert_eq!(data2, r2);
}

#[test]
fn crash_before_marker_flush_does_not_lose_the_durable_record() {
    // A record that ends exactly on a page boundary forces `append_record`
    // to rotate to a fresh tail page and buffer the mandatory zero-length
    // continuation marker there, without flushing it. A caller (the
    // transaction engine's commit path) that then calls `flush_to_point`
    // with an LSN that lies entirely on the now-full prior page must still
    // see that marker made durable, or recovery mistakes the empty new
    // tail page for a torn one and discards the already-complete record
    // on the prior page.
    let dir = tempfile::tempdir().unwrap();
    let page_size = 32u32;
    let free_after_stub = page_size as usize - 1 - 1;
    let r = vec![b'a'; free_after_stub];

    let first_lsn;
    {
        let mut log = open_log(dir.path(), page_size);
        first_lsn = log.append_record(&r).unwrap();
        log.flush_to_point(first_lsn).unwrap();
        // Simulate a crash right after commit returns: skip the orderly
        // close/Drop flush entirely.
        std::mem::forget(log);
    }

    let log = open_log(dir.path(), page_size);
    let (data, _next) = log.get_record(first_lsn).unwrap();
    assert_eq!(data, r);
}

#[test]
fn trim_monotonicity_and_readability() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = open_log(dir.path(), 64);
    let mut lsns = Vec::new();
    for i in 0..10u8 {
        lsns.push(log.append_record(&[i; 10]).unwrap());
    }
    let start0 = log.get_start();
    log.trim_to_point(lsns[5]).unwrap();
    assert!(log.get_start() >= start0);
    assert_eq!(log.get_start(), lsns[5]);
    for lsn in &lsns[5..] {
        assert!(log.get_record(*lsn).is_ok());
    }
}

#[test]
fn torn_tail_recovery_drops_incomplete_record() {
    let dir = tempfile::tempdir().unwrap();
    let r1;
    let r2;
    {
        let mut log = open_log(dir.path(), 64);
        r1 = log.append_record(b"first").unwrap();
        r2 = log.append_record(b"second").unwrap();
        log.close().unwrap();
    }
    // Truncate the tail page file to simulate a crash mid-write of a
    // third record.
    let tail_path = dir.path().join("data").join("0_0");
    let mut bytes = std::fs::read(&tail_path).unwrap();
    bytes.extend_from_slice(&[0xFFu8; 5]); // garbage length header for a would-be third record
    std::fs::write(&tail_path, &bytes).unwrap();

    let log = open_log(dir.path(), 64);
    let (d1, next1) = log.get_record(r1).unwrap();
    assert_eq!(d1, b"first");
    assert_eq!(next1, r2);
    let (d2, _next2) = log.get_record(r2).unwrap();
    assert_eq!(d2, b"second");
}

#[test]
fn reopen_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut log = open_log(dir.path(), 64);
        log.append_record(b"abc").unwrap();
        log.close().unwrap();
    }
    let start_after_first_reopen;
    let end_after_first_reopen;
    {
        let log = open_log(dir.path(), 64);
        start_after_first_reopen = log.get_start();
        end_after_first_reopen = log.get_end();
    }
    let log = open_log(dir.path(), 64);
    assert_eq!(log.get_start(), start_after_first_reopen);
    assert_eq!(log.get_end(), end_after_first_reopen);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any sequence of records, of any length (including ones spanning
    /// several pages), reads back byte-for-byte in order regardless of
    /// the page size they were framed over.
    #[test]
    fn round_trip_any_records_any_page_size(
        page_size in prop::sample::select(vec![16u32, 32, 64, 128]),
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..90), 1..12),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path(), page_size);

        let mut lsns = Vec::new();
        for r in &records {
            lsns.push(log.append_record(r).unwrap());
        }
        for (i, lsn) in lsns.iter().enumerate() {
            let (data, next) = log.get_record(*lsn).unwrap();
            prop_assert_eq!(&data, &records[i]);
            if i + 1 < lsns.len() {
                prop_assert_eq!(next, lsns[i + 1]);
            } else {
                prop_assert_eq!(next, log.get_end());
            }
        }
    }

    /// Trimming to any previously returned LSN never moves `get_start()`
    /// backwards, and every record at or after the trim point stays
    /// readable.
    #[test]
    fn trim_to_any_point_is_monotonic_and_keeps_the_suffix_readable(
        count in 2usize..12,
        cut in 0usize..11,
    ) {
        let cut = cut.min(count - 1);
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(dir.path(), 64);
        let mut lsns = Vec::new();
        for i in 0..count {
            lsns.push(log.append_record(&[i as u8; 10]).unwrap());
        }

        let start0 = log.get_start();
        log.trim_to_point(lsns[cut]).unwrap();
        prop_assert!(log.get_start() >= start0);
        prop_assert_eq!(log.get_start(), lsns[cut]);
        for lsn in &lsns[cut..] {
            prop_assert!(log.get_record(*lsn).is_ok());
        }
    }

    /// Appending arbitrary garbage bytes after a clean close (simulating a
    /// crash mid-write of one more record) never loses an already-complete
    /// record, and recovering twice in a row is idempotent: the second
    /// `open_log` sees the same `get_start`/`get_end` the first recovery
    /// left behind.
    #[test]
    fn torn_tail_recovery_is_idempotent(
        count in 1usize..8,
        garbage in prop::collection::vec(any::<u8>(), 1..6),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut lsns = Vec::new();
        {
            let mut log = open_log(dir.path(), 64);
            for i in 0..count {
                lsns.push(log.append_record(&[i as u8; 8]).unwrap());
            }
            log.close().unwrap();
        }

        let tail_path = dir.path().join("data").join("0_0");
        let mut bytes = std::fs::read(&tail_path).unwrap();
        bytes.extend_from_slice(&garbage);
        std::fs::write(&tail_path, &bytes).unwrap();

        let (start1, end1) = {
            let log = open_log(dir.path(), 64);
            for lsn in &lsns {
                prop_assert!(log.get_record(*lsn).is_ok());
            }
            (log.get_start(), log.get_end())
        };
        let log = open_log(dir.path(), 64);
        prop_assert_eq!(log.get_start(), start1);
        prop_assert_eq!(log.get_end(), end1);
    }
}
