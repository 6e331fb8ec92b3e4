use std::sync::Arc;

use kvdb_log::RecordLog;
use kvdb_pager::objects::{PageEvent, PageKind, RecordEvent};
use kvdb_pager::PageCache;
use kvdb_pagestore::{DirPageStore, PageStore};
use kvdb_types::{Namespace, PageNo, PageId};
use parking_lot::Mutex;

fn new_cache(dir: &std::path::Path, capacity: usize) -> PageCache {
    let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir).unwrap());
    let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
    PageCache::new(store, log, capacity)
}

fn data_ns() -> Namespace {
    Namespace::from(1)
}

#[test]
fn pin_apply_finish_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = new_cache(dir.path(), 8);
    let page_id = PageId::new(data_ns(), PageNo::new(0).unwrap());

    cache.pin(page_id, PageKind::Record).unwrap();
    assert!(cache.page(page_id).unwrap().obj().is_empty());
    cache.unpin(page_id);

    cache.begin_act();
    let event = PageEvent::Record(RecordEvent::CreateEntry {
        id: 1,
        bytes: b"hello".to_vec(),
    });
    let update = cache.do_event(page_id, PageKind::Record, &event).unwrap();
    assert_eq!(update, kvdb_types::UpdateType::Created);

    let events = cache.end_act(kvdb_types::Lsn::new(100).unwrap());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].namespace, data_ns());
    assert!(!cache.page(page_id).unwrap().is_pinned());
    assert_eq!(cache.dpt_snapshot().len(), 1);
}

#[test]
fn eviction_persists_dirty_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PageStore> = Arc::new(DirPageStore::open(dir.path()).unwrap());
    let log = Arc::new(Mutex::new(RecordLog::open_default(store.clone(), 4096).unwrap()));
    let mut cache = PageCache::new(store.clone(), log, 1);

    let p0 = PageId::new(data_ns(), PageNo::new(0).unwrap());
    let p1 = PageId::new(data_ns(), PageNo::new(1).unwrap());

    cache.begin_act();
    cache
        .do_event(
            p0,
            PageKind::Record,
            &PageEvent::Record(RecordEvent::CreateEntry {
                id: 1,
                bytes: b"x".to_vec(),
            }),
        )
        .unwrap();
    cache.end_act(kvdb_types::Lsn::new(10).unwrap());

    // Loading a second page while capacity is 1 should evict p0, writing
    // it to the store.
    cache.pin(p1, PageKind::Record).unwrap();
    cache.unpin(p1);

    assert!(store.exists(data_ns(), PageNo::new(0).unwrap()).unwrap());
}

#[test]
fn redo_guard_skips_mismatched_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = new_cache(dir.path(), 8);
    let page_id = PageId::new(data_ns(), PageNo::new(0).unwrap());

    let event = PageEvent::Record(RecordEvent::CreateEntry {
        id: 1,
        bytes: b"x".to_vec(),
    });

    // The page is currently empty, but this event's update type claims it
    // should have been non-empty (ALTERED) beforehand: the guard must
    // refuse to apply it.
    cache.begin_redo_act();
    let applied = cache
        .redo_do_event(page_id, PageKind::Record, &event, kvdb_types::UpdateType::Altered)
        .unwrap();
    assert!(!applied);
    assert!(cache.page(page_id).unwrap().obj().is_empty());
    cache.end_redo_act(kvdb_types::Lsn::new(1).unwrap());

    cache.begin_redo_act();
    let applied = cache
        .redo_do_event(page_id, PageKind::Record, &event, kvdb_types::UpdateType::Created)
        .unwrap();
    assert!(applied);
    cache.end_redo_act(kvdb_types::Lsn::new(2).unwrap());
}
