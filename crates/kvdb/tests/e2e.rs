//! End-to-end façade scenarios: round trips through a real directory on
//! disk, covering the cases a client driving `Database` directly (or
//! through `Dispatcher`) actually hits.

use kvdb::{Config, Database, Dispatcher, Request, Response, TxOutcome};

fn open(dir: &std::path::Path) -> Database {
    Database::open(dir, Config::default()).expect("database opens")
}

#[test]
fn empty_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());
    let tx = db.begin();

    assert_eq!(db.get(tx, b"missing").unwrap(), TxOutcome::Done(None));
    assert_eq!(db.next(tx, None).unwrap(), TxOutcome::Done(None));
    let (prev, next) = match db.find(tx, b"anything").unwrap() {
        TxOutcome::Done(pair) => pair,
        TxOutcome::Blocked => panic!("uncontended find blocked"),
    };
    assert_eq!(prev, None);
    assert_eq!(next, None);

    db.commit(tx).unwrap();
}

#[test]
fn set_then_get_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut db = open(dir.path());
        let tx = db.begin();
        assert_eq!(db.set(tx, b"k1", b"v1").unwrap(), TxOutcome::Done(()));
        db.commit(tx).unwrap();
    }

    let mut db = open(dir.path());
    let tx = db.begin();
    assert_eq!(db.get(tx, b"k1").unwrap(), TxOutcome::Done(Some(b"v1".to_vec())));
    db.commit(tx).unwrap();
}

#[test]
fn rollback_undoes_an_uncommitted_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let setup = db.begin();
    db.set(setup, b"k", b"original").unwrap();
    db.commit(setup).unwrap();

    let tx = db.begin();
    assert_eq!(db.set(tx, b"k", b"changed").unwrap(), TxOutcome::Done(()));
    assert_eq!(db.get(tx, b"k").unwrap(), TxOutcome::Done(Some(b"changed".to_vec())));
    db.rollback(tx).unwrap();

    let tx2 = db.begin();
    assert_eq!(db.get(tx2, b"k").unwrap(), TxOutcome::Done(Some(b"original".to_vec())));
    db.commit(tx2).unwrap();
}

#[test]
fn delete_removes_an_existing_key_and_is_a_no_op_otherwise() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let tx = db.begin();
    db.set(tx, b"k", b"v").unwrap();
    db.commit(tx).unwrap();

    let tx = db.begin();
    assert_eq!(db.delete(tx, b"k").unwrap(), TxOutcome::Done(()));
    assert_eq!(db.delete(tx, b"never-existed").unwrap(), TxOutcome::Done(()));
    assert_eq!(db.get(tx, b"k").unwrap(), TxOutcome::Done(None));
    db.commit(tx).unwrap();
}

#[test]
fn next_walks_keys_in_sorted_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let tx = db.begin();
    for key in [b"c".as_slice(), b"a".as_slice(), b"b".as_slice()] {
        db.set(tx, key, key).unwrap();
    }
    db.commit(tx).unwrap();

    let tx = db.begin();
    let mut seen = Vec::new();
    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let outcome = db.next(tx, cursor.as_deref()).unwrap();
        let TxOutcome::Done(pair) = outcome else {
            panic!("uncontended next blocked");
        };
        let Some((k, _)) = pair else { break };
        cursor = Some(k.clone());
        seen.push(k);
    }
    db.commit(tx).unwrap();

    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn find_reports_flanking_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let tx = db.begin();
    db.set(tx, b"a", b"1").unwrap();
    db.set(tx, b"c", b"3").unwrap();
    db.commit(tx).unwrap();

    let tx = db.begin();
    let (prev, next) = match db.find(tx, b"b").unwrap() {
        TxOutcome::Done(pair) => pair,
        TxOutcome::Blocked => panic!("uncontended find blocked"),
    };
    assert_eq!(prev, Some((b"a".to_vec(), b"1".to_vec())));
    assert_eq!(next, Some((b"c".to_vec(), b"3".to_vec())));
    db.commit(tx).unwrap();
}

#[test]
fn reopen_after_uncommitted_act_rolls_it_back() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut db = open(dir.path());
        let tx = db.begin();
        assert_eq!(db.set(tx, b"k", b"v").unwrap(), TxOutcome::Done(()));
        // No commit: `db` drops here (closing the log without a COMMIT
        // record for `tx`), matching what recovery sees after an unclean
        // shutdown mid-transaction.
    }

    let mut db = open(dir.path());
    let tx = db.begin();
    assert_eq!(db.get(tx, b"k").unwrap(), TxOutcome::Done(None));
    db.commit(tx).unwrap();
}

#[test]
fn checkpoint_is_idempotent_and_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let tx = db.begin();
    db.set(tx, b"k", b"v").unwrap();
    db.commit(tx).unwrap();

    db.checkpoint().unwrap();
    db.checkpoint().unwrap();

    let tx = db.begin();
    assert_eq!(db.get(tx, b"k").unwrap(), TxOutcome::Done(Some(b"v".to_vec())));
    db.commit(tx).unwrap();
}

/// A deadlock between two transactions each holding an exclusive content
/// lock the other wants next: `break_deadlocks` must pick exactly one
/// victim, and rolling it back frees the survivor to proceed.
#[test]
fn deadlock_between_two_transactions_is_broken() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());

    let setup = db.begin();
    db.set(setup, b"a", b"init").unwrap();
    db.set(setup, b"b", b"init").unwrap();
    db.commit(setup).unwrap();

    let tx1 = db.begin();
    let tx2 = db.begin();

    assert_eq!(db.set(tx1, b"a", b"tx1").unwrap(), TxOutcome::Done(()));
    assert_eq!(db.set(tx2, b"b", b"tx2").unwrap(), TxOutcome::Done(()));
    assert_eq!(db.set(tx1, b"b", b"tx1-wants-b").unwrap(), TxOutcome::Blocked);
    assert_eq!(db.set(tx2, b"a", b"tx2-wants-a").unwrap(), TxOutcome::Blocked);

    let victims = db.break_deadlocks().unwrap();
    assert_eq!(victims.len(), 1);
    let victim = victims[0];
    let survivor = if victim == tx1 { tx2 } else { tx1 };

    assert_eq!(
        db.set(survivor, if survivor == tx1 { b"b" } else { b"a" }, b"now-unblocked").unwrap(),
        TxOutcome::Done(())
    );
    db.commit(survivor).unwrap();
}

/// Same scenario driven through the cooperative dispatcher instead of
/// calling `Database` directly: requests queue, one `tick` advances the
/// non-blocked ones, and `detect_deadlocks` resolves the cycle.
#[test]
fn dispatcher_ticks_through_a_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let mut dispatcher = Dispatcher::new(db);

    dispatcher.submit(Request::Begin);
    let responses = dispatcher.tick().unwrap();
    let Response::Began(setup) = responses[0] else { panic!("expected Began") };
    dispatcher.submit(Request::Set { tx_id: setup, key: b"a".to_vec(), value: b"init".to_vec() });
    dispatcher.submit(Request::Set { tx_id: setup, key: b"b".to_vec(), value: b"init".to_vec() });
    dispatcher.submit(Request::Commit { tx_id: setup });
    for _ in 0..3 {
        dispatcher.tick().unwrap();
    }

    dispatcher.submit(Request::Begin);
    let tx1 = match dispatcher.tick().unwrap().as_slice() {
        [Response::Began(id)] => *id,
        other => panic!("unexpected {other:?}"),
    };
    dispatcher.submit(Request::Begin);
    let tx2 = match dispatcher.tick().unwrap().as_slice() {
        [Response::Began(id)] => *id,
        other => panic!("unexpected {other:?}"),
    };

    dispatcher.submit(Request::Set { tx_id: tx1, key: b"a".to_vec(), value: b"tx1".to_vec() });
    dispatcher.tick().unwrap();
    dispatcher.submit(Request::Set { tx_id: tx2, key: b"b".to_vec(), value: b"tx2".to_vec() });
    dispatcher.tick().unwrap();

    dispatcher.submit(Request::Set { tx_id: tx1, key: b"b".to_vec(), value: b"tx1-wants-b".to_vec() });
    dispatcher.tick().unwrap();
    dispatcher.submit(Request::Set { tx_id: tx2, key: b"a".to_vec(), value: b"tx2-wants-a".to_vec() });
    dispatcher.tick().unwrap();

    let responses = dispatcher.detect_deadlocks().unwrap();
    assert_eq!(responses.len(), 1);
    let Response::Aborted { tx_id: victim, .. } = responses[0] else {
        panic!("expected Aborted")
    };
    assert!(victim == tx1 || victim == tx2);

    // The survivor's previously blocked request now drains on the next tick.
    let drained = dispatcher.tick().unwrap();
    assert!(drained.iter().any(|r| matches!(r, Response::Ok)));
}
