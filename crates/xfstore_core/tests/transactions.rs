//! Transaction behavior through the public engine API.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use xfstore_core::{
    Config, CoreError, GlobalXid, ItemKind, Point, TransactionManager, TransactionalItem, XaOutcome,
    XaVote, Xid,
};
use xfstore_storage::ItemId;

fn id(text: &str) -> ItemId {
    ItemId::parse(text).unwrap()
}

fn open_store(lock_timeout: Duration) -> (TempDir, TransactionManager) {
    let dir = tempdir().unwrap();
    let config = Config::new()
        .lock_timeout(lock_timeout)
        .sync_on_commit(false)
        .sync_on_recovery(false);
    let tm = TransactionManager::open(dir.path(), config).unwrap();
    (dir, tm)
}

fn commit_range(tm: &TransactionManager, name: &str, bytes: &[u8]) {
    let xid = tm.begin().unwrap();
    let item = tm.open_range(&xid, &id(name), true).unwrap();
    item.write(&xid, 0, bytes, 1).unwrap();
    tm.commit(&xid).unwrap();
}

#[test]
fn written_bytes_are_readable_after_commit() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let t1 = tm.begin().unwrap();
    let item = tm.open_range(&t1, &id("/ts/a"), true).unwrap();
    item.write(&t1, 0, b"ABCD", 1).unwrap();
    assert!(!tm.prepare(&t1).unwrap());
    tm.commit(&t1).unwrap();

    let read = tm.read_committed_range(&id("/ts/a"), 0, 4).unwrap();
    assert_eq!(read.data, b"ABCD");
    assert_eq!(read.valid.iter().collect::<Vec<_>>(), vec![(0, 3)]);
}

#[test]
fn transaction_sees_its_own_writes_and_others_see_committed_state() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    commit_range(&tm, "/ts/own", b"old!");

    let t = tm.begin().unwrap();
    let item = tm.open_range(&t, &id("/ts/own"), false).unwrap();
    item.write(&t, 0, b"new!", 2).unwrap();
    assert_eq!(item.read(&t, 0, 4).unwrap().data, b"new!");
    assert_eq!(tm.read_committed_range(&id("/ts/own"), 0, 4).unwrap().data, b"old!");
    tm.commit(&t).unwrap();
    assert_eq!(tm.read_committed_range(&id("/ts/own"), 0, 4).unwrap().data, b"new!");
}

#[test]
fn holder_blocks_other_transactions_until_it_finishes() {
    let (_dir, tm) = open_store(Duration::from_millis(200));
    commit_range(&tm, "/ts/held", b"0000");

    let a = tm.begin().unwrap();
    let item = tm.open_range(&a, &id("/ts/held"), false).unwrap();
    item.write(&a, 0, b"AAAA", 1).unwrap();
    item.write(&a, 4, b"aaaa", 1).unwrap();

    let b = tm.begin().unwrap();
    let err = tm.open_range(&b, &id("/ts/held"), false).unwrap_err();
    assert!(err.is_lock_timeout(), "{err}");
    assert_eq!(tm.stats().lock_timeouts, 1);

    tm.commit(&a).unwrap();
    let item = tm.open_range(&b, &id("/ts/held"), false).unwrap();
    assert_eq!(item.read(&b, 0, 8).unwrap().data, b"AAAAaaaa");
    tm.rollback(&b).unwrap();
}

#[test]
fn concurrent_prepares_of_overlapping_items_both_finish() {
    let (_dir, tm) = open_store(Duration::from_secs(5));
    commit_range(&tm, "/ts/x", b"x");
    commit_range(&tm, "/ts/y", b"y");

    for _ in 0..10 {
        let xids: Vec<_> = (0..2).map(|_| tm.begin().unwrap()).collect();
        for (xid, order) in xids.iter().zip([["/ts/x", "/ts/y"], ["/ts/y", "/ts/x"]]) {
            for name in order {
                tm.open_range(xid, &id(name), false).unwrap();
            }
        }
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = xids
            .into_iter()
            .map(|xid| {
                let (tm, barrier) = (tm.clone(), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    tm.commit(&xid)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }
    assert!(tm.transactions().is_empty());
}

#[test]
fn concurrent_opens_share_one_item_object() {
    let (_dir, tm) = open_store(Duration::from_secs(2));
    commit_range(&tm, "/ts/shared", b"s");

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (tm, barrier) = (tm.clone(), Arc::clone(&barrier));
            thread::spawn(move || {
                let xid = tm.begin().unwrap();
                barrier.wait();
                let item = tm.open_range(&xid, &id("/ts/shared"), false).unwrap();
                (xid, item)
            })
        })
        .collect();
    let opened: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(opened
        .iter()
        .all(|(_, item)| Arc::ptr_eq(item, &opened[0].1)));
    assert_eq!(tm.open_item_count(), 1);

    for (xid, _) in &opened {
        tm.rollback(xid).unwrap();
    }
    assert_eq!(tm.open_item_count(), 0);
}

#[test]
fn rollback_restores_content_and_is_not_repeated() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    commit_range(&tm, "/ts/r", b"ABCD");

    let t = tm.begin().unwrap();
    let item = tm.open_range(&t, &id("/ts/r"), false).unwrap();
    item.write(&t, 0, b"ZZZZ", 9).unwrap();
    item.delete_interval(&t, 2, 3).unwrap();
    tm.rollback(&t).unwrap();

    assert_eq!(tm.read_committed_range(&id("/ts/r"), 0, 4).unwrap().data, b"ABCD");
    assert!(matches!(
        tm.rollback(&t),
        Err(CoreError::TransactionNotFound { .. })
    ));
}

#[test]
fn rolled_back_creation_leaves_no_item() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let t = tm.begin().unwrap();
    let item = tm.open_points(&t, &id("/pts/gone"), true).unwrap();
    item.write(&t, 0.0, 1.0, &[Point::new(0.5, 1.0, 1)], false)
        .unwrap();
    assert!(tm.point_item_exists(&t, &id("/pts/gone")).unwrap());
    tm.rollback(&t).unwrap();

    let t = tm.begin().unwrap();
    assert!(!tm.point_item_exists(&t, &id("/pts/gone")).unwrap());
    assert!(tm.find_ids(ItemKind::Points, "/pts").unwrap().is_empty());
    tm.rollback(&t).unwrap();
}

#[test]
fn deleted_item_is_gone_after_commit() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    commit_range(&tm, "/ts/del", b"data");

    let t = tm.begin().unwrap();
    let item = tm.open_range(&t, &id("/ts/del"), false).unwrap();
    item.delete(&t).unwrap();
    assert!(!tm.range_item_exists(&t, &id("/ts/del")).unwrap());
    tm.commit(&t).unwrap();
    assert!(matches!(
        tm.read_committed_range(&id("/ts/del"), 0, 4),
        Err(CoreError::ItemNotFound { .. })
    ));
}

#[test]
fn clean_items_can_be_released_early() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    commit_range(&tm, "/ts/clean", b"c");
    commit_range(&tm, "/ts/dirty", b"d");

    let t = tm.begin().unwrap();
    tm.open_range(&t, &id("/ts/clean"), false).unwrap();
    let dirty = tm.open_range(&t, &id("/ts/dirty"), false).unwrap();
    dirty.write(&t, 0, b"D", 1).unwrap();

    assert!(tm.done_with_item(&t, ItemKind::Range, &id("/ts/clean")).unwrap());
    assert!(!tm.done_with_item(&t, ItemKind::Range, &id("/ts/dirty")).unwrap());
    assert_eq!(tm.transactions()[0].items, 1);
    tm.commit(&t).unwrap();
}

#[test]
fn blob_content_replaces_whole_item() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let t = tm.begin().unwrap();
    let blob = tm.open_blob(&t, &id("/blob/b"), true).unwrap();
    blob.write(&t, 4, b"first").unwrap();
    blob.write(&t, 5, b"second").unwrap();
    assert_eq!(blob.len(&t).unwrap(), 6);
    tm.commit(&t).unwrap();

    let content = tm.read_committed_blob(&id("/blob/b")).unwrap();
    assert_eq!(content.originator, 5);
    assert_eq!(content.data, b"second");
    assert_eq!(tm.find_ids(ItemKind::Blob, "/blob").unwrap(), vec![id("/blob/b")]);
}

#[test]
fn client_work_runs_on_the_transaction_pool() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let t = tm.begin().unwrap();
    let item = tm.open_range(&t, &id("/ts/pool"), true).unwrap();
    let handles: Vec<_> = (0..4i64)
        .map(|n| {
            let (item, xid) = (Arc::clone(&item), t.clone());
            tm.submit(&t, move || item.write(&xid, n * 2, b"ok", n)).unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    tm.commit(&t).unwrap();
    assert_eq!(tm.read_committed_range(&id("/ts/pool"), 0, 8).unwrap().data, b"okokokok");
}

#[test]
fn one_phase_xa_commit() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let g = GlobalXid::new(0x1234, *b"gtrid", *b"bqual");
    tm.start_xa(&g, Some(Duration::from_secs(30))).unwrap();
    let xid: Xid = g.clone().into();
    let item = tm.open_range(&xid, &id("/ts/xa"), true).unwrap();
    item.write(&xid, 0, b"XA", 1).unwrap();
    tm.commit_xa(&g, true).unwrap();
    assert_eq!(tm.read_committed_range(&id("/ts/xa"), 0, 2).unwrap().data, b"XA");
}

#[test]
fn two_phase_xa_commit_requires_prepare() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let g = GlobalXid::new(1, *b"a", *b"b");
    tm.start_xa(&g, None).unwrap();
    let xid: Xid = g.clone().into();
    tm.open_blob(&xid, &id("/blob/xa"), true)
        .unwrap()
        .write(&xid, 1, b"x")
        .unwrap();

    let err = tm.commit_xa(&g, false).unwrap_err();
    assert_eq!(err.outcome, XaOutcome::ResourceManagerError);
    assert_eq!(tm.prepare_xa(&g).unwrap(), XaVote::Ok);
    assert_eq!(tm.recover_xa(), vec![g.clone()]);
    tm.commit_xa(&g, false).unwrap();
    assert!(tm.recover_xa().is_empty());
    assert_eq!(tm.read_committed_blob(&id("/blob/xa")).unwrap().data, b"x");
}

#[test]
fn xa_rollback_of_unknown_branch_is_nota() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    let err = tm.rollback_xa(&GlobalXid::new(9, *b"n", *b"o")).unwrap_err();
    assert_eq!(err.outcome, XaOutcome::UnknownTransaction);
    assert_eq!(err.outcome.code(), -4);
}

#[test]
fn force_rollback_all_clears_live_transactions() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    for n in 0..3 {
        let t = tm.begin().unwrap();
        tm.open_range(&t, &id(&format!("/ts/f{n}")), true).unwrap();
    }
    assert_eq!(tm.transactions().len(), 3);
    assert_eq!(tm.force_rollback_all(), 3);
    assert!(tm.transactions().is_empty());
    assert_eq!(tm.stats().rolled_back, 3);
}

#[test]
fn repeated_reads_hit_the_metadata_cache() {
    let (_dir, tm) = open_store(Duration::from_secs(1));
    commit_range(&tm, "/ts/cached", b"meta");

    let xid = tm.begin().unwrap();
    let item = tm.open_range(&xid, &id("/ts/cached"), false).unwrap();
    item.read(&xid, 0, 4).unwrap();
    let (hits, _) = tm.metadata_cache_counters();
    assert_eq!(item.read(&xid, 0, 4).unwrap().data, b"meta");
    assert!(tm.metadata_cache_counters().0 > hits);
    tm.rollback(&xid).unwrap();
}
