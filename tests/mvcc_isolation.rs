//! Snapshot isolation and first-committer-wins semantics.

use galdrdb::{CollectionSchema, Config, Database, GaldrError};
use tempfile::tempdir;

fn setup(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(
        dir.path().join(name),
        Config {
            page_size: 4096,
            ..Config::default()
        },
    )
    .expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
    (dir, db)
}

#[test]
fn concurrent_update_conflict_names_the_winner() {
    let (_dir, db) = setup("conflict.gdb");

    let mut seed = db.begin_transaction().expect("begin");
    seed.insert_with_id("docs", 7, b"original".to_vec(), Vec::new())
        .expect("insert");
    seed.commit().expect("commit");

    // Both transactions read id 7 at the same snapshot.
    let mut t1 = db.begin_transaction().expect("begin t1");
    let mut t2 = db.begin_transaction().expect("begin t2");
    assert_eq!(t1.get("docs", 7).expect("t1 read"), Some(b"original".to_vec()));
    assert_eq!(t2.get("docs", 7).expect("t2 read"), Some(b"original".to_vec()));

    t1.update("docs", 7, b"from t1".to_vec(), Vec::new(), Vec::new())
        .expect("t1 update");
    let t1_id = t1.id();
    t1.commit().expect("t1 wins");

    t2.update("docs", 7, b"from t2".to_vec(), Vec::new(), Vec::new())
        .expect("t2 update stages fine");
    match t2.commit() {
        Err(GaldrError::WriteConflict {
            collection,
            doc_id,
            conflicting_tx,
        }) => {
            assert_eq!(collection, "docs");
            assert_eq!(doc_id, 7);
            assert_eq!(conflicting_tx, t1_id, "loser learns who beat it");
        }
        other => panic!("expected WriteConflict, got {other:?}"),
    }

    // The winner's bytes survive; a retry on a fresh snapshot succeeds.
    let mut reader = db.begin_read_only_transaction().expect("begin");
    assert_eq!(reader.get("docs", 7).expect("get"), Some(b"from t1".to_vec()));
    drop(reader);
    let mut retry = db.begin_transaction().expect("begin");
    retry
        .update("docs", 7, b"from t2 retry".to_vec(), Vec::new(), Vec::new())
        .expect("update");
    retry.commit().expect("retry commits");
}

#[test]
fn concurrent_insert_and_delete_of_the_same_id() {
    let (_dir, db) = setup("insert_delete.gdb");

    let mut seed = db.begin_transaction().expect("begin");
    seed.insert_with_id("docs", 9, b"target".to_vec(), Vec::new())
        .expect("insert");
    seed.commit().expect("commit");

    let mut deleter = db.begin_transaction().expect("begin");
    let mut updater = db.begin_transaction().expect("begin");
    assert!(deleter.get("docs", 9).expect("read").is_some());
    assert!(updater.get("docs", 9).expect("read").is_some());

    deleter.delete("docs", 9, Vec::new()).expect("delete");
    deleter.commit().expect("delete wins");

    updater
        .update("docs", 9, b"too late".to_vec(), Vec::new(), Vec::new())
        .expect("stage");
    assert!(matches!(
        updater.commit(),
        Err(GaldrError::WriteConflict { doc_id: 9, .. })
    ));
}

#[test]
fn snapshot_stability_under_concurrent_writes() {
    let (_dir, db) = setup("stability.gdb");

    let mut seed = db.begin_transaction().expect("begin");
    seed.insert_with_id("docs", 1, b"v1".to_vec(), Vec::new()).expect("insert");
    seed.commit().expect("commit");

    let mut reader = db.begin_read_only_transaction().expect("begin reader");
    assert_eq!(reader.get("docs", 1).expect("read"), Some(b"v1".to_vec()));

    for round in 2..=5u8 {
        let mut writer = db.begin_transaction().expect("begin writer");
        writer
            .update("docs", 1, vec![b'v', b'0' + round], Vec::new(), Vec::new())
            .expect("update");
        writer.commit().expect("commit");

        // The reader keeps seeing the bytes from its snapshot.
        assert_eq!(
            reader.get("docs", 1).expect("read"),
            Some(b"v1".to_vec()),
            "round {round}: snapshot must be stable"
        );
    }
    drop(reader);

    let mut fresh = db.begin_read_only_transaction().expect("begin");
    assert_eq!(fresh.get("docs", 1).expect("read"), Some(b"v5".to_vec()));
}

#[test]
fn writers_do_not_block_readers() {
    let (_dir, db) = setup("nonblocking.gdb");

    let mut seed = db.begin_transaction().expect("begin");
    for i in 1..=100u32 {
        seed.insert_with_id("docs", i, i.to_le_bytes().to_vec(), Vec::new())
            .expect("insert");
    }
    seed.commit().expect("commit");

    std::thread::scope(|scope| {
        // Writers update a sliding window; readers verify their snapshots.
        for worker in 0..2u32 {
            let db = &db;
            scope.spawn(move || {
                for i in 1..=50u32 {
                    let id = worker * 50 + i;
                    let mut tx = db.begin_transaction().expect("begin");
                    tx.update("docs", id, vec![0xFF; 8], Vec::new(), Vec::new())
                        .expect("update");
                    tx.commit().expect("commit");
                }
            });
        }
        for _ in 0..4 {
            let db = &db;
            scope.spawn(move || {
                for _ in 0..200 {
                    let mut tx = db.begin_read_only_transaction().expect("begin");
                    let rows = tx.scan("docs").expect("scan");
                    assert_eq!(rows.len(), 100, "snapshot always sees all documents");
                    for (id, bytes) in rows {
                        assert!(
                            bytes == id.to_le_bytes().to_vec() || bytes == vec![0xFF; 8],
                            "doc {id} holds bytes from exactly one committed version"
                        );
                    }
                }
            });
        }
    });
}

#[test]
fn first_committer_wins_under_contention() {
    let (_dir, db) = setup("contention.gdb");

    let mut seed = db.begin_transaction().expect("begin");
    seed.insert_with_id("docs", 1, 0u64.to_le_bytes().to_vec(), Vec::new())
        .expect("insert");
    seed.commit().expect("commit");

    let successes = std::sync::atomic::AtomicU64::new(0);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let db = &db;
            let successes = &successes;
            scope.spawn(move || {
                for _ in 0..50 {
                    let mut tx = db.begin_transaction().expect("begin");
                    let Some(bytes) = tx.get("docs", 1).expect("read") else {
                        continue;
                    };
                    let count = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
                    let next = (count + 1).to_le_bytes().to_vec();
                    if tx.update("docs", 1, next, Vec::new(), Vec::new()).is_err() {
                        continue;
                    }
                    match tx.commit() {
                        Ok(()) => {
                            successes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(GaldrError::WriteConflict { .. }) => {}
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                }
            });
        }
    });

    // Lost updates are impossible: the counter equals the successful commits.
    let mut tx = db.begin_read_only_transaction().expect("begin");
    let bytes = tx.get("docs", 1).expect("read").expect("present");
    let count = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    assert_eq!(count, successes.load(std::sync::atomic::Ordering::Relaxed));
}
