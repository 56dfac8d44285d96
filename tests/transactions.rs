//! End-to-end transaction behavior over a real database file.

use galdrdb::{
    encode_key, CollectionSchema, Config, Database, GaldrError, IndexKey, IndexSpec, KeyComponent,
};
use tempfile::tempdir;

fn small_config() -> Config {
    Config {
        page_size: 4096,
        ..Config::default()
    }
}

fn email_key(value: &str) -> Vec<u8> {
    encode_key(&[KeyComponent::Text(value)]).expect("key")
}

#[test]
fn create_open_read_round_trip() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("roundtrip.gdb");

    {
        let db = Database::create(&path, small_config()).expect("create");
        db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert_with_id("docs", 1, vec![0x41, 0x42, 0x43], Vec::new())
            .expect("insert");
        tx.commit().expect("commit");
        db.close().expect("close");
    }

    let db = Database::open(&path, small_config()).expect("open");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(
        tx.get("docs", 1).expect("get"),
        Some(vec![0x41, 0x42, 0x43]),
        "bytes round-trip exactly"
    );
}

#[test]
fn create_refuses_existing_file() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("existing.gdb");
    let _db = Database::create(&path, small_config()).expect("create");
    assert!(matches!(
        Database::create(&path, small_config()),
        Err(GaldrError::InvalidArgument(_))
    ));
}

#[test]
fn read_your_own_writes() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("ryow.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut tx = db.begin_transaction().expect("begin");
    let id = tx.insert("docs", b"draft".to_vec(), Vec::new()).expect("insert");
    assert_eq!(tx.get("docs", id).expect("get"), Some(b"draft".to_vec()));

    tx.update("docs", id, b"final".to_vec(), Vec::new(), Vec::new())
        .expect("update own insert");
    assert_eq!(tx.get("docs", id).expect("get"), Some(b"final".to_vec()));

    tx.delete("docs", id, Vec::new()).expect("delete own insert");
    assert_eq!(tx.get("docs", id).expect("get"), None);
    tx.commit().expect("empty-net commit");

    // Net effect was nothing; the id never became visible.
    let mut reader = db.begin_read_only_transaction().expect("begin");
    assert_eq!(reader.get("docs", id).expect("get"), None);
}

#[test]
fn rollback_leaves_no_visible_state() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("rollback.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let id = {
        let mut tx = db.begin_transaction().expect("begin");
        let id = tx.insert("docs", b"doomed".to_vec(), Vec::new()).expect("insert");
        tx.rollback().expect("rollback");
        id
    };
    let mut reader = db.begin_read_only_transaction().expect("begin");
    assert_eq!(reader.get("docs", id).expect("get"), None);

    // A dropped transaction rolls back implicitly.
    {
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert("docs", b"also doomed".to_vec(), Vec::new()).expect("insert");
    }
    let mut reader = db.begin_read_only_transaction().expect("begin");
    assert!(reader.scan("docs").expect("scan").is_empty());
}

#[test]
fn empty_commit_writes_no_wal_frames() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("empty.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let frames_before = db.stats().expect("stats").wal_committed_frames;
    let tx = db.begin_transaction().expect("begin");
    tx.commit().expect("empty commit");
    let frames_after = db.stats().expect("stats").wal_committed_frames;
    assert_eq!(frames_before, frames_after, "empty commit is a no-op");
}

#[test]
fn monotonic_ids_within_process() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("monotonic.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut highest = 0;
    for round in 0..5 {
        let mut tx = db.begin_transaction().expect("begin");
        let id = tx.insert("docs", vec![round], Vec::new()).expect("insert");
        assert!(id > highest, "id {id} must exceed {highest}");
        highest = id;
        if round % 2 == 0 {
            tx.delete("docs", id, Vec::new()).expect("delete");
        }
        tx.commit().expect("commit");
    }

    // Ids burned by aborted transactions stay burned.
    {
        let mut tx = db.begin_transaction().expect("begin");
        let id = tx.insert("docs", b"burned".to_vec(), Vec::new()).expect("insert");
        assert!(id > highest);
        highest = id;
        tx.rollback().expect("rollback");
    }
    let mut tx = db.begin_transaction().expect("begin");
    let id = tx.insert("docs", b"after".to_vec(), Vec::new()).expect("insert");
    assert!(id > highest);
    tx.commit().expect("commit");
}

#[test]
fn unique_index_rejects_duplicates() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("unique.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema {
        name: "users".into(),
        indexes: vec![IndexSpec {
            name: "email".into(),
            unique: true,
        }],
    })
    .expect("collection");

    let key = email_key("a@x");
    let mut tx = db.begin_transaction().expect("begin");
    tx.insert_with_id(
        "users",
        1,
        b"{\"email\":\"a@x\"}".to_vec(),
        vec![IndexKey::new("email", Some(key.clone()))],
    )
    .expect("first insert");
    tx.commit().expect("commit");

    let mut tx = db.begin_transaction().expect("begin");
    tx.insert_with_id(
        "users",
        2,
        b"{\"email\":\"a@x\"}".to_vec(),
        vec![IndexKey::new("email", Some(key.clone()))],
    )
    .expect("staging the duplicate is fine");
    match tx.commit() {
        Err(GaldrError::UniqueConstraintViolation { index, key: k }) => {
            assert_eq!(index, "email");
            assert_eq!(k, key);
        }
        other => panic!("expected UniqueConstraintViolation, got {other:?}"),
    }

    // Null keys never collide.
    let mut tx = db.begin_transaction().expect("begin");
    tx.insert_with_id("users", 3, b"{}".to_vec(), vec![IndexKey::new("email", None)])
        .expect("null key");
    tx.commit().expect("commit");
    let mut tx = db.begin_transaction().expect("begin");
    tx.insert_with_id("users", 4, b"{}".to_vec(), vec![IndexKey::new("email", None)])
        .expect("second null key");
    tx.commit().expect("commit");

    // Deleting the holder frees the key.
    let mut tx = db.begin_transaction().expect("begin");
    tx.delete("users", 1, vec![IndexKey::new("email", Some(key.clone()))])
        .expect("delete");
    tx.commit().expect("commit");
    let mut tx = db.begin_transaction().expect("begin");
    tx.insert_with_id(
        "users",
        5,
        b"{\"email\":\"a@x\"}".to_vec(),
        vec![IndexKey::new("email", Some(key))],
    )
    .expect("key reusable after delete");
    tx.commit().expect("commit");
}

#[test]
fn secondary_index_scans_follow_updates() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("index.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema {
        name: "users".into(),
        indexes: vec![IndexSpec {
            name: "city".into(),
            unique: false,
        }],
    })
    .expect("collection");

    let city = |name: &str| encode_key(&[KeyComponent::Text(name)]).expect("key");
    let mut tx = db.begin_transaction().expect("begin");
    for (id, c) in [(1u32, "oslo"), (2, "oslo"), (3, "bergen")] {
        tx.insert_with_id(
            "users",
            id,
            format!("user-{id}").into_bytes(),
            vec![IndexKey::new("city", Some(city(c)))],
        )
        .expect("insert");
    }
    tx.commit().expect("commit");

    let mut tx = db.begin_read_only_transaction().expect("begin");
    let oslo: Vec<u32> = tx
        .index_exact("users", "city", &city("oslo"))
        .expect("exact")
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(oslo.len(), 2);
    assert!(oslo.contains(&1) && oslo.contains(&2));
    drop(tx);

    // Move user 2 to bergen; scans reflect the change.
    let mut tx = db.begin_transaction().expect("begin");
    tx.update(
        "users",
        2,
        b"user-2-moved".to_vec(),
        vec![IndexKey::new("city", Some(city("bergen")))],
        vec![IndexKey::new("city", Some(city("oslo")))],
    )
    .expect("update");
    tx.commit().expect("commit");

    let mut tx = db.begin_read_only_transaction().expect("begin");
    let oslo = tx.index_exact("users", "city", &city("oslo")).expect("exact");
    assert_eq!(oslo.len(), 1);
    assert_eq!(oslo[0].0, 1);
    let bergen: Vec<u32> = tx
        .index_exact("users", "city", &city("bergen"))
        .expect("exact")
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert!(bergen.contains(&2) && bergen.contains(&3));
}

#[test]
fn scans_and_ranges_see_consistent_rows() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("scan.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut tx = db.begin_transaction().expect("begin");
    for i in 1..=50u32 {
        tx.insert_with_id("docs", i, vec![i as u8], Vec::new()).expect("insert");
    }
    tx.commit().expect("commit");

    let mut tx = db.begin_read_only_transaction().expect("begin");
    let all = tx.scan("docs").expect("scan");
    assert_eq!(all.len(), 50);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

    let mid = tx.scan_range("docs", 10, 20).expect("range");
    assert_eq!(mid.len(), 11);
    assert_eq!(mid.first().expect("lo").0, 10);
    assert_eq!(mid.last().expect("hi").0, 20);
}

#[test]
fn wal_disabled_still_round_trips() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("nowal.gdb");
    let config = Config {
        page_size: 4096,
        use_wal: false,
        ..Config::default()
    };

    {
        let db = Database::create(&path, config.clone()).expect("create");
        db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert_with_id("docs", 1, b"direct".to_vec(), Vec::new()).expect("insert");
        tx.commit().expect("commit");
        db.close().expect("close");
    }

    let db = Database::open(&path, config).expect("open");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("docs", 1).expect("get"), Some(b"direct".to_vec()));
}

#[test]
fn read_only_open_refuses_writes() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("ro.gdb");
    {
        let db = Database::create(&path, small_config()).expect("create");
        db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert_with_id("docs", 1, b"frozen".to_vec(), Vec::new()).expect("insert");
        tx.commit().expect("commit");
        db.close().expect("close");
    }

    let config = Config {
        read_only: true,
        ..small_config()
    };
    let db = Database::open(&path, config).expect("open read-only");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("docs", 1).expect("get"), Some(b"frozen".to_vec()));
    drop(tx);

    let mut tx = db.begin_transaction().expect("begin");
    assert!(matches!(
        tx.insert("docs", b"nope".to_vec(), Vec::new()),
        Err(GaldrError::InvalidArgument(_))
    ));
    assert!(db.create_collection(&CollectionSchema::plain("more")).is_err());
}

#[test]
fn large_documents_round_trip_through_extents() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("extent.gdb"), small_config()).expect("create");
    db.create_collection(&CollectionSchema::plain("blobs")).expect("collection");

    // One byte past a page forces a two-page extent; a bigger blob spans
    // several pages.
    let medium: Vec<u8> = (0..4097usize).map(|i| (i % 251) as u8).collect();
    let big: Vec<u8> = (0..40_000usize).map(|i| (i % 239) as u8).collect();

    let mut tx = db.begin_transaction().expect("begin");
    let medium_id = tx.insert("blobs", medium.clone(), Vec::new()).expect("insert");
    let big_id = tx.insert("blobs", big.clone(), Vec::new()).expect("insert");
    tx.commit().expect("commit");

    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("blobs", medium_id).expect("get"), Some(medium));
    assert_eq!(tx.get("blobs", big_id).expect("get"), Some(big));
}
