//! Garbage collection, vacuum, checkpoint, and whole-file compaction.

use galdrdb::{CollectionSchema, Config, Database};
use tempfile::tempdir;

fn config() -> Config {
    Config {
        page_size: 4096,
        auto_gc: false,
        auto_checkpoint: false,
        ..Config::default()
    }
}

#[test]
fn gc_reclaims_superseded_versions() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("gc.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut tx = db.begin_transaction().expect("begin");
    let id = tx.insert("docs", vec![1u8; 200], Vec::new()).expect("insert");
    tx.commit().expect("commit");

    for round in 0..9u8 {
        let mut tx = db.begin_transaction().expect("begin");
        tx.update("docs", id, vec![round; 200], Vec::new(), Vec::new())
            .expect("update");
        tx.commit().expect("commit");
    }
    assert_eq!(db.get_version_count("docs", id), 10);

    let frag_before: usize = db
        .fragmentation()
        .expect("fragmentation")
        .iter()
        .map(|e| e.physical_free)
        .sum();

    // No readers hold a snapshot, so the whole history is collectable.
    let stats = db.run_gc().expect("gc");
    assert_eq!(stats.collected_versions, 9);
    assert!(stats.freed_slots >= 8, "freed {} slots", stats.freed_slots);
    assert_eq!(db.get_version_count("docs", id), 1);

    // Compaction-visible space grew on the affected pages.
    db.vacuum().expect("vacuum");
    let frag_after: usize = db
        .fragmentation()
        .expect("fragmentation")
        .iter()
        .map(|e| e.physical_free)
        .sum();
    assert!(
        frag_after > frag_before,
        "free space should grow: {frag_before} -> {frag_after}"
    );

    // The surviving version still reads back.
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("docs", id).expect("get"), Some(vec![8u8; 200]));
}

#[test]
fn gc_waits_for_old_snapshots() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("gc_wait.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut tx = db.begin_transaction().expect("begin");
    let id = tx.insert("docs", b"old".to_vec(), Vec::new()).expect("insert");
    tx.commit().expect("commit");

    let mut reader = db.begin_read_only_transaction().expect("pin snapshot");
    assert_eq!(reader.get("docs", id).expect("read"), Some(b"old".to_vec()));

    let mut tx = db.begin_transaction().expect("begin");
    tx.update("docs", id, b"new".to_vec(), Vec::new(), Vec::new()).expect("update");
    tx.commit().expect("commit");

    let stats = db.run_gc().expect("gc");
    assert_eq!(stats.freed_slots, 0, "pinned history must not be freed");
    assert_eq!(reader.get("docs", id).expect("read"), Some(b"old".to_vec()));
    drop(reader);

    let stats = db.run_gc().expect("gc after release");
    assert_eq!(stats.freed_slots, 1);
}

#[test]
fn vacuum_truncates_trailing_free_space() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("vacuum.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    // Grow the file with bulky documents, then delete them all.
    let mut ids = Vec::new();
    for _ in 0..20 {
        let mut tx = db.begin_transaction().expect("begin");
        ids.push(tx.insert("docs", vec![7u8; 12_000], Vec::new()).expect("insert"));
        tx.commit().expect("commit");
    }
    let pages_grown = db.stats().expect("stats").total_pages;

    let mut tx = db.begin_transaction().expect("begin");
    for id in &ids {
        tx.delete("docs", *id, Vec::new()).expect("delete");
    }
    tx.commit().expect("commit");

    let stats = db.vacuum().expect("vacuum");
    assert!(stats.truncated_pages > 0, "tail pages should be trimmed");
    let pages_after = db.stats().expect("stats").total_pages;
    assert!(
        pages_after < pages_grown,
        "file should shrink: {pages_grown} -> {pages_after}"
    );
    assert!(db.verify().expect("verify").is_empty());

    // The database stays fully usable after the sweep.
    let mut tx = db.begin_transaction().expect("begin");
    let id = tx.insert("docs", b"post-vacuum".to_vec(), Vec::new()).expect("insert");
    tx.commit().expect("commit");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("docs", id).expect("get"), Some(b"post-vacuum".to_vec()));
}

#[test]
fn checkpoint_truncates_the_wal() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("ckpt.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    for i in 0..50u8 {
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert("docs", vec![i; 100], Vec::new()).expect("insert");
        tx.commit().expect("commit");
    }
    let wal_before = db.stats().expect("stats").wal_size;
    assert!(wal_before > 64, "commits should have grown the WAL");

    db.checkpoint().expect("checkpoint");
    let stats = db.stats().expect("stats");
    assert_eq!(stats.wal_committed_frames, 0);
    assert!(stats.wal_size < wal_before, "WAL should be truncated");

    // Everything still reads after the log is gone.
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.scan("docs").expect("scan").len(), 50);
}

#[test]
fn compact_to_preserves_the_live_snapshot() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("source.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema {
        name: "users".into(),
        indexes: vec![galdrdb::IndexSpec {
            name: "name".into(),
            unique: false,
        }],
    })
    .expect("collection");

    let name_key = |n: &str| {
        galdrdb::encode_key(&[galdrdb::KeyComponent::Text(n)]).expect("key")
    };
    let mut tx = db.begin_transaction().expect("begin");
    for i in 1..=30u32 {
        tx.insert_with_id(
            "users",
            i,
            format!("user-{i}").into_bytes(),
            vec![galdrdb::IndexKey::new("name", Some(name_key(&format!("n{i:02}"))))],
        )
        .expect("insert");
    }
    tx.commit().expect("commit");
    let mut tx = db.begin_transaction().expect("begin");
    for i in (1..=30u32).step_by(3) {
        tx.delete("users", i, vec![galdrdb::IndexKey::new("name", Some(name_key(&format!("n{i:02}"))))])
            .expect("delete");
    }
    tx.commit().expect("commit");

    let target = dir.path().join("compacted.gdb");
    db.compact_to(&target).expect("compact_to");

    let copy = Database::open(&target, config()).expect("open copy");
    let mut src_tx = db.begin_read_only_transaction().expect("begin");
    let mut dst_tx = copy.begin_read_only_transaction().expect("begin");
    assert_eq!(
        src_tx.scan("users").expect("scan"),
        dst_tx.scan("users").expect("scan"),
        "the copy holds exactly the live snapshot"
    );
    let hits = dst_tx
        .index_exact("users", "name", &name_key("n02"))
        .expect("index survives compaction");
    assert_eq!(hits.len(), 1);
    assert!(copy.verify().expect("verify").is_empty());
}

#[test]
fn drop_collection_releases_its_pages() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("drop.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("keep")).expect("keep");
    db.create_collection(&CollectionSchema::plain("drop")).expect("drop");

    let mut tx = db.begin_transaction().expect("begin");
    tx.insert("keep", b"kept".to_vec(), Vec::new()).expect("insert");
    for i in 0..50u8 {
        tx.insert("drop", vec![i; 500], Vec::new()).expect("insert");
    }
    tx.commit().expect("commit");

    let allocated_before = db.stats().expect("stats").allocated_pages;
    db.drop_collection("drop").expect("drop collection");
    let allocated_after = db.stats().expect("stats").allocated_pages;
    assert!(allocated_after < allocated_before);
    assert_eq!(db.collections(), vec!["keep".to_string()]);
    assert!(db.verify().expect("verify").is_empty());

    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.scan("keep").expect("scan").len(), 1);
    assert!(tx.scan("drop").is_err(), "dropped collection is unknown");
}

#[test]
fn stats_reflect_the_file_layout() {
    let dir = tempdir().expect("tmpdir");
    let db = Database::create(dir.path().join("stats.gdb"), config()).expect("create");
    db.create_collection(&CollectionSchema::plain("docs")).expect("collection");

    let mut tx = db.begin_transaction().expect("begin");
    for i in 0..100u8 {
        tx.insert("docs", vec![i; 300], Vec::new()).expect("insert");
    }
    tx.commit().expect("commit");

    let stats = db.stats().expect("stats");
    assert_eq!(stats.page_size, 4096);
    assert!(stats.doc_pages > 0);
    assert!(stats.tree_pages > 0);
    assert!(stats.map_pages >= 2);
    assert!(stats.allocated_pages <= stats.total_pages);
    assert_eq!(stats.collections.len(), 1);
    assert_eq!(stats.collections[0].doc_count, 100);
    assert_eq!(stats.version_chains, 100);
}
