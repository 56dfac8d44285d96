//! At-rest encryption: sealed pages, password checks, WAL recovery.

use galdrdb::{CollectionSchema, Config, Database, EncryptionConfig, GaldrError};
use tempfile::tempdir;

fn encrypted_config(password: &str) -> Config {
    Config {
        page_size: 4096,
        encryption: Some(EncryptionConfig {
            password: password.into(),
            // The minimum the config accepts; production callers go higher.
            kdf_iterations: 500_000,
        }),
        ..Config::default()
    }
}

#[test]
fn encrypted_round_trip_and_password_checks() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("sealed.gdb");

    {
        let db = Database::create(&path, encrypted_config("open sesame")).expect("create");
        db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
        let mut tx = db.begin_transaction().expect("begin");
        tx.insert_with_id("docs", 1, b"classified".to_vec(), Vec::new())
            .expect("insert");
        tx.commit().expect("commit");
        db.close().expect("close");
    }

    // The plaintext must not appear in the file image.
    let raw = std::fs::read(&path).expect("read file");
    assert!(
        !raw.windows(b"classified".len()).any(|w| w == b"classified"),
        "document bytes leaked to disk in the clear"
    );

    match Database::open(&path, encrypted_config("wrong password")) {
        Err(GaldrError::InvalidArgument(msg)) => {
            assert!(msg.contains("password"), "unexpected message: {msg}")
        }
        other => panic!("expected a password error, got {other:?}"),
    }
    assert!(
        matches!(
            Database::open(&path, Config { page_size: 4096, ..Config::default() }),
            Err(GaldrError::InvalidArgument(_))
        ),
        "opening without a password must fail"
    );

    let db = Database::open(&path, encrypted_config("open sesame")).expect("open");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    assert_eq!(tx.get("docs", 1).expect("get"), Some(b"classified".to_vec()));
}

#[test]
fn encrypted_wal_recovery() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("sealed_crash.gdb");

    {
        let db = Database::create(&path, encrypted_config("hunter2")).expect("create");
        db.create_collection(&CollectionSchema::plain("docs")).expect("collection");
        for i in 1..=20u32 {
            let mut tx = db.begin_transaction().expect("begin");
            tx.insert_with_id("docs", i, vec![i as u8; 100], Vec::new())
                .expect("insert");
            tx.commit().expect("commit");
        }
        std::mem::forget(db); // crash before checkpoint
    }

    let db = Database::open(&path, encrypted_config("hunter2")).expect("recovering open");
    let mut tx = db.begin_read_only_transaction().expect("begin");
    for i in 1..=20u32 {
        assert_eq!(tx.get("docs", i).expect("get"), Some(vec![i as u8; 100]));
    }
    assert!(db.verify().expect("verify").is_empty());
}
