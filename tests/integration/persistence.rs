#![allow(missing_docs)]

mod util;

use arbor::{ArborError, EngineOptions, ReadOptions, StorageEngine, Value};
use tempfile::tempdir;
use util::{arr, num, obj, open_engine, open_engine_with, text};

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let value = obj(vec![
        ("name", text("persistent")),
        ("nested", obj(vec![("list", arr(vec![num(1.0), num(2.0)]))])),
        ("large", text(&"z".repeat(2000))),
    ]);

    {
        let engine = open_engine(&dir);
        engine.set_node("docs/1", value.clone()).await.expect("set");
        engine.flush().expect("flush");
    }

    let engine = open_engine(&dir);
    let read = engine
        .get_node("docs/1", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists after reopen");
    assert_eq!(read, value);
}

#[tokio::test]
async fn interned_keys_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let engine = open_engine(&dir);
        engine
            .set_node(
                "a",
                obj(vec![("created", num(1.0)), ("modified", num(2.0))]),
            )
            .await
            .expect("set");
    }

    let engine = open_engine(&dir);
    let stats = engine.stats();
    assert!(
        stats.kit_keys >= 2,
        "eligible keys must be interned and persisted"
    );
    // Another node reusing the same keys decodes through the reloaded table.
    engine
        .set_node(
            "b",
            obj(vec![("created", num(3.0)), ("modified", num(4.0))]),
        )
        .await
        .expect("set reusing keys");
    let read = engine
        .get_node("b", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(
        read,
        obj(vec![("created", num(3.0)), ("modified", num(4.0))])
    );
    assert_eq!(engine.stats().kit_keys, stats.kit_keys, "no duplicates");
}

#[tokio::test]
async fn free_space_is_reused_after_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let engine = open_engine(&dir);
        engine
            .set_node("tmp", obj(vec![("blob", Value::Binary(vec![7u8; 4000]))]))
            .await
            .expect("set");
        engine.remove_node("tmp").await.expect("remove");
        engine.flush().expect("flush");
    }

    let engine = open_engine(&dir);
    let before = engine.stats().fst.expect("fst").free_records;
    assert!(before > 0, "removed blob must have freed records");

    engine
        .set_node("tmp2", obj(vec![("blob", Value::Binary(vec![9u8; 4000]))]))
        .await
        .expect("set after reopen");
    let after = engine.stats().fst.expect("fst").free_records;
    assert!(after < before, "new blob must consume freed records");
}

#[tokio::test]
async fn file_parameters_override_open_options() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("data.arbor");
    {
        let engine = StorageEngine::open(
            &path,
            EngineOptions::default().record_size(64).page_size(128),
        )
        .expect("create with custom sizes");
        engine
            .set_node("x", obj(vec![("v", num(42.0))]))
            .await
            .expect("set");
    }

    // Reopening with default options must pick the sizes up from the header.
    let engine = StorageEngine::open(&path, EngineOptions::default()).expect("reopen");
    let read = engine
        .get_node("x", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, obj(vec![("v", num(42.0))]));
}

#[tokio::test]
async fn maintenance_lock_blocks_structural_writes() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("a", obj(vec![("v", num(1.0))]))
        .await
        .expect("set before lock");
    engine.set_maintenance_lock(true).expect("lock");

    let err = engine
        .set_node("a", obj(vec![("v", num(2.0))]))
        .await
        .expect_err("writes must be refused while locked");
    assert!(matches!(err, ArborError::Lock { .. }), "got: {err}");

    // Reads still work.
    let read = engine
        .get_node("a", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, obj(vec![("v", num(1.0))]));

    engine.set_maintenance_lock(false).expect("unlock");
    engine
        .set_node("a", obj(vec![("v", num(3.0))]))
        .await
        .expect("writes resume after unlock");
}

#[tokio::test]
async fn custom_options_are_validated() {
    let dir = tempdir().expect("tempdir");
    let result = StorageEngine::open(
        &dir.path().join("bad.arbor"),
        EngineOptions::default().max_inline_value_size(100),
    );
    assert!(matches!(result, Err(ArborError::InvalidArgument(_))));
    drop(open_engine_with(&dir, EngineOptions::default()));
}
