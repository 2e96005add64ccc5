#![allow(missing_docs)]

mod util;

use std::sync::Arc;
use std::time::Duration;

use arbor::{NodeLocker, PathInfo, ReadOptions, Value};
use tempfile::tempdir;
use util::{num, obj, open_engine};

#[tokio::test]
async fn second_write_lock_waits_for_first() {
    let locker = NodeLocker::new(Duration::from_secs(5));
    let path = PathInfo::parse("a/b").expect("path");

    let first = locker
        .lock(&path, locker.next_transaction_id(), true, "first write")
        .await
        .expect("first lock");

    let locker2 = locker.clone();
    let path2 = path.clone();
    let second = tokio::spawn(async move {
        locker2
            .lock(&path2, locker2.next_transaction_id(), true, "second write")
            .await
            .expect("second lock")
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished(), "second writer must still be waiting");

    first.release();
    let second = second.await.expect("second writer granted");
    drop(second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_never_lose_updates() {
    let dir = tempdir().expect("tempdir");
    let engine = Arc::new(open_engine(&dir));

    engine
        .set_node("counters", obj(vec![("hits", num(0.0))]))
        .await
        .expect("seed counter");

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .transact_node("counters/hits", |current| {
                    let current = match current {
                        Some(Value::Number(n)) => n,
                        _ => 0.0,
                    };
                    Some(num(current + 1.0))
                })
                .await
                .expect("transact");
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    let read = engine
        .get_node("counters/hits", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, num(20.0), "every increment must be applied");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_on_siblings_keep_both() {
    let dir = tempdir().expect("tempdir");
    let engine = Arc::new(open_engine(&dir));

    engine
        .set_node("users", obj(vec![("seed", num(0.0))]))
        .await
        .expect("seed");

    let mut tasks = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .set_node(&format!("users/u{i}"), obj(vec![("id", num(i as f64))]))
                .await
                .expect("set sibling");
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    for i in 0..10 {
        let read = engine
            .get_node(&format!("users/u{i}"), &ReadOptions::all())
            .await
            .expect("get")
            .expect("sibling must exist");
        assert_eq!(read, obj(vec![("id", num(i as f64))]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_torn_writes() {
    let dir = tempdir().expect("tempdir");
    let engine = Arc::new(open_engine(&dir));

    // Writers flip between two internally-consistent documents; readers must
    // only ever see one of them.
    let doc = |generation: f64| {
        obj(vec![
            ("generation", num(generation)),
            ("check", num(generation * 2.0)),
        ])
    };
    engine.set_node("state", doc(0.0)).await.expect("seed");

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for generation in 1..=25 {
                engine
                    .set_node("state", doc(generation as f64))
                    .await
                    .expect("write generation");
            }
        })
    };

    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let read = engine
                    .get_node("state", &ReadOptions::all())
                    .await
                    .expect("read")
                    .expect("state exists");
                let Value::Object(map) = read else {
                    panic!("state must be an object");
                };
                let generation = match map.get("generation") {
                    Some(Value::Number(n)) => *n,
                    other => panic!("generation missing: {other:?}"),
                };
                match map.get("check") {
                    Some(Value::Number(check)) => {
                        assert_eq!(*check, generation * 2.0, "torn read observed");
                    }
                    other => panic!("check missing: {other:?}"),
                }
            }
        })
    };

    writer.await.expect("writer");
    reader.await.expect("reader");
}
