#![allow(missing_docs)]

mod util;

use arbor::{PathReference, ReadOptions, Value, ValueType};
use tempfile::tempdir;
use util::{arr, num, obj, open_engine, text};

#[tokio::test]
async fn store_and_round_trip_a_document() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    let value = obj(vec![
        ("a", num(1.0)),
        ("b", text("hello")),
        ("c", obj(vec![("d", arr(vec![num(1.0), num(2.0), num(3.0)]))])),
    ]);
    engine
        .set_node("users/1", value.clone())
        .await
        .expect("set users/1");

    let read = engine
        .get_node("users/1", &ReadOptions::all())
        .await
        .expect("get users/1")
        .expect("exists");
    assert_eq!(read, value);

    // Removing one key leaves the siblings untouched.
    engine
        .update_node("users/1", vec![("b".to_string(), None::<Value>)])
        .await
        .expect("remove b");
    let read = engine
        .get_node("users/1", &ReadOptions::all())
        .await
        .expect("get users/1")
        .expect("exists");
    let expected = obj(vec![
        ("a", num(1.0)),
        ("c", obj(vec![("d", arr(vec![num(1.0), num(2.0), num(3.0)]))])),
    ]);
    assert_eq!(read, expected);
}

#[tokio::test]
async fn every_value_type_round_trips() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    let value = obj(vec![
        ("flag", Value::Boolean(true)),
        ("tiny_int", num(7.0)),
        ("float", num(-2.75)),
        ("big", Value::BigInt(9_007_199_254_740_993)),
        ("when", Value::DateTime(1_706_000_000_123)),
        ("short", text("inline me")),
        ("long", text(&"x".repeat(5000))),
        ("blob", Value::Binary((0..=255u8).collect())),
        ("link", Value::Reference(PathReference::new("users/1"))),
        ("empty_obj", obj(vec![])),
        ("empty_arr", arr(vec![])),
    ]);
    engine
        .set_node("samples/all", value.clone())
        .await
        .expect("set");
    let read = engine
        .get_node("samples/all", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, value);
}

#[tokio::test]
async fn missing_nodes_read_as_none_and_no_children() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    assert!(engine
        .get_node("no/such/path", &ReadOptions::all())
        .await
        .expect("get")
        .is_none());
    assert!(engine
        .get_children("no/such/path")
        .await
        .expect("children")
        .is_empty());
    let info = engine.get_node_info("no/such/path").await.expect("info");
    assert!(!info.exists);
}

#[tokio::test]
async fn get_children_reports_types_and_embedded_values() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "doc",
            obj(vec![
                ("n", num(3.0)),
                ("s", text("abc")),
                ("nested", obj(vec![("x", num(1.0))])),
            ]),
        )
        .await
        .expect("set");

    let children = engine.get_children("doc").await.expect("children");
    assert_eq!(children.len(), 3);
    let nested = children
        .iter()
        .find(|child| child.key.to_string() == "nested")
        .expect("nested child");
    assert_eq!(nested.value_type, ValueType::Object);
    assert!(nested.address.is_some(), "nested object has its own node");
    assert!(nested.value.is_none());
    let n = children
        .iter()
        .find(|child| child.key.to_string() == "n")
        .expect("n child");
    assert_eq!(n.value, Some(num(3.0)));
}

#[tokio::test]
async fn include_exclude_projections() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "profile",
            obj(vec![
                ("name", text("ada")),
                ("secret", text("hunter2")),
                ("meta", obj(vec![("likes", num(9.0)), ("spam", num(1.0))])),
            ]),
        )
        .await
        .expect("set");

    let options = ReadOptions {
        exclude: vec!["secret".into(), "meta/spam".into()],
        ..ReadOptions::default()
    };
    let read = engine
        .get_node("profile", &options)
        .await
        .expect("get")
        .expect("exists");
    let expected = obj(vec![
        ("name", text("ada")),
        ("meta", obj(vec![("likes", num(9.0))])),
    ]);
    assert_eq!(read, expected);

    let options = ReadOptions {
        include: vec!["name".into()],
        ..ReadOptions::default()
    };
    let read = engine
        .get_node("profile", &options)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, obj(vec![("name", text("ada"))]));
}

#[tokio::test]
async fn transact_node_applies_atomically() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("stats", obj(vec![("visits", num(0.0))]))
        .await
        .expect("set");

    for _ in 0..10 {
        engine
            .transact_node("stats/visits", |current| {
                let current = match current {
                    Some(Value::Number(n)) => n,
                    _ => 0.0,
                };
                Some(num(current + 1.0))
            })
            .await
            .expect("transact");
    }

    let read = engine
        .get_node("stats/visits", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, num(10.0));
}

#[tokio::test]
async fn remove_node_deletes_subtree() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "books/1",
            obj(vec![("title", text("Dune")), ("meta", obj(vec![("pages", num(412.0))]))]),
        )
        .await
        .expect("set");
    engine.remove_node("books/1").await.expect("remove");

    assert!(engine
        .get_node("books/1", &ReadOptions::all())
        .await
        .expect("get")
        .is_none());
    assert!(engine
        .get_node("books/1/meta", &ReadOptions::all())
        .await
        .expect("get")
        .is_none());
    // The parent collection still exists, now empty.
    let books = engine
        .get_node("books", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(books, obj(vec![]));
}

#[tokio::test]
async fn randomized_documents_round_trip() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_value(rng: &mut StdRng, depth: usize) -> Value {
        match rng.gen_range(0..if depth < 3 { 7 } else { 5 }) {
            0 => Value::Boolean(rng.gen()),
            1 => num(rng.gen_range(-1_000_000.0..1_000_000.0)),
            2 => Value::BigInt(rng.gen()),
            3 => {
                let len = rng.gen_range(0..200);
                Value::String((0..len).map(|_| rng.gen_range('a'..='z')).collect())
            }
            4 => {
                let len = rng.gen_range(0..150);
                Value::Binary((0..len).map(|_| rng.gen()).collect())
            }
            5 => {
                let len = rng.gen_range(0..6);
                Value::Array((0..len).map(|_| random_value(rng, depth + 1)).collect())
            }
            _ => {
                let len = rng.gen_range(0..8);
                Value::Object(
                    (0..len)
                        .map(|i| (format!("k{i}"), random_value(rng, depth + 1)))
                        .collect(),
                )
            }
        }
    }

    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);
    let mut rng = StdRng::seed_from_u64(0xA5B0);

    for round in 0..20 {
        let value = obj(vec![("doc", random_value(&mut rng, 0))]);
        let path = format!("random/{round}");
        engine.set_node(&path, value.clone()).await.expect("set");
        let read = engine
            .get_node(&path, &ReadOptions::all())
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(read, value, "round {round} diverged");
    }
}

#[tokio::test]
async fn engine_counts_reads_and_writes() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("metrics/sample", obj(vec![("v", num(1.0))]))
        .await
        .expect("set");
    engine
        .get_node("metrics/sample", &ReadOptions::all())
        .await
        .expect("get");

    let stats = engine.stats();
    assert!(stats.node_writes > 0);
    assert!(stats.node_reads > 0);
    let fst = stats.fst.expect("fst stats");
    assert!(fst.page_count > 0);
}
