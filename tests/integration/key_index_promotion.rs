#![allow(missing_docs)]

mod util;

use std::collections::BTreeMap;

use arbor::{ReadOptions, Value};
use tempfile::tempdir;
use util::{num, open_engine};

fn collection(children: usize) -> Value {
    Value::Object(
        (0..children)
            .map(|i| (i.to_string(), num(i as f64)))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[tokio::test]
async fn many_children_promote_to_key_index() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("col", collection(150))
        .await
        .expect("set 150 children");

    let info = engine.get_node_info("col").await.expect("info");
    assert!(info.exists);
    assert!(info.has_key_index, "150 children must build a key index");
    let address = info.address.expect("stored node");

    // Adding one more child updates the tree without moving the record.
    engine
        .update_node("col", vec![("150".to_string(), Some(num(150.0)))])
        .await
        .expect("insert 151st child");

    let info = engine.get_node_info("col").await.expect("info");
    assert!(info.has_key_index);
    assert_eq!(
        info.address.expect("stored node"),
        address,
        "in-place tree update must not move the node"
    );

    let children = engine.get_children("col").await.expect("children");
    assert_eq!(children.len(), 151);

    let read = engine
        .get_node("col", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, collection(151));
}

#[tokio::test]
async fn few_children_stay_flat() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("small", collection(20))
        .await
        .expect("set 20 children");
    let info = engine.get_node_info("small").await.expect("info");
    assert!(!info.has_key_index, "20 children stay in the flat layout");
}

#[tokio::test]
async fn indexed_collection_survives_updates_and_removes() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("col", collection(130))
        .await
        .expect("set");

    engine
        .update_node(
            "col",
            vec![
                ("7".to_string(), Some(num(700.0))),
                ("9".to_string(), None),
                ("500".to_string(), Some(num(500.0))),
            ],
        )
        .await
        .expect("merge");

    let read = engine
        .get_node("col", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    let Value::Object(map) = read else {
        panic!("expected object");
    };
    assert_eq!(map.len(), 130, "one removed, one added");
    assert_eq!(map.get("7"), Some(&num(700.0)));
    assert_eq!(map.get("9"), None);
    assert_eq!(map.get("500"), Some(&num(500.0)));
}

#[tokio::test]
async fn large_indexed_collection_reads_back_exactly() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    let value = collection(400);
    engine.set_node("big", value.clone()).await.expect("set");
    let read = engine
        .get_node("big", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, value);

    let stats = engine.stats();
    assert!(stats.node_writes >= 1);
}
