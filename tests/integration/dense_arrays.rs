#![allow(missing_docs)]

mod util;

use arbor::{ArborError, ReadOptions, Value};
use tempfile::tempdir;
use util::{arr, num, obj, open_engine, text};

#[tokio::test]
async fn appending_at_the_tail_is_allowed() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node("list", obj(vec![("items", arr(vec![num(0.0), num(1.0)]))]))
        .await
        .expect("seed");

    engine
        .update_node("list/items", vec![("2".to_string(), Some(num(2.0)))])
        .await
        .expect("append");

    let read = engine
        .get_node("list/items", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, arr(vec![num(0.0), num(1.0), num(2.0)]));
}

#[tokio::test]
async fn gap_insert_fails_and_leaves_array_unchanged() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    let original = arr(vec![num(0.0), num(1.0), num(2.0)]);
    engine
        .set_node("list", obj(vec![("items", original.clone())]))
        .await
        .expect("seed");

    let err = engine
        .update_node("list/items", vec![("7".to_string(), Some(num(7.0)))])
        .await
        .expect_err("gap insert must fail");
    assert!(
        matches!(err, ArborError::SparseArray { index: 7, .. }),
        "unexpected error: {err}"
    );

    let read = engine
        .get_node("list/items", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, original, "failed merge must not change the array");
}

#[tokio::test]
async fn non_tail_delete_fails() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "list",
            obj(vec![("items", arr(vec![num(0.0), num(1.0), num(2.0)]))]),
        )
        .await
        .expect("seed");

    let err = engine
        .update_node("list/items", vec![("0".to_string(), None::<Value>)])
        .await
        .expect_err("deleting the head must fail");
    assert!(matches!(err, ArborError::SparseArray { index: 0, .. }));

    // Tail delete is fine.
    engine
        .update_node("list/items", vec![("2".to_string(), None::<Value>)])
        .await
        .expect("tail delete");
    let read = engine
        .get_node("list/items", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, arr(vec![num(0.0), num(1.0)]));
}

#[tokio::test]
async fn updates_anywhere_in_the_array_are_allowed() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "list",
            obj(vec![(
                "items",
                arr(vec![text("a"), text("b"), text("c")]),
            )]),
        )
        .await
        .expect("seed");

    engine
        .update_node("list/items", vec![("1".to_string(), Some(text("B")))])
        .await
        .expect("update middle element");

    let read = engine
        .get_node("list/items", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, arr(vec![text("a"), text("B"), text("c")]));
}

#[tokio::test]
async fn indexed_path_segments_address_array_elements() {
    let dir = tempdir().expect("tempdir");
    let engine = open_engine(&dir);

    engine
        .set_node(
            "songs",
            obj(vec![(
                "all",
                arr(vec![
                    obj(vec![("title", text("one"))]),
                    obj(vec![("title", text("two"))]),
                ]),
            )]),
        )
        .await
        .expect("seed");

    let read = engine
        .get_node("songs/all[1]/title", &ReadOptions::all())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(read, text("two"));
}
