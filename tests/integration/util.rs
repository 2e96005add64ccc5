#![allow(dead_code)]

use std::collections::BTreeMap;

use arbor::{EngineOptions, StorageEngine, Value};
use tempfile::TempDir;

pub fn open_engine(dir: &TempDir) -> StorageEngine {
    open_engine_with(dir, EngineOptions::default())
}

pub fn open_engine_with(dir: &TempDir, options: EngineOptions) -> StorageEngine {
    StorageEngine::open(&dir.path().join("data.arbor"), options).expect("open engine")
}

pub fn num(n: f64) -> Value {
    Value::Number(n)
}

pub fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn obj(pairs: Vec<(&str, Value)>) -> Value {
    Value::Object(
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn arr(items: Vec<Value>) -> Value {
    Value::Array(items)
}
