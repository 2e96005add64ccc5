//! Node reader: record header parsing, lazy child streaming and recursive
//! value materialization.
//!
//! Locks are acquired by the engine before any of these run; readers only
//! assert them. A per-top-level-read set of visited addresses guards against
//! circular or duplicated record references, which are treated as hard
//! corruption rather than something to recover from.

use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

use crate::error::{ArborError, Result};
use crate::path::{PathInfo, PathKey};
use crate::storage::address::{address_at, Allocation, RecordAddress};
use crate::storage::chunk::{parse_header, RecordInfo};
use crate::storage::codec::{
    decode_entry_key, decode_entry_value, path_key_from_tree_bytes, resolve_entry_value,
    tree_key_bytes, EntryKey, EntryValue,
};
use crate::storage::engine::EngineInner;
use crate::storage::keytree;
use crate::types::{Value, ValueType};

/// Projection and traversal options for [`get_value`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// When non-empty, only these child trails are materialized. Each entry
    /// is a relative path; `*` matches any single key.
    pub include: Vec<String>,
    /// Child trails to leave out.
    pub exclude: Vec<String>,
    /// When set, child objects and arrays are skipped entirely and only
    /// leaf-ish members of the target are returned.
    pub skip_child_objects: bool,
}

impl ReadOptions {
    /// Options that materialize everything.
    pub fn all() -> Self {
        Self::default()
    }
}

/// Shared state of one top-level read: the circular-reference guard.
#[derive(Default)]
pub(crate) struct ReadCtx {
    visited: FxHashSet<RecordAddress>,
}

impl ReadCtx {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, path: &str, address: RecordAddress) -> Result<()> {
        if !self.visited.insert(address) {
            return Err(ArborError::Corruption(format!(
                "circular or duplicate record reference to {address} at \"{path}\""
            )));
        }
        Ok(())
    }
}

/// Reads and parses the record header at `address`, fetching additional
/// records of the first chunk while the chunk table is incomplete.
pub(crate) fn read_record_info(
    engine: &EngineInner,
    path: &str,
    address: RecordAddress,
) -> Result<RecordInfo> {
    let record_size = engine.record_size();
    let page_size = engine.page_size();
    let mut bytes: Vec<u8> = Vec::with_capacity(record_size);
    let mut next_record = address.record_nr;
    loop {
        if bytes.len() > record_size * 64 {
            return Err(ArborError::Corruption(format!(
                "record header at {address} never terminates"
            ))
            .with_path(path));
        }
        if u32::from(next_record) >= page_size as u32 {
            return Err(ArborError::Corruption(format!(
                "record header at {address} runs past its page"
            ))
            .with_path(path));
        }
        let chunk = engine.read_single_record(RecordAddress::new(address.page_nr, next_record))?;
        bytes.extend_from_slice(&chunk);
        next_record += 1;
        if let Some(info) = parse_header(address, &bytes).map_err(|e| e.with_path(path))? {
            let total = crate::storage::address::total_records(&info.allocation);
            let used = (total - 1) * record_size as u64 + u64::from(info.last_record_len);
            if info.last_record_len == 0
                || usize::from(info.last_record_len) > record_size
                || used < info.header_len as u64
            {
                return Err(ArborError::Corruption(format!(
                    "record header at {address} declares an impossible length"
                ))
                .with_path(path));
            }
            return Ok(info);
        }
    }
}

/// Streams the payload bytes of a node chunk by chunk, stitching reads that
/// stop mid-entry across chunk boundaries.
pub(crate) struct PayloadReader<'a> {
    engine: &'a EngineInner,
    info: &'a RecordInfo,
    /// Payload-relative offset of the first unconsumed buffered byte.
    offset: u64,
    buf: Vec<u8>,
    next_range: usize,
    /// Bytes of the node stream already fetched (header included).
    fetched: u64,
    payload_len: u64,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(engine: &'a EngineInner, info: &'a RecordInfo) -> Self {
        let payload_len = info.payload_len(engine.record_size());
        Self {
            engine,
            info,
            offset: 0,
            buf: Vec::new(),
            next_range: 0,
            fetched: 0,
            payload_len,
        }
    }

    /// Total payload length in bytes.
    pub(crate) fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Payload-relative offset of `buffer()[0]`.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// The currently buffered, unconsumed bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Drops `n` consumed bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.offset += n as u64;
    }

    /// Fetches the next chunk into the buffer. Returns `false` at the end of
    /// the payload; the "additional data needed" loop in callers keeps
    /// decoding while this returns `true`.
    pub(crate) fn fetch_more(&mut self) -> Result<bool> {
        let Some(range) = self.info.allocation.get(self.next_range) else {
            return Ok(false);
        };
        self.next_range += 1;
        let raw = self.engine.read_record_range(range)?;
        let chunk_len = raw.len() as u64;

        // Trim the header prefix and the unused tail of the last record.
        let header_len = self.info.header_len as u64;
        let stream_start = self.fetched;
        let stream_end = stream_start + chunk_len;
        self.fetched = stream_end;

        let payload_end = header_len + self.payload_len;
        let from = stream_start.max(header_len);
        let to = stream_end.min(payload_end);
        if from < to {
            let a = (from - stream_start) as usize;
            let b = (to - stream_start) as usize;
            self.buf.extend_from_slice(&raw[a..b]);
        }
        Ok(true)
    }

    /// Reads the entire remaining payload into the buffer.
    pub(crate) fn fetch_all(&mut self) -> Result<()> {
        while self.fetch_more()? {}
        Ok(())
    }
}

/// Reads the full payload of a node.
pub(crate) fn read_payload(engine: &EngineInner, info: &RecordInfo) -> Result<Vec<u8>> {
    let mut reader = PayloadReader::new(engine, info);
    reader.fetch_all()?;
    Ok(reader.buf)
}

/// One streamed child of a structured node.
#[derive(Debug, Clone)]
pub(crate) struct ChildItem {
    /// Key of the child within its parent.
    pub key: PathKey,
    /// Raw entry value (tiny, inline or record address).
    pub value: EntryValue,
    /// Payload-relative offset of the entry's value-info byte. `None` for
    /// children behind a key index.
    pub value_offset: Option<u64>,
}

/// Streams the children of a structured node. With a `filter`, key-indexed
/// nodes use a batched tree lookup instead of a full leaf scan; flat nodes
/// scan linearly either way and skip non-matching keys.
pub(crate) fn get_children(
    engine: &EngineInner,
    path: &str,
    info: &RecordInfo,
    filter: Option<&[PathKey]>,
) -> Result<Vec<ChildItem>> {
    if !info.value_type.is_structured() {
        return Err(ArborError::InvalidArgument(format!(
            "node at \"{path}\" holds a {:?} and has no children",
            info.value_type
        )));
    }
    if info.has_key_index {
        let payload = read_payload(engine, info)?;
        let mut items = Vec::new();
        match filter {
            Some(keys) => {
                let tree_keys: Vec<Vec<u8>> = keys.iter().map(tree_key_bytes).collect();
                let results =
                    keytree::lookup_many(&payload, &tree_keys).map_err(|e| e.with_path(path))?;
                for (key, value_bytes) in keys.iter().zip(results) {
                    let Some(value_bytes) = value_bytes else {
                        continue;
                    };
                    items.push(ChildItem {
                        key: key.clone(),
                        value: decode_complete_entry_value(path, &value_bytes)?,
                        value_offset: None,
                    });
                }
            }
            None => {
                for (key_bytes, value_bytes) in
                    keytree::iter_all(&payload).map_err(|e| e.with_path(path))?
                {
                    items.push(ChildItem {
                        key: path_key_from_tree_bytes(info.value_type, &key_bytes)?,
                        value: decode_complete_entry_value(path, &value_bytes)?,
                        value_offset: None,
                    });
                }
            }
        }
        return Ok(items);
    }

    // Flat layout: linear scan with incremental fetches across chunks.
    let mut reader = PayloadReader::new(engine, info);
    let mut items = Vec::new();
    let mut array_index = 0usize;
    let keyed = info.value_type == ValueType::Object;
    loop {
        if reader.offset() + reader.buffer().len() as u64 >= reader.payload_len()
            && reader.buffer().is_empty()
        {
            break;
        }
        let parsed = parse_flat_entry(engine, keyed, reader.buffer())?;
        match parsed {
            Some((key, value, consumed, value_rel)) => {
                let key = match key {
                    Some(key) => key,
                    None => {
                        let key = PathKey::Index(array_index);
                        array_index += 1;
                        key
                    }
                };
                let value_offset = reader.offset() + value_rel as u64;
                let matches = filter.map_or(true, |keys| keys.contains(&key));
                if matches {
                    items.push(ChildItem {
                        key,
                        value,
                        value_offset: Some(value_offset),
                    });
                }
                reader.consume(consumed);
            }
            None => {
                // Additional data needed: the entry continues in the next
                // chunk.
                if !reader.fetch_more()? {
                    if reader.buffer().is_empty() {
                        break;
                    }
                    return Err(ArborError::Corruption(format!(
                        "child entry truncated at end of payload at \"{path}\""
                    )));
                }
            }
        }
    }
    Ok(items)
}

fn decode_complete_entry_value(path: &str, bytes: &[u8]) -> Result<EntryValue> {
    match decode_entry_value(bytes).map_err(|e| e.with_path(path))? {
        Some((value, consumed)) if consumed == bytes.len() => Ok(value),
        _ => Err(ArborError::Corruption(format!(
            "malformed key index entry value at \"{path}\""
        ))),
    }
}

/// Tries to decode one flat child entry from `bytes`. Returns the key (for
/// keyed nodes), the value, the total consumed length, and the offset of the
/// value part within the entry; `None` when more bytes are needed.
fn parse_flat_entry(
    engine: &EngineInner,
    keyed: bool,
    bytes: &[u8],
) -> Result<Option<(Option<PathKey>, EntryValue, usize, usize)>> {
    let mut pos = 0usize;
    let key = if keyed {
        match decode_entry_key(bytes)? {
            Some((EntryKey::Inline(name), consumed)) => {
                pos += consumed;
                Some(PathKey::Name(name))
            }
            Some((EntryKey::Interned(index), consumed)) => {
                pos += consumed;
                Some(PathKey::Name(engine.key_name(index)?))
            }
            None => return Ok(None),
        }
    } else {
        None
    };
    match decode_entry_value(&bytes[pos..])? {
        Some((value, consumed)) => Ok(Some((key, value, pos + consumed, pos))),
        None => Ok(None),
    }
}

fn projection_allows(options: &ReadOptions, key: &PathKey) -> bool {
    let segment = key.to_segment();
    // An exclude trail ending at this key drops the child; deeper trails
    // still need it materialized (with a narrowed exclude).
    if options
        .exclude
        .iter()
        .any(|trail| trail_head_matches(trail, &segment) && trail_tail(trail).is_none())
    {
        return false;
    }
    if options.include.is_empty() {
        return true;
    }
    options
        .include
        .iter()
        .any(|trail| trail_head_matches(trail, &segment))
}

fn trail_head_matches(trail: &str, segment: &str) -> bool {
    let head = trail.split('/').next().unwrap_or(trail);
    head == "*" || head == segment
}

fn trail_tail(trail: &str) -> Option<&str> {
    trail.split_once('/').map(|(_, tail)| tail)
}

fn narrowed_options(options: &ReadOptions, key: &PathKey) -> ReadOptions {
    let segment = key.to_segment();
    let narrow = |trails: &[String]| {
        trails
            .iter()
            .filter(|trail| trail_head_matches(trail, &segment))
            .filter_map(|trail| trail_tail(trail).map(str::to_string))
            .collect::<Vec<_>>()
    };
    ReadOptions {
        include: narrow(&options.include),
        exclude: narrow(&options.exclude),
        skip_child_objects: options.skip_child_objects,
    }
}

/// Recursively materializes the value stored at `info`.
pub(crate) fn get_value(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    options: &ReadOptions,
    ctx: &mut ReadCtx,
) -> Result<Value> {
    let path_str = path.to_string();
    ctx.enter(&path_str, info.address)?;
    engine.note_node_read();

    if !info.value_type.is_structured() {
        let payload = read_payload(engine, info)?;
        return crate::storage::codec::deserialize_payload(info.value_type, &payload)
            .map_err(|e| e.with_path(&path_str));
    }

    let children = get_children(engine, &path_str, info, None)?;
    let mut object: BTreeMap<String, Value> = BTreeMap::new();
    let mut array: Vec<Value> = Vec::new();
    for child in children {
        if !projection_allows(options, &child.key) {
            continue;
        }
        let value = match resolve_entry_value(&child.value)? {
            Some(value) => value,
            None => {
                let EntryValue::Record {
                    value_type,
                    address,
                } = &child.value
                else {
                    unreachable!("unresolved entries are record entries");
                };
                if options.skip_child_objects && value_type.is_structured() {
                    continue;
                }
                let child_path = path.child(child.key.clone());
                let child_info = read_record_info(engine, &child_path.to_string(), *address)?;
                if child_info.value_type != *value_type {
                    return Err(ArborError::Corruption(format!(
                        "child entry at \"{child_path}\" declares {value_type:?} but the \
                         record holds {:?}",
                        child_info.value_type
                    )));
                }
                get_value(
                    engine,
                    &child_path,
                    &child_info,
                    &narrowed_options(options, &child.key),
                    ctx,
                )?
            }
        };
        match (&info.value_type, &child.key) {
            (ValueType::Object, PathKey::Name(name)) => {
                object.insert(name.clone(), value);
            }
            (ValueType::Array, PathKey::Index(index)) => {
                if *index != array.len() {
                    return Err(ArborError::Corruption(format!(
                        "array at \"{path_str}\" is not dense at index {index}"
                    )));
                }
                array.push(value);
            }
            (collection, key) => {
                return Err(ArborError::Corruption(format!(
                    "{collection:?} node at \"{path_str}\" holds incompatible child key {key}"
                )));
            }
        }
    }
    Ok(match info.value_type {
        ValueType::Object => Value::Object(object),
        ValueType::Array => Value::Array(array),
        _ => unreachable!("structured types handled above"),
    })
}

/// Collects the allocations of a node and every record descendant, used when
/// a subtree is overwritten or deleted and its storage scheduled for release.
pub(crate) fn collect_subtree_allocations(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    ctx: &mut ReadCtx,
    out: &mut Vec<Allocation>,
) -> Result<()> {
    ctx.enter(&path.to_string(), info.address)?;
    out.push(info.allocation.clone());
    if !info.value_type.is_structured() {
        return Ok(());
    }
    for child in get_children(engine, &path.to_string(), info, None)? {
        if let EntryValue::Record { address, .. } = child.value {
            let child_path = path.child(child.key.clone());
            let child_info = read_record_info(engine, &child_path.to_string(), address)?;
            collect_subtree_allocations(engine, &child_path, &child_info, ctx, out)?;
        }
    }
    Ok(())
}

/// Resolves the address of the record holding payload byte `offset`, along
/// with the in-record byte position. Used for in-place child pointer patches.
pub(crate) fn payload_byte_location(
    info: &RecordInfo,
    record_size: usize,
    offset: u64,
) -> Result<(RecordAddress, usize)> {
    let absolute = info.header_len as u64 + offset;
    let record_index = absolute / record_size as u64;
    let within = (absolute % record_size as u64) as usize;
    let address = address_at(&info.allocation, record_index)?;
    Ok((address, within))
}
