//! Node writer: serializes value trees into records, chooses between the
//! flat layout and the B+Tree key index, merges updates against stored
//! children and keeps parent references patchable.
//!
//! Locks are acquired by the engine before any of these run. Writers return
//! the storage they made stale instead of releasing it themselves; the
//! engine releases to the FST only after parent references are updated.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{ArborError, Result};
use crate::path::{PathInfo, PathKey};
use crate::storage::address::{total_records, AllocatedRange, Allocation};
use crate::storage::chunk::{encode_header, header_len_for, RecordInfo};
use crate::storage::codec::{
    encode_entry_key, encode_entry_value, record_payload, serialize_child_value, tree_key_bytes,
    EntryKey, EntryValue, SerializedValue,
};
use crate::storage::engine::EngineInner;
use crate::storage::keytree::{self, TreeOp, DEFAULT_TREE_PAGE_SIZE, FILL_FACTOR_GENERIC, FILL_FACTOR_NUMERIC};
use crate::storage::reader::{
    collect_subtree_allocations, get_children, read_payload, ReadCtx,
};
use crate::types::{Value, ValueType};

/// How many in-place grow attempts are made on a full key tree before the
/// whole tree is rebuilt.
const MAX_TREE_GROWS: usize = 3;

/// Result of a node write: the new descriptor plus every allocation made
/// stale by it. The caller releases the stale ranges once no reference to
/// them remains.
#[derive(Debug)]
pub(crate) struct WriteOutcome {
    /// Descriptor of the written node.
    pub info: RecordInfo,
    /// Allocations to hand back to the FST.
    pub deallocate: Vec<Allocation>,
}

/// One merge update: a fresh value, or an already-serialized entry (used by
/// cascading parent updates whose child node is already on disk).
#[derive(Debug, Clone)]
pub(crate) enum MergeEntry {
    /// Serialize and store this value.
    Value(Value),
    /// Use this entry as-is; the caller owns any stale storage bookkeeping.
    Raw(EntryValue),
}

/// Creates or overwrites the node at `path` with `value`. When `prior` is
/// given, the previous node and all of its record descendants are reported
/// as deallocatable.
pub(crate) fn write_node_value(
    engine: &EngineInner,
    path: &PathInfo,
    value: &Value,
    prior: Option<&RecordInfo>,
) -> Result<WriteOutcome> {
    let mut deallocate = Vec::new();
    if let Some(prior) = prior {
        let mut ctx = ReadCtx::new();
        collect_subtree_allocations(engine, path, prior, &mut ctx, &mut deallocate)?;
        engine.invalidate_cache(&path.to_string(), true);
    }

    let info = match value {
        Value::Object(_) | Value::Array(_) => {
            let entries = serialize_children(engine, path, value, &mut deallocate)?;
            write_structured(engine, path, value.value_type(), entries)?
        }
        other => {
            let payload = record_payload(other)?;
            write_payload(engine, path, other.value_type(), false, &payload)?
        }
    };
    Ok(WriteOutcome { info, deallocate })
}

/// Serializes the children of a structured value, creating dedicated nodes
/// for values that cannot be embedded.
fn serialize_children(
    engine: &EngineInner,
    path: &PathInfo,
    value: &Value,
    deallocate: &mut Vec<Allocation>,
) -> Result<Vec<(PathKey, EntryValue)>> {
    let mut entries = Vec::with_capacity(value.child_count());
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                let key = PathKey::Name(name.clone());
                let entry = serialize_entry(engine, &path.child(key.clone()), child, deallocate)?;
                entries.push((key, entry));
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let key = PathKey::Index(index);
                let entry = serialize_entry(engine, &path.child(key.clone()), child, deallocate)?;
                entries.push((key, entry));
            }
        }
        _ => {
            return Err(ArborError::Internal(
                "serialize_children called for a non-structured value".into(),
            ))
        }
    }
    Ok(entries)
}

/// Serializes a single child value, writing a dedicated node when needed.
pub(crate) fn serialize_entry(
    engine: &EngineInner,
    child_path: &PathInfo,
    value: &Value,
    deallocate: &mut Vec<Allocation>,
) -> Result<EntryValue> {
    match serialize_child_value(value, engine.max_inline_value_size())? {
        SerializedValue::Tiny { value_type, bits } => Ok(EntryValue::Tiny { value_type, bits }),
        SerializedValue::Inline { value_type, bytes } => {
            Ok(EntryValue::Inline { value_type, bytes })
        }
        SerializedValue::NeedsNode { value_type } => {
            let outcome = write_node_value(engine, child_path, value, None)?;
            deallocate.extend(outcome.deallocate);
            Ok(EntryValue::Record {
                value_type,
                address: outcome.info.address,
            })
        }
    }
}

/// Writes a structured node, choosing flat or key-indexed layout by child
/// count.
fn write_structured(
    engine: &EngineInner,
    path: &PathInfo,
    value_type: ValueType,
    entries: Vec<(PathKey, EntryValue)>,
) -> Result<RecordInfo> {
    if entries.len() > engine.key_index_threshold() {
        let payload = build_tree_payload(&entries)?;
        write_payload(engine, path, value_type, true, &payload)
    } else {
        let payload = build_flat_payload(engine, value_type, &entries)?;
        write_payload(engine, path, value_type, false, &payload)
    }
}

/// Fill factor for a key set: numeric-only keys are append-heavy, generic
/// keys need insertion headroom.
fn fill_factor_for(entries: &[(PathKey, EntryValue)]) -> u8 {
    let numeric = entries.iter().all(|(key, _)| match key {
        PathKey::Index(_) => true,
        PathKey::Name(name) => name.bytes().all(|b| b.is_ascii_digit()),
    });
    if numeric {
        FILL_FACTOR_NUMERIC
    } else {
        FILL_FACTOR_GENERIC
    }
}

fn build_tree_payload(entries: &[(PathKey, EntryValue)]) -> Result<Vec<u8>> {
    let mut tree_entries = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let mut bytes = Vec::new();
        encode_entry_value(&mut bytes, value)?;
        tree_entries.push((tree_key_bytes(key), bytes));
    }
    tree_entries.sort_by(|a, b| a.0.cmp(&b.0));
    keytree::build(
        &tree_entries,
        fill_factor_for(entries),
        DEFAULT_TREE_PAGE_SIZE,
        0,
    )
}

fn build_flat_payload(
    engine: &EngineInner,
    value_type: ValueType,
    entries: &[(PathKey, EntryValue)],
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut expected_index = 0usize;
    for (key, value) in entries {
        match (value_type, key) {
            (ValueType::Object, PathKey::Name(name)) => {
                let entry_key = match engine.intern_key(name)? {
                    Some(index) => EntryKey::Interned(index),
                    None => EntryKey::Inline(name.clone()),
                };
                encode_entry_key(&mut payload, &entry_key)?;
            }
            (ValueType::Array, PathKey::Index(index)) => {
                // Array entries carry no key bytes; density is positional.
                if *index != expected_index {
                    return Err(ArborError::Internal(format!(
                        "array serialization is not exhaustive at index {index}"
                    )));
                }
                expected_index += 1;
            }
            (collection, key) => {
                return Err(ArborError::Internal(format!(
                    "{collection:?} node cannot hold child key {key}"
                )));
            }
        }
        encode_entry_value(&mut payload, value)?;
    }
    Ok(payload)
}

enum Fit {
    Fits,
    NeedsRecords(u64),
}

/// Trims an allocation down until it exactly covers header + payload,
/// releasing the surplus back to the FST.
fn shrink_to_fit(
    engine: &EngineInner,
    allocation: &mut Allocation,
    payload_len: usize,
) -> Result<Fit> {
    let record_size = engine.record_size() as u64;
    loop {
        let header_len = header_len_for(allocation);
        let required = ((header_len + payload_len) as u64).div_ceil(record_size).max(1);
        let total = total_records(allocation);
        if required > total {
            return Ok(Fit::NeedsRecords(required));
        }
        if required == total {
            return Ok(Fit::Fits);
        }
        let mut surplus = total - required;
        let mut released: SmallVec<[AllocatedRange; 4]> = SmallVec::new();
        while surplus > 0 {
            let last = allocation
                .last_mut()
                .expect("allocation covers required records");
            if u64::from(last.length) <= surplus {
                surplus -= u64::from(last.length);
                released.push(*last);
                allocation.pop();
            } else {
                let keep = last.length - surplus as u16;
                released.push(AllocatedRange::new(
                    last.page_nr,
                    last.record_nr + keep,
                    surplus as u16,
                )?);
                last.length = keep;
                surplus = 0;
            }
        }
        engine.release_ranges(&released)?;
        // Dropping ranges may have shrunk the header; go around again.
    }
}

/// Low-level write: allocates storage for `payload`, builds the chunk-table
/// header and streams header + payload across the allocated chunks.
pub(crate) fn write_payload(
    engine: &EngineInner,
    path: &PathInfo,
    value_type: ValueType,
    has_key_index: bool,
    payload: &[u8],
) -> Result<RecordInfo> {
    let record_size = engine.record_size();
    let mut records_needed = ((payload.len() + 4) as u64)
        .div_ceil(record_size as u64)
        .max(1);
    for _ in 0..8 {
        let mut allocation = engine.allocate(records_needed)?;
        // Largest range first: the header lives in the first chunk and must
        // not outgrow it.
        allocation.sort_by(|a, b| b.length.cmp(&a.length));
        match shrink_to_fit(engine, &mut allocation, payload.len())? {
            Fit::NeedsRecords(required) => {
                engine.release_ranges(&allocation)?;
                records_needed = required;
            }
            Fit::Fits => {
                let header_len = header_len_for(&allocation);
                if header_len > usize::from(allocation[0].length) * record_size {
                    engine.release_ranges(&allocation)?;
                    records_needed += 4;
                    continue;
                }
                return write_into_allocation(
                    engine,
                    path,
                    value_type,
                    has_key_index,
                    allocation,
                    payload,
                );
            }
        }
    }
    Err(ArborError::AllocationLimit(format!(
        "could not shape an allocation for node at \"{path}\""
    )))
}

/// Writes header + payload into an exact-fit allocation whose first range
/// already starts at the node's address.
pub(crate) fn write_into_allocation(
    engine: &EngineInner,
    path: &PathInfo,
    value_type: ValueType,
    has_key_index: bool,
    allocation: Allocation,
    payload: &[u8],
) -> Result<RecordInfo> {
    let record_size = engine.record_size();
    let header_len = header_len_for(&allocation);
    let total = total_records(&allocation);
    let used = header_len + payload.len();
    let last_record_len = used as u64 - (total - 1) * record_size as u64;
    if last_record_len == 0 || last_record_len > record_size as u64 {
        return Err(ArborError::Internal(format!(
            "allocation of {total} records does not fit {used} bytes exactly"
        )));
    }
    if header_len > usize::from(allocation[0].length) * record_size {
        // The header is parsed from consecutive records of the first chunk;
        // it must never spill into another chunk.
        return Err(ArborError::Internal(
            "record header outgrew the first chunk".into(),
        ));
    }
    let last_record_len = last_record_len as u16;

    let header = encode_header(value_type, has_key_index, &allocation, last_record_len)?;
    debug_assert_eq!(header.len(), header_len);

    let mut stream = Vec::with_capacity(used);
    stream.extend_from_slice(&header);
    stream.extend_from_slice(payload);

    let mut written = 0usize;
    for range in &allocation {
        let capacity = usize::from(range.length) * record_size;
        let end = (written + capacity).min(stream.len());
        engine.write_record_range(range, &stream[written..end])?;
        written = end;
    }

    let info = RecordInfo {
        address: allocation[0].start(),
        value_type,
        has_key_index,
        allocation,
        header_len,
        last_record_len,
    };
    engine.note_node_write();
    engine.update_cache(&path.to_string(), info.clone());
    debug!(path = %path, address = %info.address, records = total, "node.write");
    Ok(info)
}

/// Classified merge changes for a structured node.
struct MergePlan {
    inserts: Vec<(PathKey, EntryValue)>,
    updates: Vec<(PathKey, EntryValue)>,
    deletes: Vec<PathKey>,
    deallocate: Vec<Allocation>,
}

/// Merges `updates` into the structured node described by `info`. Returns
/// the (possibly moved) descriptor and stale storage. The dense-array
/// invariant is enforced before anything is written.
pub(crate) fn merge_node(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    updates: Vec<(PathKey, Option<MergeEntry>)>,
) -> Result<WriteOutcome> {
    let path_str = path.to_string();
    if !info.value_type.is_structured() {
        return Err(ArborError::InvalidArgument(format!(
            "cannot merge children into {:?} node at \"{path_str}\"",
            info.value_type
        )));
    }

    // Current entries for the touched keys (and, for the flat layout, the
    // full list since it gets rewritten anyway).
    let flat_children = if info.has_key_index {
        None
    } else {
        Some(get_children(engine, &path_str, info, None)?)
    };
    let tree_payload = if info.has_key_index {
        Some(read_payload(engine, info)?)
    } else {
        None
    };

    let existing_value = |key: &PathKey| -> Result<Option<EntryValue>> {
        if let Some(children) = &flat_children {
            Ok(children
                .iter()
                .find(|child| &child.key == key)
                .map(|child| child.value.clone()))
        } else {
            let payload = tree_payload.as_ref().expect("tree payload loaded");
            match keytree::lookup(payload, &tree_key_bytes(key))? {
                Some(bytes) => {
                    let decoded = crate::storage::codec::decode_entry_value(&bytes)?
                        .map(|(value, _)| value)
                        .ok_or_else(|| {
                            ArborError::Corruption(format!(
                                "malformed key index entry at \"{path_str}\""
                            ))
                        })?;
                    Ok(Some(decoded))
                }
                None => Ok(None),
            }
        }
    };

    let current_len = if let Some(children) = &flat_children {
        children.len()
    } else {
        keytree::entry_count(tree_payload.as_ref().expect("tree payload loaded"))? as usize
    };

    // Classify. Duplicate keys would double-count releases and break the
    // density arithmetic, so they are rejected outright.
    {
        let mut seen: Vec<&PathKey> = updates.iter().map(|(key, _)| key).collect();
        seen.sort();
        if seen.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ArborError::InvalidArgument(format!(
                "duplicate keys in update of \"{path_str}\""
            )));
        }
    }
    let mut plan = MergePlan {
        inserts: Vec::new(),
        updates: Vec::new(),
        deletes: Vec::new(),
        deallocate: Vec::new(),
    };
    let mut pending_updates: Vec<(PathKey, MergeEntry)> = Vec::new();
    let mut pending_inserts: Vec<(PathKey, MergeEntry)> = Vec::new();
    let mut replaced_records: Vec<(PathKey, EntryValue)> = Vec::new();
    for (key, update) in updates {
        if info.value_type == ValueType::Array && !matches!(key, PathKey::Index(_)) {
            return Err(ArborError::InvalidArgument(format!(
                "array node at \"{path_str}\" takes index keys, got \"{key}\""
            )));
        }
        let old = existing_value(&key)?;
        match (old, update) {
            (Some(old), Some(entry)) => {
                if matches!(entry, MergeEntry::Value(_)) {
                    replaced_records.push((key.clone(), old));
                }
                pending_updates.push((key, entry));
            }
            (Some(old), None) => {
                replaced_records.push((key.clone(), old));
                plan.deletes.push(key);
            }
            (None, Some(entry)) => {
                pending_inserts.push((key, entry));
            }
            (None, None) => {
                // Deleting a key that does not exist is a no-op.
            }
        }
    }

    // Validate before any child node is written, so a rejected merge leaves
    // no trace, allocated or otherwise.
    if info.value_type == ValueType::Array {
        let insert_keys: Vec<&PathKey> = pending_inserts.iter().map(|(key, _)| key).collect();
        validate_dense_array(&path_str, current_len, &plan.deletes, &insert_keys)?;
    }

    for (key, entry) in pending_updates {
        let value = realize_entry(engine, path, &key, entry, &mut plan.deallocate)?;
        plan.updates.push((key, value));
    }
    for (key, entry) in pending_inserts {
        let value = realize_entry(engine, path, &key, entry, &mut plan.deallocate)?;
        plan.inserts.push((key, value));
    }

    // Replaced and deleted record children become stale storage. An
    // unreadable child must not block its own removal (that is how broken
    // references get repaired); its storage is leaked and logged instead.
    for (key, old) in replaced_records {
        if let EntryValue::Record { address, .. } = old {
            let child_path = path.child(key);
            let collected = crate::storage::reader::read_record_info(
                engine,
                &child_path.to_string(),
                address,
            )
            .and_then(|child_info| {
                let mut ctx = ReadCtx::new();
                collect_subtree_allocations(
                    engine,
                    &child_path,
                    &child_info,
                    &mut ctx,
                    &mut plan.deallocate,
                )
            });
            if let Err(err) = collected {
                warn!(
                    path = %child_path,
                    error = %err,
                    "stale storage of replaced child could not be collected"
                );
            }
            engine.invalidate_cache(&child_path.to_string(), true);
        }
    }

    if info.has_key_index {
        merge_into_tree(
            engine,
            path,
            info,
            tree_payload.expect("tree payload loaded"),
            plan,
        )
    } else {
        merge_flat(
            engine,
            path,
            info,
            flat_children.expect("flat children loaded"),
            plan,
        )
    }
}

fn realize_entry(
    engine: &EngineInner,
    path: &PathInfo,
    key: &PathKey,
    entry: MergeEntry,
    deallocate: &mut Vec<Allocation>,
) -> Result<EntryValue> {
    match entry {
        MergeEntry::Raw(value) => Ok(value),
        MergeEntry::Value(value) => {
            serialize_entry(engine, &path.child(key.clone()), &value, deallocate)
        }
    }
}

/// Dense-array invariant: inserts and deletes only at the tail, never
/// leaving a gap.
fn validate_dense_array(
    path: &str,
    current_len: usize,
    delete_keys: &[PathKey],
    insert_keys: &[&PathKey],
) -> Result<()> {
    let index_of = |key: &PathKey| match key {
        PathKey::Index(index) => *index,
        PathKey::Name(_) => unreachable!("array keys were validated to be indices"),
    };
    let mut deletes: Vec<usize> = delete_keys.iter().map(index_of).collect();
    deletes.sort_unstable();
    let expected_start = current_len - deletes.len();
    for (offset, &index) in deletes.iter().enumerate() {
        if index != expected_start + offset {
            return Err(ArborError::SparseArray {
                path: path.to_string(),
                index,
            });
        }
    }
    let mut inserts: Vec<usize> = insert_keys.iter().map(|key| index_of(key)).collect();
    inserts.sort_unstable();
    let insert_start = current_len - deletes.len();
    for (offset, &index) in inserts.iter().enumerate() {
        if index != insert_start + offset {
            return Err(ArborError::SparseArray {
                path: path.to_string(),
                index,
            });
        }
    }
    Ok(())
}

/// Applies a merge plan to a key-indexed node: tree transaction, grown in
/// place on overflow, rebuilt as a last resort.
fn merge_into_tree(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    payload: Vec<u8>,
    plan: MergePlan,
) -> Result<WriteOutcome> {
    let mut ops: Vec<TreeOp> = Vec::new();
    for (key, value) in &plan.inserts {
        let mut bytes = Vec::new();
        encode_entry_value(&mut bytes, value)?;
        ops.push(TreeOp::Insert {
            key: tree_key_bytes(key),
            value: bytes,
        });
    }
    for (key, value) in &plan.updates {
        let mut bytes = Vec::new();
        encode_entry_value(&mut bytes, value)?;
        ops.push(TreeOp::Update {
            key: tree_key_bytes(key),
            value: bytes,
        });
    }
    for key in &plan.deletes {
        ops.push(TreeOp::Remove {
            key: tree_key_bytes(key),
        });
    }

    let mut payload = payload;
    let mut allocation = info.allocation.clone();
    let original_ranges = allocation.len();
    let mut grows = 0usize;
    loop {
        match keytree::apply(&mut payload, &ops) {
            Ok(()) => {
                let info = write_into_allocation(
                    engine,
                    path,
                    info.value_type,
                    info.has_key_index,
                    allocation,
                    &payload,
                )?;
                return Ok(WriteOutcome {
                    info,
                    deallocate: plan.deallocate,
                });
            }
            Err(ArborError::TreeFull) if grows < MAX_TREE_GROWS => {
                grows += 1;
                let pages = 2u32 << grows;
                keytree::grow(&mut payload, pages)?;
                extend_allocation(engine, &mut allocation, payload.len())?;
                debug!(path = %path, pages, "keytree.grow");
            }
            Err(err) => {
                // The node on disk still describes the original allocation;
                // any grow extensions acquired along the way go back.
                engine.release_ranges(&allocation[original_ranges..])?;
                if matches!(err, ArborError::TreeFull) {
                    return rebuild_tree(engine, path, info, &payload, ops, plan.deallocate);
                }
                return Err(err);
            }
        }
    }
}

/// Extends an in-place allocation (same address) until it covers
/// `payload_len` plus its own header.
fn extend_allocation(
    engine: &EngineInner,
    allocation: &mut Allocation,
    payload_len: usize,
) -> Result<()> {
    let record_size = engine.record_size() as u64;
    loop {
        let header_len = header_len_for(allocation);
        let required = ((header_len + payload_len) as u64).div_ceil(record_size);
        let total = total_records(allocation);
        if required <= total {
            // Over-coverage is fine here: the last record must simply not be
            // entirely unused, which shrinking guarantees below.
            if required == total {
                return Ok(());
            }
            return shrink_last_records(engine, allocation, total - required);
        }
        let extra = engine.allocate(required - total)?;
        allocation.extend(extra);
    }
}

fn shrink_last_records(
    engine: &EngineInner,
    allocation: &mut Allocation,
    mut surplus: u64,
) -> Result<()> {
    let mut released: SmallVec<[AllocatedRange; 4]> = SmallVec::new();
    while surplus > 0 {
        let last = allocation.last_mut().expect("allocation is non-empty");
        if u64::from(last.length) <= surplus {
            surplus -= u64::from(last.length);
            released.push(*last);
            allocation.pop();
        } else {
            let keep = last.length - surplus as u16;
            released.push(AllocatedRange::new(
                last.page_nr,
                last.record_nr + keep,
                surplus as u16,
            )?);
            last.length = keep;
            surplus = 0;
        }
    }
    engine.release_ranges(&released)
}

/// Rebuilds a key tree from scratch after repeated grow failures: reads all
/// entries, applies the operations in memory and writes a fresh tree, which
/// may move the node.
fn rebuild_tree(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    payload: &[u8],
    ops: Vec<TreeOp>,
    mut deallocate: Vec<Allocation>,
) -> Result<WriteOutcome> {
    warn!(path = %path, "keytree.rebuild");
    engine.note_tree_rebuild();
    let mut entries: BTreeMap<Vec<u8>, Vec<u8>> = keytree::iter_all(payload)?
        .into_iter()
        .collect();
    for op in ops {
        match op {
            TreeOp::Insert { key, value } => {
                if entries.insert(key, value).is_some() {
                    return Err(ArborError::Internal(
                        "tree rebuild found a duplicate key".into(),
                    ));
                }
            }
            TreeOp::Update { key, value } => {
                entries.insert(key, value);
            }
            TreeOp::Remove { key } => {
                entries.remove(&key);
            }
        }
    }
    let sorted: Vec<(Vec<u8>, Vec<u8>)> = entries.into_iter().collect();
    let fill = keytree::fill_factor(payload)?;
    let rebuilt = keytree::build(&sorted, fill, DEFAULT_TREE_PAGE_SIZE, 1)?;
    let new_info = write_payload(engine, path, info.value_type, true, &rebuilt)?;
    deallocate.push(info.allocation.clone());
    Ok(WriteOutcome {
        info: new_info,
        deallocate,
    })
}

/// Rewrites the record address inside an existing child entry without
/// moving the parent: an in-place patch of the 6 address bytes (flat
/// layout) or a same-size tree value update (key-indexed layout). Returns
/// `false` when the parent holds no record entry for the key, in which case
/// the caller falls back to a full merge.
pub(crate) fn try_patch_child_address(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    key: &PathKey,
    value_type: ValueType,
    new_address: crate::storage::address::RecordAddress,
) -> Result<bool> {
    let path_str = path.to_string();
    if info.has_key_index {
        let mut payload = read_payload(engine, info)?;
        let tree_key = tree_key_bytes(key);
        let Some(old_bytes) = keytree::lookup(&payload, &tree_key)? else {
            return Ok(false);
        };
        let Some((EntryValue::Record { .. }, _)) =
            crate::storage::codec::decode_entry_value(&old_bytes)?
        else {
            return Ok(false);
        };
        let mut new_bytes = Vec::new();
        encode_entry_value(
            &mut new_bytes,
            &EntryValue::Record {
                value_type,
                address: new_address,
            },
        )?;
        keytree::apply(
            &mut payload,
            &[TreeOp::Update {
                key: tree_key,
                value: new_bytes,
            }],
        )?;
        write_into_allocation(
            engine,
            path,
            info.value_type,
            true,
            info.allocation.clone(),
            &payload,
        )?;
        debug!(path = %path_str, key = %key, address = %new_address, "node.patch_child");
        return Ok(true);
    }

    let children = get_children(engine, &path_str, info, Some(std::slice::from_ref(key)))?;
    let Some(child) = children.into_iter().find(|child| &child.key == key) else {
        return Ok(false);
    };
    let (EntryValue::Record { .. }, Some(value_offset)) = (&child.value, child.value_offset)
    else {
        return Ok(false);
    };
    // Skip the two value-info bytes; the address itself is patched.
    engine.patch_payload_bytes(info, value_offset + 2, &new_address.to_bytes())?;
    debug!(path = %path_str, key = %key, address = %new_address, "node.patch_child");
    Ok(true)
}

/// Applies a merge plan to a flat node by rewriting its child list,
/// promoting to a key index when the child count crosses the threshold.
fn merge_flat(
    engine: &EngineInner,
    path: &PathInfo,
    info: &RecordInfo,
    children: Vec<crate::storage::reader::ChildItem>,
    plan: MergePlan,
) -> Result<WriteOutcome> {
    let mut merged: BTreeMap<PathKey, EntryValue> = children
        .into_iter()
        .map(|child| (child.key, child.value))
        .collect();
    for key in &plan.deletes {
        merged.remove(key);
    }
    for (key, value) in plan.updates.into_iter().chain(plan.inserts) {
        merged.insert(key, value);
    }
    // Deleting tail indices keeps the map dense; reindex defensively is not
    // needed because the dense-array check already ran.
    let entries: Vec<(PathKey, EntryValue)> = merged.into_iter().collect();

    let (payload, has_key_index) = if entries.len() > engine.key_index_threshold() {
        (build_tree_payload(&entries)?, true)
    } else {
        (
            build_flat_payload(engine, info.value_type, &entries)?,
            false,
        )
    };

    // Rewrite in place when the existing allocation still fits; this keeps
    // the address stable and spares a cascading parent update.
    let mut allocation = info.allocation.clone();
    let mut deallocate = plan.deallocate;
    match shrink_to_fit(engine, &mut allocation, payload.len())? {
        Fit::Fits => {
            let header_len = header_len_for(&allocation);
            if header_len <= usize::from(allocation[0].length) * engine.record_size() {
                let new_info = write_into_allocation(
                    engine,
                    path,
                    info.value_type,
                    has_key_index,
                    allocation,
                    &payload,
                )?;
                return Ok(WriteOutcome {
                    info: new_info,
                    deallocate,
                });
            }
            // Pathological first-chunk shape; fall through to a fresh
            // allocation and release the old one.
            deallocate.push(allocation);
        }
        Fit::NeedsRecords(_) => {
            deallocate.push(allocation);
        }
    }
    let new_info = write_payload(engine, path, info.value_type, has_key_index, &payload)?;
    Ok(WriteOutcome {
        info: new_info,
        deallocate,
    })
}
