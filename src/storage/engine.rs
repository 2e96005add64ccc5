//! Storage engine facade: file bootstrap, node operations, lock
//! orchestration and the cascading parent updates that keep references
//! consistent when nodes move.
//!
//! The FST, KIT, node cache and lock manager are owned by the engine
//! instance (arena style); nothing lives in process globals, so the
//! allocate/release/intern entry points stay proxyable for multi-process
//! scale-out.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ArborError, Result};
use crate::locker::{NodeLock, NodeLocker};
use crate::path::{PathInfo, PathKey};
use crate::storage::address::{AllocatedRange, Allocation, RecordAddress};
use crate::storage::cache::NodeCache;
use crate::storage::chunk::RecordInfo;
use crate::storage::codec::{resolve_entry_value, EntryValue};
use crate::storage::file::StorageFile;
use crate::storage::fst::{FreeSpaceTable, FstStats};
use crate::storage::header::{FileHeader, FLAG_LOCKED, HEADER_REGION_SIZE};
use crate::storage::kit::KeyIndexTable;
use crate::storage::options::EngineOptions;
use crate::storage::reader::{self, ReadCtx, ReadOptions};
use crate::storage::writer::{self, MergeEntry};
use crate::types::{Value, ValueType};

/// Resolved description of a node, as returned by
/// [`StorageEngine::get_node_info`].
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node's path.
    pub path: String,
    /// Whether the node exists at all.
    pub exists: bool,
    /// Stored value type, when the node exists.
    pub value_type: Option<ValueType>,
    /// Record address for nodes with their own records.
    pub address: Option<RecordAddress>,
    /// Whether the node's children are behind a B+Tree key index.
    pub has_key_index: bool,
    /// The value itself, when it is embedded in the parent (tiny or inline).
    pub value: Option<Value>,
}

/// One child of a node, as returned by [`StorageEngine::get_children`].
#[derive(Debug, Clone)]
pub struct ChildSummary {
    /// Key of the child within its parent.
    pub key: PathKey,
    /// Stored value type.
    pub value_type: ValueType,
    /// The value, when embedded in the parent.
    pub value: Option<Value>,
    /// Record address, when the child has its own records.
    pub address: Option<RecordAddress>,
}

/// Options for [`StorageEngine::repair_node`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairOptions {
    /// Remove broken child references instead of replacing them with empty
    /// objects.
    pub remove_broken: bool,
}

/// Counters exposed by [`StorageEngine::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatsSnapshot {
    /// Nodes materialized by readers.
    pub node_reads: u64,
    /// Node record writes.
    pub node_writes: u64,
    /// Node cache hits.
    pub cache_hits: u64,
    /// Node cache misses.
    pub cache_misses: u64,
    /// Key tree rebuilds.
    pub tree_rebuilds: u64,
    /// Free space table state.
    pub fst: Option<FstStats>,
    /// Interned key count.
    pub kit_keys: usize,
}

#[derive(Default)]
struct EngineStats {
    node_reads: AtomicU64,
    node_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    tree_rebuilds: AtomicU64,
}

/// Outcome of resolving a path against the stored tree.
pub(crate) enum ResolvedNode {
    /// Nothing stored at the path.
    Missing,
    /// The value lives inside its parent's records.
    Embedded(Value),
    /// The node has records of its own.
    Stored(RecordInfo),
}

pub(crate) struct EngineInner {
    record_size: usize,
    page_size: u16,
    max_inline: usize,
    key_index_threshold: usize,
    fst_region_len: usize,
    file: StorageFile,
    header: Mutex<FileHeader>,
    fst: Mutex<FreeSpaceTable>,
    kit: Mutex<KeyIndexTable>,
    cache: NodeCache,
    pub(crate) locker: NodeLocker,
    /// Serializes whole write operations (read-merge-cascade). Path locks
    /// still provide reader/writer visibility; the gate keeps sibling
    /// cascades from interleaving their parent rewrites.
    write_gate: tokio::sync::Mutex<()>,
    stats: EngineStats,
    poisoned: AtomicBool,
    maintenance: AtomicBool,
}

impl EngineInner {
    pub(crate) fn record_size(&self) -> usize {
        self.record_size
    }

    pub(crate) fn page_size(&self) -> u16 {
        self.page_size
    }

    pub(crate) fn max_inline_value_size(&self) -> usize {
        self.max_inline
    }

    pub(crate) fn key_index_threshold(&self) -> usize {
        self.key_index_threshold
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(ArborError::Critical(
                "engine disabled after a failed critical metadata write".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn read_single_record(&self, address: RecordAddress) -> Result<Vec<u8>> {
        let range = AllocatedRange::new(address.page_nr, address.record_nr, 1)?;
        self.file.read_range(&range)
    }

    pub(crate) fn read_record_range(&self, range: &AllocatedRange) -> Result<Vec<u8>> {
        self.file.read_range(range)
    }

    pub(crate) fn write_record_range(&self, range: &AllocatedRange, bytes: &[u8]) -> Result<()> {
        self.file.write_range(range, bytes)
    }

    /// Writes raw bytes into a node's payload at a payload-relative offset,
    /// spanning record and chunk boundaries as needed.
    pub(crate) fn patch_payload_bytes(
        &self,
        info: &RecordInfo,
        mut offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let (address, within) =
                reader::payload_byte_location(info, self.record_size, offset)?;
            let span = (self.record_size - within).min(remaining.len());
            let file_offset = self.file.layout().record_offset(address) + within as u64;
            self.file.write_at(file_offset, &remaining[..span])?;
            remaining = &remaining[span..];
            offset += span as u64;
        }
        Ok(())
    }

    fn guard_structural_write(&self) -> Result<()> {
        self.check_usable()?;
        if self.maintenance.load(Ordering::Acquire) {
            return Err(ArborError::Lock {
                path: String::new(),
                reason: "database is locked for exclusive maintenance".into(),
            });
        }
        Ok(())
    }

    pub(crate) fn allocate(&self, records: u64) -> Result<Allocation> {
        self.guard_structural_write()?;
        let allocation = self.fst.lock().allocate(records)?;
        self.persist_fst()?;
        Ok(allocation)
    }

    pub(crate) fn release_ranges(&self, ranges: &[AllocatedRange]) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        self.guard_structural_write()?;
        self.fst.lock().release(ranges)?;
        self.persist_fst()
    }

    pub(crate) fn release_allocations(&self, allocations: Vec<Allocation>) -> Result<()> {
        for allocation in allocations {
            self.release_ranges(&allocation)?;
        }
        Ok(())
    }

    fn persist_fst(&self) -> Result<()> {
        let layout = self.file.layout();
        let (bytes, used) = {
            let mut fst = self.fst.lock();
            let bytes = fst.to_bytes(self.fst_region_len);
            let used = 6 + fst.stats().ranges * 8;
            (bytes, used)
        };
        self.file.write_at(layout.fst_offset, &bytes[..used])
    }

    pub(crate) fn intern_key(&self, key: &str) -> Result<Option<u16>> {
        self.check_usable()?;
        let (index, added, bytes) = {
            let mut kit = self.kit.lock();
            match kit.get_or_add(key) {
                None => return Ok(None),
                Some((index, added)) => {
                    let bytes = if added { Some(kit.to_bytes()) } else { None };
                    (index, added, bytes)
                }
            }
        };
        if added {
            let layout = self.file.layout();
            let result = self
                .file
                .write_at(layout.kit_offset, &bytes.expect("serialized on add"))
                .and_then(|()| self.file.sync());
            if let Err(err) = result {
                // In-memory and on-disk KIT have diverged; nothing stored
                // from here on could be trusted.
                self.poisoned.store(true, Ordering::Release);
                return Err(ArborError::Critical(format!(
                    "key index table write failed: {err}"
                )));
            }
            debug!(key, index, "kit.interned");
        }
        Ok(Some(index))
    }

    pub(crate) fn key_name(&self, index: u16) -> Result<String> {
        Ok(self.kit.lock().key(index)?.to_string())
    }

    pub(crate) fn root_address(&self) -> RecordAddress {
        self.header.lock().root_address
    }

    pub(crate) fn set_root_address(&self, address: RecordAddress) -> Result<()> {
        self.check_usable()?;
        let mut header = self.header.lock();
        header.root_address = address;
        let mut region = vec![0u8; HEADER_REGION_SIZE];
        header.write(&mut region)?;
        drop(header);
        let result = self
            .file
            .write_at(0, &region)
            .and_then(|()| self.file.sync());
        if let Err(err) = result {
            self.poisoned.store(true, Ordering::Release);
            return Err(ArborError::Critical(format!(
                "root pointer write failed: {err}"
            )));
        }
        debug!(address = %address, "root.moved");
        Ok(())
    }

    pub(crate) fn update_cache(&self, path: &str, info: RecordInfo) {
        self.cache.update(path, info);
    }

    pub(crate) fn invalidate_cache(&self, path: &str, recursive: bool) {
        self.cache.invalidate(path, recursive);
    }

    pub(crate) fn note_node_read(&self) {
        self.stats.node_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_node_write(&self) {
        self.stats.node_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_tree_rebuild(&self) {
        self.stats.tree_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Resolves a path to its stored representation, using and refreshing
    /// the node cache along the way.
    pub(crate) fn resolve(&self, path: &PathInfo) -> Result<ResolvedNode> {
        if path.is_root() {
            if let Some(info) = self.cache.find("") {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ResolvedNode::Stored(info));
            }
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            let info = reader::read_record_info(self, "", self.root_address())?;
            self.cache.update("", info.clone());
            return Ok(ResolvedNode::Stored(info));
        }
        let path_str = path.to_string();
        if let Some(info) = self.cache.find(&path_str) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ResolvedNode::Stored(info));
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let parent = path.parent().expect("non-root path has a parent");
        let parent_info = match self.resolve(&parent)? {
            ResolvedNode::Stored(info) if info.value_type.is_structured() => info,
            _ => return Ok(ResolvedNode::Missing),
        };
        let key = normalize_key(parent_info.value_type, path.key().expect("non-root"))?;
        let children = reader::get_children(
            self,
            &parent.to_string(),
            &parent_info,
            Some(std::slice::from_ref(&key)),
        )?;
        let Some(child) = children.into_iter().find(|child| child.key == key) else {
            return Ok(ResolvedNode::Missing);
        };
        match child.value {
            EntryValue::Record {
                value_type,
                address,
            } => {
                let info = reader::read_record_info(self, &path_str, address)?;
                if info.value_type != value_type {
                    return Err(ArborError::Corruption(format!(
                        "child entry at \"{path_str}\" declares {value_type:?} but the record \
                         holds {:?}",
                        info.value_type
                    )));
                }
                self.cache.update(&path_str, info.clone());
                Ok(ResolvedNode::Stored(info))
            }
            other => {
                let value = resolve_entry_value(&other)?
                    .expect("tiny and inline entries always resolve");
                Ok(ResolvedNode::Embedded(value))
            }
        }
    }

    fn stats_snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            node_reads: self.stats.node_reads.load(Ordering::Relaxed),
            node_writes: self.stats.node_writes.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            tree_rebuilds: self.stats.tree_rebuilds.load(Ordering::Relaxed),
            fst: Some(self.fst.lock().stats()),
            kit_keys: self.kit.lock().len(),
        }
    }
}

/// Maps a path key onto the collection type actually stored: numeric names
/// address array elements, indices under an object are plain numeric keys.
fn normalize_key(collection: ValueType, key: &PathKey) -> Result<PathKey> {
    match (collection, key) {
        (ValueType::Array, PathKey::Index(_)) => Ok(key.clone()),
        (ValueType::Array, PathKey::Name(name)) => match name.parse::<usize>() {
            Ok(index) => Ok(PathKey::Index(index)),
            Err(_) => Err(ArborError::InvalidArgument(format!(
                "array nodes take numeric keys, got \"{name}\""
            ))),
        },
        (ValueType::Object, PathKey::Index(index)) => Ok(PathKey::Name(index.to_string())),
        (ValueType::Object, PathKey::Name(_)) => Ok(key.clone()),
        (other, _) => Err(ArborError::InvalidArgument(format!(
            "{other:?} nodes have no children"
        ))),
    }
}

/// The embedded hierarchical key-tree storage engine.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    /// Opens (creating when absent) a database file. Parameters recorded in
    /// an existing file's header override `record_size`, `page_size` and
    /// `max_inline_value_size` from `options`.
    pub fn open(path: &Path, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let probe = StorageFile::open(path, &options)?;
        let header_bytes = probe.read_at(0, HEADER_REGION_SIZE)?;
        let existing = FileHeader::read(&header_bytes)?;

        let mut effective = options.clone();
        if let Some(header) = &existing {
            effective.record_size = header.record_size;
            effective.page_size = header.page_size;
            effective.max_inline_value_size = header.max_inline_value_size;
            effective.validate()?;
        }
        let file = StorageFile::open(path, &effective)?;
        let layout = *file.layout();

        let (header, fst, kit, fresh) = match existing {
            Some(header) => {
                let kit_bytes = file.read_at(layout.kit_offset, layout.kit_len)?;
                let kit = KeyIndexTable::load(&kit_bytes, layout.kit_len)?;
                let fst_bytes = file.read_at(layout.fst_offset, layout.fst_len)?;
                let fst = FreeSpaceTable::load(
                    &fst_bytes,
                    header.page_size,
                    effective.fst_range_capacity(),
                )?;
                (header, fst, kit, false)
            }
            None => {
                let header = FileHeader::new(
                    effective.record_size,
                    effective.page_size,
                    effective.max_inline_value_size,
                );
                let fst =
                    FreeSpaceTable::new(header.page_size, effective.fst_range_capacity());
                let kit = KeyIndexTable::new(layout.kit_len);
                (header, fst, kit, true)
            }
        };

        let maintenance = header.is_locked();
        let inner = Arc::new(EngineInner {
            record_size: usize::from(header.record_size),
            page_size: header.page_size,
            max_inline: usize::from(header.max_inline_value_size),
            key_index_threshold: effective.key_index_threshold,
            fst_region_len: layout.fst_len,
            file,
            header: Mutex::new(header),
            fst: Mutex::new(fst),
            kit: Mutex::new(kit),
            cache: NodeCache::new(effective.node_cache_entries),
            locker: NodeLocker::new(effective.lock_timeout),
            write_gate: tokio::sync::Mutex::new(()),
            stats: EngineStats::default(),
            poisoned: AtomicBool::new(false),
            maintenance: AtomicBool::new(maintenance),
        });

        if fresh {
            // Bootstrap: persist the header, then store the root node. The
            // first allocation of a fresh FST is page 0 record 0, the
            // default root address.
            inner.set_root_address(RecordAddress::new(0, 0))?;
            let root = PathInfo::root();
            let outcome =
                writer::write_node_value(&inner, &root, &Value::empty_object(), None)?;
            inner.set_root_address(outcome.info.address)?;
            info!(path = %path.display(), "engine.created");
        } else {
            info!(
                path = %path.display(),
                pages = inner.fst.lock().page_count(),
                "engine.opened"
            );
        }
        if maintenance {
            warn!("database flagged as locked for exclusive maintenance");
        }
        Ok(Self { inner })
    }

    /// Current engine counters.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.inner.stats_snapshot()
    }

    /// Sets or clears the exclusive-maintenance flag. While set, every
    /// structural write is refused.
    pub fn set_maintenance_lock(&self, locked: bool) -> Result<()> {
        self.inner.check_usable()?;
        {
            let mut header = self.inner.header.lock();
            if locked {
                header.flags |= FLAG_LOCKED;
            } else {
                header.flags &= !FLAG_LOCKED;
            }
            let mut region = vec![0u8; HEADER_REGION_SIZE];
            header.write(&mut region)?;
            drop(header);
            self.inner.file.write_at(0, &region)?;
            self.inner.file.sync()?;
        }
        self.inner.maintenance.store(locked, Ordering::Release);
        info!(locked, "engine.maintenance");
        Ok(())
    }

    /// Flushes pending file data to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.file.sync()
    }

    /// Reads the value at `path`. `None` when nothing is stored there.
    pub async fn get_node(&self, path: &str, options: &ReadOptions) -> Result<Option<Value>> {
        let path = PathInfo::parse(path)?;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&path, tid, false, "get_node")
            .await?;
        lock.assert_active()?;
        match self.inner.resolve(&path)? {
            ResolvedNode::Missing => Ok(None),
            ResolvedNode::Embedded(value) => Ok(Some(value)),
            ResolvedNode::Stored(info) => {
                let mut ctx = ReadCtx::new();
                let value = reader::get_value(&self.inner, &path, &info, options, &mut ctx)?;
                Ok(Some(value))
            }
        }
    }

    /// Resolves a path without materializing a stored subtree.
    pub async fn get_node_info(&self, path: &str) -> Result<NodeInfo> {
        let parsed = PathInfo::parse(path)?;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, false, "get_node_info")
            .await?;
        lock.assert_active()?;
        Ok(match self.inner.resolve(&parsed)? {
            ResolvedNode::Missing => NodeInfo {
                path: path.to_string(),
                exists: false,
                value_type: None,
                address: None,
                has_key_index: false,
                value: None,
            },
            ResolvedNode::Embedded(value) => NodeInfo {
                path: path.to_string(),
                exists: true,
                value_type: Some(value.value_type()),
                address: None,
                has_key_index: false,
                value: Some(value),
            },
            ResolvedNode::Stored(info) => NodeInfo {
                path: path.to_string(),
                exists: true,
                value_type: Some(info.value_type),
                address: Some(info.address),
                has_key_index: info.has_key_index,
                value: None,
            },
        })
    }

    /// Lists the children of the node at `path`. Missing nodes and
    /// non-structured values read as "no children".
    pub async fn get_children(&self, path: &str) -> Result<Vec<ChildSummary>> {
        let parsed = PathInfo::parse(path)?;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, false, "get_children")
            .await?;
        lock.assert_active()?;
        let info = match self.inner.resolve(&parsed)? {
            ResolvedNode::Stored(info) if info.value_type.is_structured() => info,
            _ => return Ok(Vec::new()),
        };
        let children = reader::get_children(&self.inner, path, &info, None)?;
        children
            .into_iter()
            .map(|child| {
                let value = resolve_entry_value(&child.value)?;
                let (value_type, address) = match &child.value {
                    EntryValue::Record {
                        value_type,
                        address,
                    } => (*value_type, Some(*address)),
                    other => (other.value_type(), None),
                };
                Ok(ChildSummary {
                    key: child.key,
                    value_type,
                    value,
                    address,
                })
            })
            .collect()
    }

    /// Stores `value` at `path`, overwriting whatever was there and creating
    /// missing ancestors as objects.
    pub async fn set_node(&self, path: &str, value: Value) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        self.set_node_inner(path, value).await
    }

    async fn set_node_inner(&self, path: &str, value: Value) -> Result<()> {
        let parsed = PathInfo::parse(path)?;
        let tid = self.inner.locker.next_transaction_id();
        if parsed.is_root() {
            if !matches!(value, Value::Object(_)) {
                return Err(ArborError::InvalidArgument(
                    "the root node must hold an object".into(),
                ));
            }
            let lock = self
                .inner
                .locker
                .lock(&parsed, tid, true, "set_node root")
                .await?;
            lock.assert_active()?;
            let prior = match self.inner.resolve(&parsed)? {
                ResolvedNode::Stored(info) => info,
                _ => return Err(ArborError::Internal("root node is missing".into())),
            };
            let outcome = writer::write_node_value(&self.inner, &parsed, &value, Some(&prior))?;
            self.inner.set_root_address(outcome.info.address)?;
            self.inner.release_allocations(outcome.deallocate)?;
            return Ok(());
        }
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, true, "set_node")
            .await?;
        let key = parsed.key().expect("non-root path").clone();
        let parent = parsed.parent().expect("non-root path");
        let lock = lock.move_to_parent("set_node parent entry").await?;
        self.merge_and_cascade(lock, parent, vec![(key, Some(MergeEntry::Value(value)))])
            .await
    }

    /// Merges `updates` into the children of the node at `path`. A `None`
    /// value removes the key; missing targets are created (ancestors
    /// included) as objects.
    pub async fn update_node<I, K>(&self, path: &str, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Option<Value>)>,
        K: Into<String>,
    {
        let parsed = PathInfo::parse(path)?;
        let updates: Vec<(PathKey, Option<MergeEntry>)> = updates
            .into_iter()
            .map(|(key, value)| {
                (
                    PathKey::Name(key.into()),
                    value.map(MergeEntry::Value),
                )
            })
            .collect();
        if updates.is_empty() {
            return Ok(());
        }
        let _gate = self.inner.write_gate.lock().await;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, true, "update_node")
            .await?;
        self.merge_and_cascade(lock, parsed, updates).await
    }

    /// Removes the node at `path`. Removing the root resets it to an empty
    /// object.
    pub async fn remove_node(&self, path: &str) -> Result<()> {
        let parsed = PathInfo::parse(path)?;
        let _gate = self.inner.write_gate.lock().await;
        if parsed.is_root() {
            return self.set_node_inner("", Value::empty_object()).await;
        }
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, true, "remove_node")
            .await?;
        let key = parsed.key().expect("non-root path").clone();
        let parent = parsed.parent().expect("non-root path");
        let lock = lock.move_to_parent("remove_node parent entry").await?;
        self.merge_and_cascade(lock, parent, vec![(key, None)]).await
    }

    /// Reads the value at `path`, passes it to `apply` and stores the
    /// returned value, all under one write lock. Returning `None` removes
    /// the node.
    pub async fn transact_node<F>(&self, path: &str, apply: F) -> Result<()>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let parsed = PathInfo::parse(path)?;
        let _gate = self.inner.write_gate.lock().await;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, true, "transact_node")
            .await?;
        lock.assert_active()?;
        let current = match self.inner.resolve(&parsed)? {
            ResolvedNode::Missing => None,
            ResolvedNode::Embedded(value) => Some(value),
            ResolvedNode::Stored(info) => {
                let mut ctx = ReadCtx::new();
                Some(reader::get_value(
                    &self.inner,
                    &parsed,
                    &info,
                    &ReadOptions::all(),
                    &mut ctx,
                )?)
            }
        };
        let next = apply(current);
        if parsed.is_root() {
            drop(lock);
            return match next {
                Some(value) => self.set_node_inner("", value).await,
                None => self.set_node_inner("", Value::empty_object()).await,
            };
        }
        let key = parsed.key().expect("non-root path").clone();
        let parent = parsed.parent().expect("non-root path");
        let lock = lock.move_to_parent("transact_node parent entry").await?;
        self.merge_and_cascade(lock, parent, vec![(key, next.map(MergeEntry::Value))])
            .await
    }

    /// Checks the node at `path` for unreadable child references and patches
    /// them: broken children are removed or replaced with empty objects,
    /// never reconstructed by guesswork.
    pub async fn repair_node(&self, path: &str, options: RepairOptions) -> Result<usize> {
        let parsed = PathInfo::parse(path)?;
        let _gate = self.inner.write_gate.lock().await;
        let tid = self.inner.locker.next_transaction_id();
        let lock = self
            .inner
            .locker
            .lock(&parsed, tid, true, "repair_node")
            .await?;
        lock.assert_active()?;
        let info = match self.inner.resolve(&parsed)? {
            ResolvedNode::Stored(info) if info.value_type.is_structured() => info,
            _ => return Ok(0),
        };
        let children = reader::get_children(&self.inner, path, &info, None)?;
        let mut repairs: Vec<(PathKey, Option<MergeEntry>)> = Vec::new();
        for child in children {
            if let EntryValue::Record { address, .. } = child.value {
                let child_path = parsed.child(child.key.clone());
                if let Err(err) =
                    reader::read_record_info(&self.inner, &child_path.to_string(), address)
                {
                    warn!(path = %child_path, error = %err, "repair.broken_child");
                    let replacement = if options.remove_broken {
                        None
                    } else {
                        Some(MergeEntry::Value(Value::empty_object()))
                    };
                    repairs.push((child.key, replacement));
                }
            }
        }
        if repairs.is_empty() {
            return Ok(0);
        }
        let count = repairs.len();
        info!(path, count, "repair.patching");
        self.merge_and_cascade(lock, parsed, repairs).await?;
        Ok(count)
    }

    /// Runs [`Self::repair_node`] over the node and every reachable
    /// structured descendant. Returns the number of patched references.
    pub async fn repair_node_tree(&self, path: &str) -> Result<usize> {
        let mut repaired = 0usize;
        let mut pending = vec![path.to_string()];
        while let Some(current) = pending.pop() {
            repaired += self
                .repair_node(&current, RepairOptions { remove_broken: true })
                .await?;
            for child in self.get_children(&current).await? {
                if child.address.is_some() && child.value_type.is_structured() {
                    let child_path = match (&child.key, current.is_empty()) {
                        (key, true) => key.to_segment(),
                        (PathKey::Name(name), false) => format!("{current}/{name}"),
                        (PathKey::Index(index), false) => format!("{current}[{index}]"),
                    };
                    pending.push(child_path);
                }
            }
        }
        Ok(repaired)
    }

    /// Merges updates into the node at `path` (which the given lock must
    /// cover), creating missing ancestors and cascading address changes up
    /// to the root pointer.
    async fn merge_and_cascade(
        &self,
        mut lock: NodeLock,
        mut path: PathInfo,
        mut updates: Vec<(PathKey, Option<MergeEntry>)>,
    ) -> Result<()> {
        let inner = &self.inner;
        // Walk up until the merge target exists and is structured, wrapping
        // the updates into fresh objects along the way.
        let info = loop {
            lock.assert_active()?;
            if lock.path() != &path {
                lock = lock.move_to_parent("merge target ascent").await?;
            }
            match inner.resolve(&path)? {
                ResolvedNode::Stored(info) if info.value_type.is_structured() => break info,
                ResolvedNode::Missing | ResolvedNode::Embedded(_) | ResolvedNode::Stored(_) => {
                    if path.is_root() {
                        return Err(ArborError::Internal(
                            "root node is missing or not structured".into(),
                        ));
                    }
                    let wrapped = wrap_updates(updates)?;
                    let Some(wrapped) = wrapped else {
                        // Only deletions against a missing node: nothing to
                        // do.
                        return Ok(());
                    };
                    let key = path.key().expect("non-root path").clone();
                    if matches!(key, PathKey::Index(_)) {
                        return Err(ArborError::InvalidArgument(format!(
                            "cannot auto-create array element \"{path}\"; store the array \
                             through its parent instead"
                        )));
                    }
                    path = path.parent().expect("non-root path");
                    updates = vec![(key, Some(MergeEntry::Value(wrapped)))];
                }
            }
        };

        // Normalize keys against the target collection type.
        let updates = updates
            .into_iter()
            .map(|(key, value)| Ok((normalize_key(info.value_type, &key)?, value)))
            .collect::<Result<Vec<_>>>()?;

        let outcome = writer::merge_node(inner, &path, &info, updates)?;
        let mut stale = outcome.deallocate;

        // Cascade: while the written node moved, patch or merge its parent.
        let mut moved = outcome.info;
        let mut old_address = info.address;
        while moved.address != old_address {
            if path.is_root() {
                inner.set_root_address(moved.address)?;
                break;
            }
            let key = path.key().expect("non-root path").clone();
            let child_type = moved.value_type;
            let child_address = moved.address;
            path = path.parent().expect("non-root path");
            lock = lock.move_to_parent("cascade parent update").await?;
            lock.assert_active()?;
            let parent_info = match inner.resolve(&path)? {
                ResolvedNode::Stored(info) if info.value_type.is_structured() => info,
                _ => {
                    return Err(ArborError::Internal(format!(
                        "parent of moved node at \"{path}\" is not a stored collection"
                    )))
                }
            };
            let key = normalize_key(parent_info.value_type, &key)?;
            if writer::try_patch_child_address(
                inner,
                &path,
                &parent_info,
                &key,
                child_type,
                child_address,
            )? {
                break;
            }
            let entry = MergeEntry::Raw(EntryValue::Record {
                value_type: child_type,
                address: child_address,
            });
            let parent_outcome =
                writer::merge_node(inner, &path, &parent_info, vec![(key, Some(entry))])?;
            stale.extend(parent_outcome.deallocate);
            old_address = parent_info.address;
            moved = parent_outcome.info;
        }

        drop(lock);
        inner.release_allocations(stale)?;
        Ok(())
    }
}

/// Wraps pending updates into a fresh object value for creation of a
/// missing target; deletions are dropped. `None` when nothing remains.
#[allow(clippy::type_complexity)]
fn wrap_updates(updates: Vec<(PathKey, Option<MergeEntry>)>) -> Result<Option<Value>> {
    let mut map = std::collections::BTreeMap::new();
    for (key, update) in updates {
        let Some(update) = update else { continue };
        let value = match update {
            MergeEntry::Value(value) => value,
            MergeEntry::Raw(_) => {
                return Err(ArborError::Internal(
                    "cannot wrap a raw entry into a fresh node".into(),
                ))
            }
        };
        let name = match key {
            PathKey::Name(name) => name,
            PathKey::Index(index) => index.to_string(),
        };
        map.insert(name, value);
    }
    if map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Object(map)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_against_collection_type() {
        let key = normalize_key(ValueType::Array, &PathKey::Name("3".into())).expect("numeric");
        assert_eq!(key, PathKey::Index(3));
        assert!(normalize_key(ValueType::Array, &PathKey::Name("x".into())).is_err());
        let key = normalize_key(ValueType::Object, &PathKey::Index(3)).expect("index");
        assert_eq!(key, PathKey::Name("3".into()));
        assert!(normalize_key(ValueType::String, &PathKey::Index(0)).is_err());
    }

    #[test]
    fn wrapping_drops_deletes_and_keeps_values() {
        let wrapped = wrap_updates(vec![
            (PathKey::Name("a".into()), Some(MergeEntry::Value(Value::Boolean(true)))),
            (PathKey::Name("b".into()), None),
        ])
        .expect("wrap");
        let Some(Value::Object(map)) = wrapped else {
            panic!("expected an object");
        };
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a"), Some(&Value::Boolean(true)));

        let nothing = wrap_updates(vec![(PathKey::Name("b".into()), None)]).expect("wrap");
        assert!(nothing.is_none());
    }
}
