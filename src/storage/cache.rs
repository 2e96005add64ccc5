//! Bounded cache of resolved node record descriptors.
//!
//! Keyed by path. Writers update entries optimistically after a successful
//! write and invalidate the whole subtree when a structural change moves or
//! deletes descendants.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::storage::chunk::RecordInfo;

/// Cache of node record descriptors.
pub struct NodeCache {
    entries: Mutex<LruCache<String, RecordInfo>>,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks a path up.
    pub fn find(&self, path: &str) -> Option<RecordInfo> {
        self.entries.lock().get(path).cloned()
    }

    /// Stores or refreshes the descriptor for `path`.
    pub fn update(&self, path: &str, info: RecordInfo) {
        self.entries.lock().put(path.to_string(), info);
    }

    /// Drops the entry for `path`; with `recursive`, also every descendant.
    pub fn invalidate(&self, path: &str, recursive: bool) {
        let mut entries = self.entries.lock();
        entries.pop(path);
        if !recursive {
            return;
        }
        let descendants: Vec<String> = entries
            .iter()
            .filter(|(cached, _)| is_descendant(cached, path))
            .map(|(cached, _)| cached.clone())
            .collect();
        for key in descendants {
            entries.pop(&key);
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn is_descendant(candidate: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return !candidate.is_empty();
    }
    candidate.len() > ancestor.len()
        && candidate.starts_with(ancestor)
        && matches!(candidate.as_bytes()[ancestor.len()], b'/' | b'[')
}
