use std::time::Duration;

use crate::error::{ArborError, Result};

/// Default bytes per record.
pub const DEFAULT_RECORD_SIZE: u16 = 128;
/// Default records per page.
pub const DEFAULT_PAGE_SIZE: u16 = 1024;
/// Default inline value threshold.
pub const DEFAULT_MAX_INLINE_VALUE_SIZE: u16 = 50;
/// Hard cap for the inline threshold, bounded by the 6-bit length field.
pub const MAX_INLINE_VALUE_SIZE_LIMIT: u16 = 64;
/// Default cap on persisted free-space ranges.
pub const DEFAULT_MAX_FST_RANGES: usize = 8191;
/// Default byte size of the key index table region.
pub const DEFAULT_KIT_REGION_SIZE: usize = 65_536 - 64;
/// Default byte size of the free space table region.
pub const DEFAULT_FST_REGION_SIZE: usize = 65_536;
/// Child count above which a node gets a B+Tree key index.
pub const DEFAULT_KEY_INDEX_THRESHOLD: usize = 100;

/// Configuration options supplied when opening a [`super::StorageEngine`].
///
/// Region sizes and caps default to the legacy bit-exact layout; files
/// created with non-default region sizes are only readable by an engine
/// opened with the same values.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bytes per record.
    pub record_size: u16,
    /// Records per page.
    pub page_size: u16,
    /// Largest value stored inline inside its parent's records.
    pub max_inline_value_size: u16,
    /// Age after which a granted lock is treated as expired.
    pub lock_timeout: Duration,
    /// Cap on persisted free-space ranges; smallest ranges are evicted
    /// (lossily) beyond it.
    pub max_fst_ranges: usize,
    /// Byte size of the on-disk key index table region.
    pub kit_region_size: usize,
    /// Byte size of the on-disk free space table region.
    pub fst_region_size: usize,
    /// Maximum entries kept in the node info cache.
    pub node_cache_entries: usize,
    /// Serialized child count above which a B+Tree key index is built.
    pub key_index_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            record_size: DEFAULT_RECORD_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            max_inline_value_size: DEFAULT_MAX_INLINE_VALUE_SIZE,
            lock_timeout: Duration::from_secs(120),
            max_fst_ranges: DEFAULT_MAX_FST_RANGES,
            kit_region_size: DEFAULT_KIT_REGION_SIZE,
            fst_region_size: DEFAULT_FST_REGION_SIZE,
            node_cache_entries: 1024,
            key_index_threshold: DEFAULT_KEY_INDEX_THRESHOLD,
        }
    }
}

impl EngineOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record size in bytes.
    pub fn record_size(mut self, bytes: u16) -> Self {
        self.record_size = bytes;
        self
    }

    /// Sets the number of records per page.
    pub fn page_size(mut self, records: u16) -> Self {
        self.page_size = records;
        self
    }

    /// Sets the inline value threshold.
    pub fn max_inline_value_size(mut self, bytes: u16) -> Self {
        self.max_inline_value_size = bytes;
        self
    }

    /// Sets the lock expiry timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the node info cache capacity.
    pub fn node_cache_entries(mut self, entries: usize) -> Self {
        self.node_cache_entries = entries;
        self
    }

    /// Sets the child count threshold for key index promotion.
    pub fn key_index_threshold(mut self, children: usize) -> Self {
        self.key_index_threshold = children;
        self
    }

    /// Validates option combinations before a file is created or opened.
    pub fn validate(&self) -> Result<()> {
        if self.record_size < 32 {
            return Err(ArborError::InvalidArgument(
                "record size must be at least 32 bytes".into(),
            ));
        }
        if self.page_size < 8 {
            return Err(ArborError::InvalidArgument(
                "page size must be at least 8 records".into(),
            ));
        }
        if self.max_inline_value_size > MAX_INLINE_VALUE_SIZE_LIMIT {
            return Err(ArborError::InvalidArgument(format!(
                "max inline value size is bounded at {MAX_INLINE_VALUE_SIZE_LIMIT} bytes \
                 by the 6-bit length field"
            )));
        }
        if self.kit_region_size < 256 || self.fst_region_size < 256 {
            return Err(ArborError::InvalidArgument(
                "KIT/FST regions must be at least 256 bytes".into(),
            ));
        }
        if self.key_index_threshold == 0 {
            return Err(ArborError::InvalidArgument(
                "key index threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Largest number of free ranges the FST region can hold; the configured
    /// cap is clamped to it.
    pub fn fst_range_capacity(&self) -> usize {
        let usable = self.fst_region_size.saturating_sub(6);
        self.max_fst_ranges.min(usable / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineOptions::default().validate().expect("defaults valid");
    }

    #[test]
    fn inline_threshold_is_bounded() {
        let options = EngineOptions::default().max_inline_value_size(65);
        assert!(options.validate().is_err());
    }

    #[test]
    fn fst_capacity_honors_region_size() {
        let options = EngineOptions::default();
        assert_eq!(options.fst_range_capacity(), DEFAULT_MAX_FST_RANGES);
    }
}
