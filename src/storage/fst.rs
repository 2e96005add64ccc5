//! Free Space Table: tracks unallocated record ranges across pages.
//!
//! Allocation strategy, in order: exact-fit range, first strictly-larger
//! range (excess trimmed back), scrap-merge over a bounded number of ranges,
//! whole new pages as a last resort. Released ranges are re-added and
//! normalized immediately so adjacent runs on the same page merge.

use smallvec::smallvec;
use tracing::warn;

use crate::error::{ArborError, Result};
use crate::storage::address::{AllocatedRange, Allocation};

/// One free run of records on a page. `end` is exclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FreeRange {
    /// Page the run lives on.
    pub page_nr: u32,
    /// First free record.
    pub start: u16,
    /// One past the last free record.
    pub end: u16,
}

impl FreeRange {
    fn length(&self) -> u16 {
        self.end - self.start
    }
}

/// Snapshot of FST state for stats and the inspect tool.
#[derive(Debug, Clone, Copy)]
pub struct FstStats {
    /// Number of tracked free ranges.
    pub ranges: usize,
    /// Total free records.
    pub free_records: u64,
    /// Total pages in the file.
    pub page_count: u32,
    /// Records whose free-space tracking was dropped by capacity eviction.
    pub dropped_records: u64,
}

/// In-memory free space table.
#[derive(Debug)]
pub struct FreeSpaceTable {
    ranges: Vec<FreeRange>,
    page_count: u32,
    page_size: u16,
    capacity: usize,
    dropped_records: u64,
}

impl FreeSpaceTable {
    /// Creates an empty table for a fresh file.
    pub fn new(page_size: u16, capacity: usize) -> Self {
        Self {
            ranges: Vec::new(),
            page_count: 0,
            page_size,
            capacity,
            dropped_records: 0,
        }
    }

    /// Loads the table from its on-disk region.
    pub fn load(bytes: &[u8], page_size: u16, capacity: usize) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(ArborError::Corruption("FST region truncated".into()));
        }
        let page_count = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let range_count = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        let needed = 6 + range_count * 8;
        if bytes.len() < needed {
            return Err(ArborError::Corruption(format!(
                "FST region declares {range_count} ranges but holds fewer"
            )));
        }
        let mut ranges = Vec::with_capacity(range_count);
        for i in 0..range_count {
            let entry = &bytes[6 + i * 8..6 + i * 8 + 8];
            let page_nr = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let start = u16::from_be_bytes([entry[4], entry[5]]);
            let end = u16::from_be_bytes([entry[6], entry[7]]);
            if start >= end || end > page_size || page_nr >= page_count {
                return Err(ArborError::Corruption(format!(
                    "invalid FST entry {page_nr}:{start}..{end}"
                )));
            }
            ranges.push(FreeRange {
                page_nr,
                start,
                end,
            });
        }
        let mut table = Self {
            ranges,
            page_count,
            page_size,
            capacity,
            dropped_records: 0,
        };
        table.normalize();
        Ok(table)
    }

    /// Serializes the table into its fixed region, evicting the smallest
    /// ranges when the persisted cap is exceeded. Eviction is lossy: the
    /// dropped records are never handed out again.
    pub fn to_bytes(&mut self, region_len: usize) -> Vec<u8> {
        self.enforce_capacity();
        let mut bytes = vec![0u8; region_len];
        bytes[0..4].copy_from_slice(&self.page_count.to_be_bytes());
        bytes[4..6].copy_from_slice(&(self.ranges.len() as u16).to_be_bytes());
        for (i, range) in self.ranges.iter().enumerate() {
            let entry = &mut bytes[6 + i * 8..6 + i * 8 + 8];
            entry[0..4].copy_from_slice(&range.page_nr.to_be_bytes());
            entry[4..6].copy_from_slice(&range.start.to_be_bytes());
            entry[6..8].copy_from_slice(&range.end.to_be_bytes());
        }
        bytes
    }

    fn enforce_capacity(&mut self) {
        if self.ranges.len() <= self.capacity {
            return;
        }
        let excess = self.ranges.len() - self.capacity;
        let mut by_length: Vec<usize> = (0..self.ranges.len()).collect();
        by_length.sort_by_key(|&i| self.ranges[i].length());
        let mut evict: Vec<usize> = by_length[..excess].to_vec();
        evict.sort_unstable_by(|a, b| b.cmp(a));
        let mut dropped: u64 = 0;
        for index in evict {
            dropped += u64::from(self.ranges[index].length());
            self.ranges.remove(index);
        }
        self.dropped_records += dropped;
        warn!(
            dropped_records = dropped,
            cap = self.capacity,
            "fst.overflow.evicted"
        );
    }

    /// Number of pages the data region currently spans.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Total free records currently tracked.
    pub fn free_records(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.length())).sum()
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> FstStats {
        FstStats {
            ranges: self.ranges.len(),
            free_records: self.free_records(),
            page_count: self.page_count,
            dropped_records: self.dropped_records,
        }
    }

    /// Allocates `records` records, possibly across multiple ranges and new
    /// pages. The returned allocation never contains zero-length ranges and
    /// never crosses page boundaries within a range.
    pub fn allocate(&mut self, records: u64) -> Result<Allocation> {
        if records == 0 {
            return Err(ArborError::Internal("allocation of zero records".into()));
        }

        if records <= u64::from(self.page_size) {
            let wanted = records as u16;
            // Exact fit first.
            if let Some(pos) = self.ranges.iter().position(|r| r.length() == wanted) {
                let range = self.ranges.remove(pos);
                return Ok(smallvec![AllocatedRange::new(
                    range.page_nr,
                    range.start,
                    wanted
                )?]);
            }
            // First strictly larger range, trimming the excess.
            if let Some(pos) = self.ranges.iter().position(|r| r.length() > wanted) {
                let range = &mut self.ranges[pos];
                let allocated = AllocatedRange::new(range.page_nr, range.start, wanted)?;
                range.start += wanted;
                return Ok(smallvec![allocated]);
            }
        }

        // Scrap-merge: combine up to `max_scraps` ranges, largest first so
        // the smallest scraps are used last.
        let max_scraps: usize = if self.ranges.len() > 7500 { 10 } else { 3 };
        let mut by_length: Vec<usize> = (0..self.ranges.len()).collect();
        by_length.sort_by_key(|&i| std::cmp::Reverse(self.ranges[i].length()));

        let mut picked: Vec<usize> = Vec::new();
        let mut gathered: u64 = 0;
        for &index in by_length.iter().take(max_scraps) {
            picked.push(index);
            gathered += u64::from(self.ranges[index].length());
            if gathered >= records {
                break;
            }
        }

        let mut allocation: Allocation = Allocation::new();
        let mut remaining = records;
        // Remove picked ranges from the table (highest index first so the
        // positions stay valid), then consume them.
        picked.sort_unstable_by(|a, b| b.cmp(a));
        let mut scraps: Vec<FreeRange> = picked
            .into_iter()
            .map(|index| self.ranges.remove(index))
            .collect();
        scraps.sort_by_key(|r| std::cmp::Reverse(r.length()));
        for scrap in scraps {
            if remaining == 0 {
                // Trim back the surplus scrap.
                self.ranges.push(scrap);
                continue;
            }
            let take = u64::from(scrap.length()).min(remaining) as u16;
            allocation.push(AllocatedRange::new(scrap.page_nr, scrap.start, take)?);
            remaining -= u64::from(take);
            if take < scrap.length() {
                self.ranges.push(FreeRange {
                    page_nr: scrap.page_nr,
                    start: scrap.start + take,
                    end: scrap.end,
                });
            }
        }

        // Whole new pages as the last resort.
        while remaining > 0 {
            let page_nr = self.page_count;
            self.page_count = self.page_count.checked_add(1).ok_or_else(|| {
                ArborError::AllocationLimit("page number exceeds u32 range".into())
            })?;
            let take = u64::from(self.page_size).min(remaining) as u16;
            allocation.push(AllocatedRange::new(page_nr, 0, take)?);
            remaining -= u64::from(take);
            if take < self.page_size {
                self.ranges.push(FreeRange {
                    page_nr,
                    start: take,
                    end: self.page_size,
                });
            }
        }

        self.normalize();
        Ok(allocation)
    }

    /// Returns ranges to the free pool and merges adjacent runs.
    pub fn release(&mut self, ranges: &[AllocatedRange]) -> Result<()> {
        for range in ranges {
            if range.length == 0 {
                return Err(ArborError::Internal(
                    "released range must not be empty".into(),
                ));
            }
            let end = range
                .record_nr
                .checked_add(range.length)
                .filter(|&end| end <= self.page_size)
                .ok_or_else(|| {
                    ArborError::Corruption(format!(
                        "released range {}:{}+{} exceeds page size",
                        range.page_nr, range.record_nr, range.length
                    ))
                })?;
            self.ranges.push(FreeRange {
                page_nr: range.page_nr,
                start: range.record_nr,
                end,
            });
        }
        self.normalize();
        Ok(())
    }

    /// Sorts and merges adjacent ranges on the same page. Idempotent.
    pub fn normalize(&mut self) {
        self.ranges
            .sort_by_key(|range| (range.page_nr, range.start));
        let mut merged: Vec<FreeRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.page_nr == range.page_nr && last.end >= range.start => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::address::total_records;

    fn table() -> FreeSpaceTable {
        FreeSpaceTable::new(1024, 8191)
    }

    #[test]
    fn grows_by_whole_pages_and_trims_excess() {
        let mut fst = table();
        let allocation = fst.allocate(10).expect("allocate");
        assert_eq!(total_records(&allocation), 10);
        assert_eq!(allocation.len(), 1);
        assert_eq!(fst.page_count(), 1);
        // Remainder of the fresh page is free again.
        assert_eq!(fst.free_records(), 1014);
    }

    #[test]
    fn exact_fit_is_preferred() {
        let mut fst = table();
        let a = fst.allocate(10).expect("allocate");
        let b = fst.allocate(100).expect("allocate");
        fst.release(&a).expect("release");
        let free_before = fst.free_records();
        let c = fst.allocate(10).expect("allocate");
        assert_eq!(c[0], a[0], "released exact-fit range is reused");
        assert_eq!(fst.free_records(), free_before - 10);
        drop(b);
    }

    #[test]
    fn conservation_of_records() {
        let mut fst = table();
        let mut allocations = Vec::new();
        for size in [5u64, 600, 1024, 2500, 17] {
            allocations.push(fst.allocate(size).expect("allocate"));
        }
        let allocated: u64 = allocations
            .iter()
            .map(|a| total_records(a))
            .sum();
        let total = u64::from(fst.page_count()) * 1024;
        assert_eq!(fst.free_records() + allocated, total);

        for allocation in &allocations {
            fst.release(allocation).expect("release");
        }
        assert_eq!(fst.free_records(), total);
    }

    #[test]
    fn releasing_adjacent_ranges_merges() {
        let mut fst = table();
        let a = fst.allocate(1024).expect("fill page");
        assert_eq!(fst.free_records(), 0);
        fst.release(&[AllocatedRange::new(0, 0, 10).expect("range")])
            .expect("release");
        fst.release(&[AllocatedRange::new(0, 10, 20).expect("range")])
            .expect("release");
        assert_eq!(fst.stats().ranges, 1);
        assert_eq!(fst.free_records(), 30);
        // normalize is a no-op the second time
        fst.normalize();
        assert_eq!(fst.stats().ranges, 1);
        drop(a);
    }

    #[test]
    fn scrap_merge_combines_fragments() {
        let mut fst = table();
        let page = fst.allocate(1024).expect("fill page");
        // Three non-adjacent fragments of 30 records total.
        fst.release(&[AllocatedRange::new(0, 0, 10).expect("range")])
            .expect("release");
        fst.release(&[AllocatedRange::new(0, 100, 10).expect("range")])
            .expect("release");
        fst.release(&[AllocatedRange::new(0, 200, 10).expect("range")])
            .expect("release");
        let allocation = fst.allocate(25).expect("allocate");
        assert_eq!(total_records(&allocation), 25);
        assert!(allocation.len() <= 3);
        assert_eq!(fst.free_records(), 5);
        drop(page);
    }

    #[test]
    fn serialization_round_trip() {
        let mut fst = table();
        let a = fst.allocate(100).expect("allocate");
        fst.release(&a[..]).expect("release");
        let bytes = fst.to_bytes(65_536);
        let reloaded = FreeSpaceTable::load(&bytes, 1024, 8191).expect("load");
        assert_eq!(reloaded.page_count(), fst.page_count());
        assert_eq!(reloaded.free_records(), fst.free_records());
    }

    #[test]
    fn capacity_eviction_drops_smallest_first() {
        let mut fst = FreeSpaceTable::new(1024, 2);
        let page = fst.allocate(1024).expect("fill page");
        fst.release(&[AllocatedRange::new(0, 0, 1).expect("range")])
            .expect("release");
        fst.release(&[AllocatedRange::new(0, 10, 5).expect("range")])
            .expect("release");
        fst.release(&[AllocatedRange::new(0, 100, 50).expect("range")])
            .expect("release");
        let bytes = fst.to_bytes(65_536);
        let reloaded = FreeSpaceTable::load(&bytes, 1024, 2).expect("load");
        assert_eq!(reloaded.stats().ranges, 2);
        assert_eq!(reloaded.free_records(), 55, "smallest range was evicted");
        assert_eq!(fst.stats().dropped_records, 1);
        drop(page);
    }
}
