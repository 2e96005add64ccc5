//! Low-level paged file access.
//!
//! All regions (header, KIT, FST, record pages) go through one shared file
//! handle guarded by a mutex; operations are short and page-granular. Reads
//! past the current end of file yield zeroes, and writes past it extend the
//! file, so page growth is implicit.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{ArborError, Result};
use crate::storage::address::{AllocatedRange, RecordAddress};
use crate::storage::header::HEADER_REGION_SIZE;
use crate::storage::options::EngineOptions;

/// Byte layout of the storage file, derived from [`EngineOptions`].
#[derive(Debug, Clone, Copy)]
pub struct FileLayout {
    /// Bytes per record.
    pub record_size: usize,
    /// Records per page.
    pub page_size: usize,
    /// Start of the key index table region.
    pub kit_offset: u64,
    /// Byte length of the key index table region.
    pub kit_len: usize,
    /// Start of the free space table region.
    pub fst_offset: u64,
    /// Byte length of the free space table region.
    pub fst_len: usize,
    /// Start of the record pages.
    pub data_offset: u64,
}

impl FileLayout {
    /// Computes the layout for the given options.
    pub fn for_options(options: &EngineOptions) -> Self {
        let kit_offset = HEADER_REGION_SIZE as u64;
        let fst_offset = kit_offset + options.kit_region_size as u64;
        let data_offset = fst_offset + options.fst_region_size as u64;
        Self {
            record_size: usize::from(options.record_size),
            page_size: usize::from(options.page_size),
            kit_offset,
            kit_len: options.kit_region_size,
            fst_offset,
            fst_len: options.fst_region_size,
            data_offset,
        }
    }

    /// Byte offset of a record address.
    pub fn record_offset(&self, address: RecordAddress) -> u64 {
        let record_index = u64::from(address.page_nr) * self.page_size as u64
            + u64::from(address.record_nr);
        self.data_offset + record_index * self.record_size as u64
    }

    /// Bytes covered by one page.
    pub fn page_bytes(&self) -> u64 {
        (self.page_size * self.record_size) as u64
    }
}

/// Shared handle to the storage file.
pub struct StorageFile {
    file: Mutex<File>,
    layout: FileLayout,
}

impl StorageFile {
    /// Opens (creating if necessary) the storage file at `path`.
    pub fn open(path: &Path, options: &EngineOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            layout: FileLayout::for_options(options),
        })
    }

    /// The computed byte layout.
    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Reads `len` bytes at `offset`; bytes past the end of file read as
    /// zeroes.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        let available = ((file_len - offset) as usize).min(len);
        file.read_exact(&mut buf[..available])?;
        Ok(buf)
    }

    /// Writes `bytes` at `offset`, extending the file when needed.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Flushes file data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Reads the raw bytes of a contiguous record range.
    pub fn read_range(&self, range: &AllocatedRange) -> Result<Vec<u8>> {
        if u32::from(range.record_nr) + u32::from(range.length) > self.layout.page_size as u32 {
            return Err(ArborError::Corruption(format!(
                "range {}:{}+{} crosses a page boundary",
                range.page_nr, range.record_nr, range.length
            )));
        }
        let offset = self.layout.record_offset(range.start());
        self.read_at(offset, usize::from(range.length) * self.layout.record_size)
    }

    /// Writes raw bytes into a contiguous record range. `bytes` may be
    /// shorter than the range; the remainder of the last record is left
    /// untouched.
    pub fn write_range(&self, range: &AllocatedRange, bytes: &[u8]) -> Result<()> {
        let capacity = usize::from(range.length) * self.layout.record_size;
        if bytes.len() > capacity {
            return Err(ArborError::Internal(format!(
                "{} bytes exceed range capacity {capacity}",
                bytes.len()
            )));
        }
        let offset = self.layout.record_offset(range.start());
        self.write_at(offset, bytes)
    }
}
