//! CPU-resident sparse buffers, used by tests and headless runs.

use super::{check_commit, page_span, SparseAllocator, SparseBuffer, DEFAULT_PAGE_SIZE};
use crate::error::{Result, StreamError};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::ops::Range;

#[derive(Debug, Clone, Copy)]
pub struct HostAllocator {
    pub page_size: u64,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SparseAllocator for HostAllocator {
    type Buffer = HostSparseBuffer;

    fn allocate(&self, label: &str, capacity: u64) -> Result<HostSparseBuffer> {
        HostSparseBuffer::new(label, capacity, self.page_size)
    }
}

#[derive(Debug)]
pub struct HostSparseBuffer {
    label: String,
    capacity: u64,
    page_size: u64,
    committed: RoaringBitmap,
    pages: HashMap<u32, Box<[u8]>>,
}

impl HostSparseBuffer {
    pub fn new(label: &str, capacity: u64, page_size: u64) -> Result<Self> {
        if page_size == 0 || capacity.div_ceil(page_size) > u32::MAX as u64 {
            return Err(StreamError::InvalidConfig(format!(
                "{}: page size {} cannot address {} bytes",
                label, page_size, capacity
            )));
        }
        Ok(Self {
            label: label.to_string(),
            capacity,
            page_size,
            committed: RoaringBitmap::new(),
            pages: HashMap::new(),
        })
    }

    #[inline]
    fn page_len(&self, page: u64) -> usize {
        self.page_size.min(self.capacity - page * self.page_size) as usize
    }

    pub fn is_committed(&self, offset: u64, len: u64) -> bool {
        page_span(offset, len, self.page_size).all(|page| self.committed.contains(page as u32))
    }

    pub fn committed_pages(&self) -> u64 {
        self.committed.len()
    }

    fn check_access(&self, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.capacity {
            return Err(StreamError::CapacityExceeded {
                offset,
                count: len,
                capacity: self.capacity,
            });
        }
        if !self.is_committed(offset, len) {
            return Err(StreamError::Uncommitted { offset, len });
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_access(offset, len)?;
        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = offset;
        let end = offset + len;
        while cursor < end {
            let page = cursor / self.page_size;
            let within = (cursor - page * self.page_size) as usize;
            let n = ((end - cursor) as usize).min(self.page_len(page) - within);
            let data = self
                .pages
                .get(&(page as u32))
                .ok_or(StreamError::Uncommitted { offset, len })?;
            out.extend_from_slice(&data[within..within + n]);
            cursor += n as u64;
        }
        Ok(out)
    }
}

impl SparseBuffer for HostSparseBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn commit(&mut self, range: Range<u64>) -> Result<()> {
        check_commit(&range, self.page_size, self.capacity)?;
        for page in page_span(range.start, range.end - range.start, self.page_size) {
            if self.committed.insert(page as u32) {
                let len = self.page_len(page);
                self.pages.insert(page as u32, vec![0u8; len].into_boxed_slice());
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_access(offset, bytes.len() as u64)?;
        let mut cursor = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let page = cursor / self.page_size;
            let within = (cursor - page * self.page_size) as usize;
            let page_len = self.page_len(page);
            let data = self
                .pages
                .get_mut(&(page as u32))
                .ok_or(StreamError::Uncommitted {
                    offset,
                    len: bytes.len() as u64,
                })?;
            let n = rest.len().min(page_len - within);
            data[within..within + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            cursor += n as u64;
        }
        Ok(())
    }

    fn committed_bytes(&self) -> u64 {
        self.committed
            .iter()
            .map(|page| self.page_len(page as u64) as u64)
            .sum()
    }

    fn decommit_all(&mut self) {
        self.committed.clear();
        self.pages.clear();
    }
}
