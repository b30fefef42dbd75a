//! Sparse, page-committed storage for the encoded point attributes.
//!
//! The five buffers are sized for the full index space up front, but only the
//! pages an upload touches are ever backed by memory.

pub mod gpu;
pub mod host;
pub mod set;

pub use gpu::{GpuContext, WgpuAllocator, WgpuSparseBuffer};
pub use host::{HostAllocator, HostSparseBuffer};
pub use set::{DrainOutcome, SparseBufferSet};

use crate::error::{Result, StreamError};
use std::ops::Range;

/// Page size used by the host backend and as the CLI default.
pub const DEFAULT_PAGE_SIZE: u64 = 64 * 1024;

/// A buffer whose address space is reserved up front and backed page by page.
pub trait SparseBuffer {
    fn label(&self) -> &str;

    /// Addressable size in bytes.
    fn capacity(&self) -> u64;

    /// Commit granularity in bytes.
    fn page_size(&self) -> u64;

    /// Back every page of `range`. `range` must be page aligned, apart from an
    /// end equal to `capacity`. Committing a committed page is a no-op.
    fn commit(&mut self, range: Range<u64>) -> Result<()>;

    /// Copy `bytes` to `offset`. Every touched page must be committed.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Bytes currently backed. Never exceeds `capacity`.
    fn committed_bytes(&self) -> u64;

    /// Release every page.
    fn decommit_all(&mut self);
}

/// Creates buffers of one backend.
pub trait SparseAllocator {
    type Buffer: SparseBuffer;

    fn allocate(&self, label: &str, capacity: u64) -> Result<Self::Buffer>;
}

/// Round `offset..offset + len` out to page boundaries and clamp the end to `capacity`.
pub fn page_aligned(offset: u64, len: u64, page_size: u64, capacity: u64) -> Range<u64> {
    let start = (offset / page_size) * page_size;
    let end = (offset + len).div_ceil(page_size).saturating_mul(page_size);
    let end = end.min(capacity);
    start.min(end)..end
}

/// Shared argument checks for `SparseBuffer::commit`.
pub(crate) fn check_commit(range: &Range<u64>, page_size: u64, capacity: u64) -> Result<()> {
    let aligned_end = range.end % page_size == 0 || range.end == capacity;
    if range.start % page_size != 0 || !aligned_end || range.end > capacity || range.start > range.end {
        return Err(StreamError::CapacityExceeded {
            offset: range.start,
            count: range.end.saturating_sub(range.start),
            capacity,
        });
    }
    Ok(())
}

/// Pages touched by a byte range.
#[inline]
pub(crate) fn page_span(offset: u64, len: u64, page_size: u64) -> Range<u64> {
    if len == 0 {
        return 0..0;
    }
    offset / page_size..(offset + len).div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_out_to_pages() {
        assert_eq!(page_aligned(0, 1, 4096, 1 << 20), 0..4096);
        assert_eq!(page_aligned(4095, 2, 4096, 1 << 20), 0..8192);
        assert_eq!(page_aligned(4096, 4096, 4096, 1 << 20), 4096..8192);
        // Unaligned start must still reach the end of the range.
        assert_eq!(page_aligned(6000, 4000, 4096, 1 << 20), 4096..12288);
    }

    #[test]
    fn clamps_to_capacity() {
        assert_eq!(page_aligned(9000, 5000, 4096, 10_000), 8192..10_000);
        assert_eq!(page_aligned(20_000, 10, 4096, 10_000), 10_000..10_000);
    }

    #[test]
    fn commit_arguments_are_checked() {
        assert!(check_commit(&(0..4096), 4096, 10_000).is_ok());
        assert!(check_commit(&(8192..10_000), 4096, 10_000).is_ok());
        assert!(check_commit(&(1..4096), 4096, 10_000).is_err());
        assert!(check_commit(&(0..12288), 4096, 10_000).is_err());
    }

    #[test]
    fn span_of_empty_range_is_empty() {
        assert_eq!(page_span(123, 0, 4096), 0..0);
        assert_eq!(page_span(4095, 2, 4096), 0..2);
    }
}
