//! Free-space allocation for the archive data file
//!
//! The data file is treated as one logically contiguous address space that can
//! only grow at the end. Allocators hand out byte ranges inside that space and
//! take them back when an object is rewritten.

pub mod spanning;

use crate::error::Result;

/// Span allocator trait
///
/// Defines the interface for allocating and freeing byte ranges in the data file.
pub trait SpanAllocator {
    /// Allocate `size` contiguous bytes from existing free space
    ///
    /// Returns `None` when no free range is large enough; the caller is expected
    /// to grow the heap with [`SpanAllocator::append_new_block`] instead.
    fn allocate(&mut self, size: u32) -> Option<u32>;

    /// Grow the heap by `size` bytes, returning the offset of the new (allocated) range
    fn append_new_block(&mut self, size: u32) -> Result<u32>;

    /// Return a previously allocated range to the free pool
    fn deallocate(&mut self, offset: u32, size: u32) -> Result<()>;

    /// Total size of the address space managed by the heap
    fn heap_size(&self) -> u32;

    /// Number of bytes currently allocated
    fn allocated_space(&self) -> u32;

    /// Allocate from free space, growing the heap when nothing fits
    fn allocate_or_grow(&mut self, size: u32) -> Result<u32> {
        match self.allocate(size) {
            Some(offset) => Ok(offset),
            None => self.append_new_block(size),
        }
    }
}
