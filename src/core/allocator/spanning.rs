//! Spanning heap
//!
//! A heap that deals only in spans. It doesn't record the size of the ranges
//! allocated from within it; it just knows what space is allocated and what is
//! free. The client must deallocate exactly the space it allocated.
//!
//! Free spans are tracked in a `BTreeMap` keyed by start offset so that adjacent
//! spans can be coalesced cheaply. For persistence the heap is flattened into a
//! marker array: a sorted list of boundaries that alternate between free and
//! allocated spans, starting with a (possibly empty) free span at offset 0 and
//! ending with the heap size.

use crate::allocator::SpanAllocator;
use crate::error::{ArchiveError, Result};
use std::collections::BTreeMap;

/// A contiguous range of free bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Starting byte offset
    pub start: u32,
    /// Number of bytes
    pub length: u32,
}

impl Span {
    pub fn new(start: u32, length: u32) -> Self {
        Span { start, length }
    }

    /// One past the last byte of the span
    pub fn end(&self) -> u32 {
        self.start + self.length
    }

    /// Check if this span is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &Span) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Coalesce two adjacent spans
    pub fn coalesce(&self, other: &Span) -> Option<Span> {
        if !self.is_adjacent(other) {
            return None;
        }

        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Some(Span::new(start, end - start))
    }
}

/// Spanning heap over the archive data file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanningHeap {
    /// Free spans indexed by start offset
    free_spans: BTreeMap<u32, Span>,

    /// Total size of the address space
    heap_size: u32,

    /// Number of allocated bytes
    allocated: u32,
}

impl SpanningHeap {
    /// Create an empty heap (size 0)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap of `size` bytes, all of it free
    pub fn with_size(size: u32) -> Self {
        let mut free_spans = BTreeMap::new();
        if size > 0 {
            free_spans.insert(0, Span::new(0, size));
        }
        SpanningHeap {
            free_spans,
            heap_size: size,
            allocated: 0,
        }
    }

    /// Rebuild a heap from its flattened marker array
    ///
    /// The byte length must be a multiple of 4, the first marker must be zero and
    /// markers must never decrease.
    pub fn restore(flattened: &[u8]) -> Result<Self> {
        if flattened.is_empty() {
            return Ok(Self::new());
        }
        if flattened.len() % 4 != 0 {
            return Err(ArchiveError::CorruptDirectory(format!(
                "flattened heap has odd length {}",
                flattened.len()
            )));
        }

        let markers: Vec<u32> = flattened
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if markers[0] != 0 {
            return Err(ArchiveError::CorruptDirectory(
                "flattened heap does not start at offset 0".to_string(),
            ));
        }
        if markers.windows(2).any(|w| w[0] > w[1]) {
            return Err(ArchiveError::CorruptDirectory(
                "flattened heap markers are out of order".to_string(),
            ));
        }

        let mut heap = SpanningHeap {
            free_spans: BTreeMap::new(),
            heap_size: markers[markers.len() - 1],
            allocated: 0,
        };

        // Even-indexed spans are free, odd-indexed spans are allocated
        let mut free_total = 0u32;
        for (k, pair) in markers.windows(2).enumerate() {
            if k % 2 == 0 && pair[1] > pair[0] {
                let span = Span::new(pair[0], pair[1] - pair[0]);
                free_total += span.length;
                heap.insert_and_coalesce(span);
            }
        }
        heap.allocated = heap.heap_size - free_total;

        Ok(heap)
    }

    /// Flatten the heap into its persisted marker array
    pub fn flatten(&self) -> Vec<u8> {
        self.markers()
            .into_iter()
            .flat_map(|m| m.to_le_bytes())
            .collect()
    }

    /// Boundaries between free and allocated spans
    pub fn markers(&self) -> Vec<u32> {
        if self.heap_size == 0 {
            return Vec::new();
        }

        // The open span starts out free at offset 0; every pushed marker closes
        // the open span and opens one of the other kind.
        let mut markers = vec![0u32];
        let mut open_is_free = true;
        for span in self.free_spans.values() {
            if open_is_free && span.start != 0 {
                markers.push(0);
                markers.push(span.start);
            } else if !open_is_free {
                markers.push(span.start);
            }
            markers.push(span.end());
            open_is_free = false;
        }

        if open_is_free {
            // Nothing free at all
            markers.push(0);
            markers.push(self.heap_size);
        } else if markers[markers.len() - 1] < self.heap_size {
            markers.push(self.heap_size);
        }

        markers
    }

    /// Number of free bytes
    pub fn available_space(&self) -> u32 {
        self.heap_size - self.allocated
    }

    /// Size of the largest free span
    pub fn largest_free_block(&self) -> u32 {
        self.free_spans
            .values()
            .map(|s| s.length)
            .max()
            .unwrap_or(0)
    }

    /// Current number of free spans (fragmentation indicator)
    pub fn free_span_count(&self) -> usize {
        self.free_spans.len()
    }

    /// True if nothing has been allocated
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Check that the whole range `[offset, offset + size)` is allocated
    pub fn is_allocated(&self, offset: u32, size: u32) -> bool {
        let end = match offset.checked_add(size) {
            Some(end) if end <= self.heap_size => end,
            _ => return false,
        };

        if let Some((_, prev)) = self.free_spans.range(..=offset).next_back() {
            if prev.end() > offset {
                return false;
            }
        }
        if let Some((_, next)) = self.free_spans.range(offset..).next() {
            if next.start < end {
                return false;
            }
        }
        true
    }

    /// Insert a free span and coalesce with adjacent spans
    fn insert_and_coalesce(&mut self, mut span: Span) {
        let mut to_remove = Vec::new();

        if let Some((&prev_start, &prev)) = self.free_spans.range(..span.start).next_back() {
            if let Some(merged) = prev.coalesce(&span) {
                span = merged;
                to_remove.push(prev_start);
            }
        }

        if let Some((&next_start, &next)) = self.free_spans.range(span.end()..).next() {
            if let Some(merged) = span.coalesce(&next) {
                span = merged;
                to_remove.push(next_start);
            }
        }

        for key in to_remove {
            self.free_spans.remove(&key);
        }
        self.free_spans.insert(span.start, span);
    }
}

impl SpanAllocator for SpanningHeap {
    /// Best-fit: the smallest free span that fits, lowest offset on ties.
    /// Allocation always comes from the start of the chosen span.
    fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 || size > self.available_space() {
            return None;
        }

        let (start, span) = self
            .free_spans
            .iter()
            .filter(|(_, span)| span.length >= size)
            .min_by_key(|(_, span)| span.length)
            .map(|(k, s)| (*k, *s))?;

        self.free_spans.remove(&start);
        if span.length > size {
            let rest = Span::new(span.start + size, span.length - size);
            self.free_spans.insert(rest.start, rest);
        }
        self.allocated += size;

        Some(span.start)
    }

    fn append_new_block(&mut self, size: u32) -> Result<u32> {
        let offset = self.heap_size;
        self.heap_size = offset
            .checked_add(size)
            .ok_or(ArchiveError::HeapExhausted(size))?;
        self.allocated += size;
        Ok(offset)
    }

    fn deallocate(&mut self, offset: u32, size: u32) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if !self.is_allocated(offset, size) {
            return Err(ArchiveError::InvalidHeapRange { offset, size });
        }

        self.insert_and_coalesce(Span::new(offset, size));
        self.allocated -= size;
        Ok(())
    }

    fn heap_size(&self) -> u32 {
        self.heap_size
    }

    fn allocated_space(&self) -> u32 {
        self.allocated
    }
}
