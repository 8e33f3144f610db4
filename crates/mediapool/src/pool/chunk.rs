//! Raw chunk storage for the layered pool
//!
//! A chunk is one contiguous aligned region carved into fixed-size blocks.
//! Chunks are only ever created and destroyed; block bookkeeping lives in
//! the owning size class.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use crate::error::{MemoryError, MemoryResult};

/// One aligned allocation holding `blocks` fixed-size blocks.
pub(crate) struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    blocks: u32,
}

// Safety: the chunk owns its region exclusively; block handout is serialized
// by the class mutex.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Allocate a chunk of `blocks` blocks of `block_size` bytes each.
    ///
    /// `block_size` must already be a multiple of `alignment` so every block
    /// start is aligned, not just the first.
    pub(crate) fn new(block_size: usize, blocks: u32, alignment: usize) -> MemoryResult<Self> {
        let size = block_size
            .checked_mul(blocks as usize)
            .ok_or_else(|| MemoryError::invalid_params("chunk size overflow"))?;
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|e| MemoryError::invalid_params(format!("invalid chunk layout: {e}")))?;
        debug_assert!(block_size % alignment == 0);

        let data = unsafe {
            let ptr = alloc(layout);
            NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { size })?
        };

        Ok(Self {
            data,
            layout,
            block_size,
            blocks,
        })
    }

    /// Total bytes owned by this chunk.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn blocks(&self) -> u32 {
        self.blocks
    }

    /// Pointer to block `index` within this chunk.
    #[inline]
    pub(crate) fn block_ptr(&self, index: u32) -> NonNull<u8> {
        debug_assert!(index < self.blocks);
        // Safety: index is bounded by `blocks`, so the offset stays inside
        // the allocation.
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(index as usize * self.block_size)) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.data.as_ptr(), self.layout);
        }
    }
}
