//! One segregated size class: chunks plus a free-index stack
//!
//! Allocation pops an index off the free stack; release pushes it back.
//! Fragmentation is an analytic view over the free stack, computed on
//! demand by sorting indices into address order.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::MemoryResult;
use crate::pool::chunk::Chunk;

/// The three segregated classes of the layered pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub const ALL: [Self; 3] = [Self::Small, Self::Medium, Self::Large];

    pub fn name(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Position of a block inside a class: chunk ordinal plus block ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BlockIndex {
    pub(crate) chunk: u32,
    pub(crate) block: u32,
}

struct ClassState {
    chunks: Vec<Chunk>,
    free: Vec<BlockIndex>,
}

/// One size class of the layered pool.
pub(crate) struct LayeredClass {
    class: SizeClass,
    block_size: usize,
    blocks_per_chunk: u32,
    alignment: usize,
    state: Mutex<ClassState>,
}

/// Analytic view of a class's free space.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FreeRuns {
    pub(crate) free_blocks: usize,
    pub(crate) run_count: usize,
    pub(crate) largest_run: usize,
    pub(crate) smallest_run: usize,
    pub(crate) total_blocks: usize,
}

impl LayeredClass {
    pub(crate) fn new(class: SizeClass, block_size: usize, blocks_per_chunk: usize, alignment: usize) -> Self {
        // Round the block size up so every block start inherits the chunk's
        // alignment.
        let block_size = block_size.div_ceil(alignment) * alignment;
        Self {
            class,
            block_size,
            blocks_per_chunk: blocks_per_chunk as u32,
            alignment,
            state: Mutex::new(ClassState {
                chunks: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Bytes one additional chunk would carve.
    #[inline]
    pub(crate) fn chunk_bytes(&self) -> usize {
        self.block_size * self.blocks_per_chunk as usize
    }

    /// Pop a free block if one is available.
    pub(crate) fn allocate_block(&self) -> Option<(BlockIndex, std::ptr::NonNull<u8>)> {
        let mut state = self.state.lock();
        let index = state.free.pop()?;
        let ptr = state.chunks[index.chunk as usize].block_ptr(index.block);
        Some((index, ptr))
    }

    /// Carve one more chunk and retry the pop. Returns the block plus the
    /// number of bytes newly carved.
    pub(crate) fn expand_and_allocate(
        &self,
    ) -> MemoryResult<(BlockIndex, std::ptr::NonNull<u8>, usize)> {
        let chunk = Chunk::new(self.block_size, self.blocks_per_chunk, self.alignment)?;
        let carved = chunk.size();

        let mut state = self.state.lock();
        let chunk_ordinal = state.chunks.len() as u32;
        // Push in reverse so block 0 pops first.
        for block in (0..chunk.blocks()).rev() {
            state.free.push(BlockIndex {
                chunk: chunk_ordinal,
                block,
            });
        }
        state.chunks.push(chunk);
        debug!(
            class = self.class.name(),
            chunk = chunk_ordinal,
            bytes = carved,
            "carved pool chunk"
        );

        let index = state.free.pop().expect("freshly carved chunk is non-empty");
        let ptr = state.chunks[index.chunk as usize].block_ptr(index.block);
        Ok((index, ptr, carved))
    }

    /// Return a block to the free stack.
    pub(crate) fn release_block(&self, index: BlockIndex) {
        let mut state = self.state.lock();
        debug_assert!((index.chunk as usize) < state.chunks.len());
        state.free.push(index);
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Compute contiguous free runs. Runs never span chunk boundaries.
    pub(crate) fn free_runs(&self) -> FreeRuns {
        let state = self.state.lock();
        let total_blocks = state.chunks.len() * self.blocks_per_chunk as usize;
        let mut sorted = state.free.clone();
        drop(state);
        sorted.sort_unstable();

        let mut runs = FreeRuns {
            free_blocks: sorted.len(),
            total_blocks,
            smallest_run: usize::MAX,
            ..FreeRuns::default()
        };
        let mut run = 0usize;
        let mut prev: Option<BlockIndex> = None;
        for index in sorted {
            let contiguous = prev.is_some_and(|p| p.chunk == index.chunk && p.block + 1 == index.block);
            if contiguous {
                run += 1;
            } else {
                if run > 0 {
                    runs.close_run(run);
                }
                run = 1;
            }
            prev = Some(index);
        }
        if run > 0 {
            runs.close_run(run);
        }
        if runs.run_count == 0 {
            runs.smallest_run = 0;
        }
        runs
    }

    /// Sort the free stack into address order so subsequent pops hand out
    /// contiguous blocks. Returns the resulting run count.
    pub(crate) fn defragment(&self) -> usize {
        let mut state = self.state.lock();
        state.free.sort_unstable_by(|a, b| b.cmp(a));
        drop(state);
        self.free_runs().run_count
    }
}

impl FreeRuns {
    fn close_run(&mut self, len: usize) {
        self.run_count += 1;
        self.largest_run = self.largest_run.max(len);
        self.smallest_run = self.smallest_run.min(len);
    }

    /// 1 - largest_run / free_blocks, clamped to [0, 1]. Empty or fully
    /// contiguous free space scores 0.
    pub(crate) fn fragmentation(&self) -> f64 {
        if self.free_blocks == 0 {
            return 0.0;
        }
        (1.0 - self.largest_run as f64 / self.free_blocks as f64).clamp(0.0, 1.0)
    }
}
