//! Heap allocator over shared memory
//!
//! First-fit free-list allocator handing out addresses in the region of
//! shared memory above its base, growing the memory when the region is
//! exhausted. Bound into the interpreter as `ALLOCATE` / `FREE` by
//! `Session::bind_memory_words`.

use std::collections::HashMap;

use crate::error::MemoryError;
use crate::memory::{Memory, PAGE_SIZE};
use crate::vm::Cell;

/// Allocator state. Block bookkeeping lives host-side; the blocks themselves
/// are plain ranges of the shared memory.
pub struct Allocator {
    top: u32,
    live: HashMap<u32, u32>,
    pool: Vec<(u32, u32)>,
}

impl Allocator {
    /// Create an allocator managing the region starting at `base`
    pub fn new(base: u32) -> Self {
        Allocator {
            top: base,
            live: HashMap::new(),
            pool: Vec::new(),
        }
    }

    /// Allocate `size` bytes, growing `memory` if the region is exhausted
    pub fn allocate(&mut self, memory: &mut Memory, size: u32) -> Result<u32, MemoryError> {
        if let Some(i) = self.pool.iter().position(|&(_, s)| s >= size) {
            let (addr, s) = self.pool[i];
            if s == size {
                self.pool.swap_remove(i);
            } else {
                self.pool[i] = (addr + size, s - size);
            }
            self.live.insert(addr, size);
            return Ok(addr);
        }

        let addr = self.top;
        let end = addr as u64 + size as u64;
        if end > memory.size() as u64 {
            let needed = end - memory.size() as u64;
            let pages = needed.div_ceil(PAGE_SIZE as u64) as u32;
            memory.grow(pages)?;
        }
        self.top = end as u32;
        self.live.insert(addr, size);
        Ok(addr)
    }

    /// Release the block at `addr`. Returns 0, or -1 for an address that is
    /// not a live allocation.
    pub fn free(&mut self, addr: u32) -> Cell {
        match self.live.remove(&addr) {
            Some(size) => {
                self.pool.push((addr, size));
                0
            }
            None => -1,
        }
    }
}
