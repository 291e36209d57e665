//! Shared memory/table binding
//!
//! One `SharedEnv` is established at session start and handed, unmodified,
//! to every operation that extends or observes the VM: the run loop, the
//! dynamic loader, named calls and the allocator. Memory and table identity
//! never change after initialization; both grow in place.

use crate::memory::{Memory, MemoryConfig};
use crate::table::DispatchTable;

/// The linear memory and dispatch table shared by the whole session
pub struct SharedEnv {
    pub memory: Memory,
    pub table: DispatchTable,
}

impl SharedEnv {
    /// Allocate the shared substrate at its configured initial size
    pub fn new(config: &MemoryConfig) -> Self {
        SharedEnv {
            memory: Memory::new(config),
            table: DispatchTable::new(),
        }
    }
}
