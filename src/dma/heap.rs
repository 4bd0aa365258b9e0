//! Host-memory DMA allocator
//!
//! Implements the [`DmaAllocator`] contract on top of ordinary heap memory,
//! handing out simulated physical addresses that honour the requested
//! alignment. Used by the loopback engines, the CLI and the test suite.
//!
//! Besides the contract itself it tracks live buffers and mappings, and can
//! be told to start failing allocations after a budget is used up, which is
//! how allocation-failure paths are exercised.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use super::{DmaAllocator, DmaHandle, DmaResult, MapFlags};
use crate::error::DmaError;

/// First simulated physical address handed out
const PHYS_BASE: u64 = 0x1000_0000;

/// Allocation statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations
    pub allocations: u64,

    /// Successful releases
    pub deallocations: u64,

    /// Allocations refused (budget exhausted or invalid request)
    pub failed_allocations: u64,

    /// Successful map calls
    pub maps: u64,

    /// Bytes currently allocated
    pub bytes_live: usize,
}

struct HeapBlock {
    storage: Box<[u8]>,
    mapped: bool,
}

struct HeapState {
    blocks: HashMap<u64, HeapBlock>,
    next_id: u64,
    next_physical: u64,
    remaining_allocations: Option<usize>,
    stats: HeapStats,
}

/// DMA allocator backed by host memory
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    /// Create an allocator without an allocation budget
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                blocks: HashMap::new(),
                next_id: 1,
                next_physical: PHYS_BASE,
                remaining_allocations: None,
                stats: HeapStats::default(),
            }),
        }
    }

    /// Allow only `count` more successful allocations
    ///
    /// Every allocation after that fails with [`DmaError::OutOfMemory`]
    /// until [`clear_allocation_limit`](Self::clear_allocation_limit).
    pub fn limit_allocations(&self, count: usize) {
        self.state.lock().remaining_allocations = Some(count);
    }

    /// Remove the allocation budget
    pub fn clear_allocation_limit(&self) {
        self.state.lock().remaining_allocations = None;
    }

    /// Number of buffers currently allocated
    pub fn live_buffers(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Whether `handle` refers to a live buffer
    pub fn is_live(&self, handle: DmaHandle) -> bool {
        self.state.lock().blocks.contains_key(&handle.id())
    }

    /// Whether `handle` is currently mapped
    pub fn is_mapped(&self, handle: DmaHandle) -> bool {
        self.state
            .lock()
            .blocks
            .get(&handle.id())
            .is_some_and(|block| block.mapped)
    }

    /// Snapshot of the allocation statistics
    pub fn stats(&self) -> HeapStats {
        self.state.lock().stats.clone()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: each block's storage is a boxed slice that is neither moved nor
// freed while mapped (`deallocate` refuses mapped blocks), and `map` refuses
// a second mapping of the same block.
#[allow(unsafe_code)]
unsafe impl DmaAllocator for HeapAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> DmaResult<DmaHandle> {
        let mut state = self.state.lock();

        if size == 0 {
            state.stats.failed_allocations += 1;
            return Err(DmaError::InvalidSize(size));
        }
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            state.stats.failed_allocations += 1;
            return Err(DmaError::InvalidAlignment(alignment));
        }

        match state.remaining_allocations {
            Some(0) => {
                state.stats.failed_allocations += 1;
                debug!("Heap allocator budget exhausted ({} bytes requested)", size);
                return Err(DmaError::OutOfMemory { requested: size });
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }

        let align = alignment as u64;
        let physical_address = (state.next_physical + align - 1) & !(align - 1);
        state.next_physical = physical_address + size as u64;

        let id = state.next_id;
        state.next_id += 1;

        state.blocks.insert(
            id,
            HeapBlock {
                storage: vec![0u8; size].into_boxed_slice(),
                mapped: false,
            },
        );
        state.stats.allocations += 1;
        state.stats.bytes_live += size;

        Ok(DmaHandle::new(id, physical_address, size))
    }

    fn deallocate(&self, handle: DmaHandle) -> DmaResult<()> {
        let mut state = self.state.lock();
        match state.blocks.get(&handle.id()) {
            None => return Err(DmaError::UnknownBuffer(handle.id())),
            Some(block) if block.mapped => return Err(DmaError::StillMapped(handle.id())),
            Some(_) => {}
        }
        if let Some(block) = state.blocks.remove(&handle.id()) {
            state.stats.deallocations += 1;
            state.stats.bytes_live -= block.storage.len();
        }
        Ok(())
    }

    fn map(&self, handle: DmaHandle, _flags: MapFlags) -> DmaResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .get_mut(&handle.id())
            .ok_or(DmaError::UnknownBuffer(handle.id()))?;
        if handle.size() > block.storage.len() {
            return Err(DmaError::SizeMismatch {
                id: handle.id(),
                claimed: handle.size(),
                actual: block.storage.len(),
            });
        }
        if block.mapped {
            return Err(DmaError::AlreadyMapped(handle.id()));
        }
        let ptr = NonNull::new(block.storage.as_mut_ptr())
            .ok_or(DmaError::UnknownBuffer(handle.id()))?;
        block.mapped = true;
        state.stats.maps += 1;
        Ok(ptr)
    }

    fn unmap(&self, handle: DmaHandle) {
        if let Some(block) = self.state.lock().blocks.get_mut(&handle.id()) {
            block.mapped = false;
        }
    }
}
