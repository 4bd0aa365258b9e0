//! DMA buffer allocation and scoped CPU mapping
//!
//! Hardware engines only see physically contiguous, DMA-capable memory. The
//! allocator that provides it is an external collaborator described by the
//! [`DmaAllocator`] trait; this module wraps its raw handles in two safe types:
//!
//! - [`DmaBuffer`]: an owned allocation, released when dropped
//! - [`DmaMapping`]: a scoped CPU mapping, unmapped when dropped
//!
//! # Mapping rules
//!
//! A buffer must not be handed to the engine while it is mapped, and must not
//! be mapped by two transfers at once. [`DmaBuffer::map`] takes `&mut self`,
//! so both rules are enforced by the borrow checker for session-owned
//! buffers: the handle cannot be read for submission while the mapping lives.
//! Engine implementations that only hold a [`DmaHandle`] go through
//! [`DmaMapping::new`], where the allocator enforces exclusivity at runtime.

pub mod heap;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};
use tracing::{trace, warn};

use crate::error::DmaError;

pub use heap::{HeapAllocator, HeapStats};

/// Result type for allocator operations
pub type DmaResult<T> = Result<T, DmaError>;

/// CPU access requested when mapping a DMA buffer
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFlag {
    /// CPU reads from the buffer
    Read = 0b01,
    /// CPU writes into the buffer
    Write = 0b10,
}

/// Set of [`MapFlag`]s
pub type MapFlags = BitFlags<MapFlag>;

/// Raw handle of an allocated DMA buffer
///
/// Handles are plain values: copying one does not duplicate ownership.
/// Ownership lives in [`DmaBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaHandle {
    id: u64,
    physical_address: u64,
    size: usize,
}

impl DmaHandle {
    /// Create a handle
    ///
    /// Meant for allocator implementations. A handle built elsewhere is
    /// only as good as the allocator's validation of it in
    /// [`DmaAllocator::map`].
    pub const fn new(id: u64, physical_address: u64, size: usize) -> Self {
        Self {
            id,
            physical_address,
            size,
        }
    }

    /// Allocator-unique buffer id
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Physical address as seen by the hardware
    pub const fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for DmaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dma#{} @ {:#x} ({} bytes)",
            self.id, self.physical_address, self.size
        )
    }
}

/// Allocator of DMA-capable memory
///
/// Allocating one buffer must never invalidate another: buffers are
/// independent of each other for their whole lifetime.
///
/// # Safety
///
/// Implementations must guarantee that the pointer returned by [`map`]
/// stays valid for reads (and for writes when [`MapFlag::Write`] was
/// requested) of `handle.size()` bytes until the matching [`unmap`], and
/// that a buffer which is currently mapped cannot be mapped a second time
/// (`map` returns [`DmaError::AlreadyMapped`]). Handles are plain values
/// anyone can build, so `map` must check `handle.size()` against the real
/// allocation and fail with [`DmaError::SizeMismatch`] when it is larger. The safe [`DmaMapping`]
/// builds slices on top of these guarantees.
///
/// [`map`]: DmaAllocator::map
/// [`unmap`]: DmaAllocator::unmap
#[allow(unsafe_code)]
pub unsafe trait DmaAllocator {
    /// Allocate `size` bytes whose physical address is a multiple of `alignment`
    fn allocate(&self, size: usize, alignment: usize) -> DmaResult<DmaHandle>;

    /// Release a buffer
    fn deallocate(&self, handle: DmaHandle) -> DmaResult<()>;

    /// Map a buffer into the CPU address space
    fn map(&self, handle: DmaHandle, flags: MapFlags) -> DmaResult<NonNull<u8>>;

    /// Undo a previous [`map`](DmaAllocator::map)
    fn unmap(&self, handle: DmaHandle);
}

/// Owned DMA buffer, released back to its allocator on drop
pub struct DmaBuffer {
    handle: DmaHandle,
    alignment: usize,
    allocator: Arc<dyn DmaAllocator>,
}

impl DmaBuffer {
    /// Allocate a new buffer
    pub fn allocate(
        allocator: &Arc<dyn DmaAllocator>,
        size: usize,
        alignment: usize,
    ) -> DmaResult<Self> {
        let handle = allocator.allocate(size, alignment)?;
        trace!("Allocated {}", handle);
        Ok(Self {
            handle,
            alignment,
            allocator: Arc::clone(allocator),
        })
    }

    /// Raw handle for handing to the engine
    pub fn handle(&self) -> DmaHandle {
        self.handle
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.handle.size
    }

    /// Alignment requested at allocation
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Map the buffer for CPU access
    ///
    /// The buffer stays exclusively borrowed until the mapping is dropped.
    pub fn map(&mut self, flags: MapFlags) -> DmaResult<DmaMapping<'_>> {
        DmaMapping::new(&*self.allocator, self.handle, flags)
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        match self.allocator.deallocate(self.handle) {
            Ok(()) => trace!("Released {}", self.handle),
            Err(e) => warn!("Failed to release {}: {}", self.handle, e),
        }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("handle", &self.handle)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// Scoped CPU mapping of a DMA buffer
///
/// Unmapped on drop, including on early returns and unwinding.
pub struct DmaMapping<'a> {
    allocator: &'a dyn DmaAllocator,
    handle: DmaHandle,
    ptr: NonNull<u8>,
    flags: MapFlags,
}

impl<'a> DmaMapping<'a> {
    /// Map a buffer by handle
    ///
    /// Sessions use [`DmaBuffer::map`]; this constructor exists for engine
    /// implementations, which only know buffers by handle.
    pub fn new(
        allocator: &'a dyn DmaAllocator,
        handle: DmaHandle,
        flags: MapFlags,
    ) -> DmaResult<Self> {
        let ptr = allocator.map(handle, flags)?;
        Ok(Self {
            allocator,
            handle,
            ptr,
            flags,
        })
    }

    /// Handle of the mapped buffer
    pub fn handle(&self) -> DmaHandle {
        self.handle
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.handle.size
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.handle.size == 0
    }

    /// Read access to the mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocator contract guarantees `ptr` is valid for
        // `size` bytes until unmap, and exclusive while mapped.
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.handle.size)
        }
    }

    /// Write access to the mapped bytes
    pub fn as_mut_slice(&mut self) -> DmaResult<&mut [u8]> {
        if !self.flags.contains(MapFlag::Write) {
            return Err(DmaError::NotWritable(self.handle.id));
        }
        // SAFETY: as for `as_slice`; write access was requested at map time
        // and `&mut self` rules out aliasing through this mapping.
        #[allow(unsafe_code)]
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.handle.size) };
        Ok(slice)
    }
}

impl Drop for DmaMapping<'_> {
    fn drop(&mut self) {
        self.allocator.unmap(self.handle);
    }
}

impl fmt::Debug for DmaMapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaMapping")
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .finish()
    }
}
