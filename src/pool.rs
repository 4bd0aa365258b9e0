//! Framebuffer pool management
//!
//! The pool owns every framebuffer registered with an engine for one
//! negotiated stream. It only ever grows within a stream epoch and is torn
//! down as a unit on renegotiation and on close.
//!
//! # Bookkeeping invariant
//!
//! The pool holds exactly the buffers the engine accepted. A batch the engine
//! refuses is released immediately, so the registered count and
//! [`FramebufferPool::len`] never diverge.

use std::sync::Arc;

use tracing::{debug, error};

use crate::dma::{DmaAllocator, DmaBuffer, DmaHandle};
use crate::engine::{FrameContext, FramebufferSink, StreamInfo};
use crate::error::{VpuError, VpuResult};

/// Size and alignment of framebuffers to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferRequest {
    pub size: usize,
    pub alignment: usize,
}

impl FramebufferRequest {
    /// Pool framebuffers for a negotiated stream
    pub fn pool(info: &StreamInfo) -> Self {
        Self {
            size: info.framebuffer_size,
            alignment: info.framebuffer_alignment,
        }
    }

    /// Dedicated output framebuffer for a negotiated stream
    pub fn output(info: &StreamInfo) -> Self {
        Self {
            size: info.output_framebuffer_size,
            alignment: info.output_framebuffer_alignment,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Framebuffers allocated and accepted by the engine
    pub total_allocated: u64,

    /// Framebuffers released by resets
    pub total_released: u64,

    /// Successful grow calls
    pub grow_calls: u64,

    /// Grow calls that failed
    pub failed_grows: u64,

    /// Resets of a non-empty pool
    pub resets: u64,
}

/// Growable set of engine-registered framebuffers
#[derive(Debug, Default)]
pub struct FramebufferPool {
    buffers: Vec<DmaBuffer>,
    epoch: u64,
    stats: PoolStats,
}

impl FramebufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` framebuffers and register them with `sink` in one batch
    ///
    /// New buffers get [`FrameContext::for_slot`] of their absolute index.
    ///
    /// If an allocation fails part way, the buffers allocated so far are
    /// still registered and kept, and [`VpuError::AllocationFailure`] is
    /// returned. If the engine refuses the batch, the whole batch is
    /// released and the pool is left unchanged.
    pub fn grow<S>(
        &mut self,
        allocator: &Arc<dyn DmaAllocator>,
        sink: &mut S,
        count: usize,
        request: FramebufferRequest,
    ) -> VpuResult<()>
    where
        S: FramebufferSink + ?Sized,
    {
        if count == 0 {
            return Ok(());
        }

        let base = self.buffers.len();
        let mut batch = Vec::with_capacity(count);
        let mut alloc_error = None;

        for _ in 0..count {
            match DmaBuffer::allocate(allocator, request.size, request.alignment) {
                Ok(buffer) => batch.push(buffer),
                Err(e) => {
                    error!(
                        "Could not allocate pool framebuffer {} of {} ({} bytes): {}",
                        batch.len() + 1,
                        count,
                        request.size,
                        e
                    );
                    alloc_error = Some(e);
                    break;
                }
            }
        }

        if !batch.is_empty() {
            let handles: Vec<DmaHandle> = batch.iter().map(DmaBuffer::handle).collect();
            let contexts: Vec<FrameContext> = (base..base + batch.len())
                .map(FrameContext::for_slot)
                .collect();

            if let Err(code) = sink.add_framebuffers_to_pool(&handles, &contexts) {
                error!("Engine refused {} pool framebuffer(s): {}", batch.len(), code);
                self.stats.failed_grows += 1;
                drop(batch);
                return Err(match alloc_error {
                    Some(source) => VpuError::AllocationFailure {
                        what: "pool framebuffer",
                        source,
                    },
                    None => VpuError::engine("add framebuffers to pool", code),
                });
            }

            self.stats.total_allocated += batch.len() as u64;
            self.buffers.extend(batch);
        }

        if let Some(source) = alloc_error {
            self.stats.failed_grows += 1;
            return Err(VpuError::AllocationFailure {
                what: "pool framebuffer",
                source,
            });
        }

        self.stats.grow_calls += 1;
        debug!(
            "Framebuffer pool grew by {} to {} (epoch {})",
            count,
            self.buffers.len(),
            self.epoch
        );
        Ok(())
    }

    /// Release every framebuffer and start a new epoch
    ///
    /// Calling this on an empty pool is a no-op apart from the epoch.
    pub fn reset(&mut self) {
        if !self.buffers.is_empty() {
            debug!(
                "Releasing {} pool framebuffer(s) (epoch {})",
                self.buffers.len(),
                self.epoch
            );
            self.stats.total_released += self.buffers.len() as u64;
            self.stats.resets += 1;
            self.buffers.clear();
        }
        self.epoch += 1;
    }

    /// Number of registered framebuffers
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of resets so far
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Handles in registration order
    pub fn handles(&self) -> Vec<DmaHandle> {
        self.buffers.iter().map(DmaBuffer::handle).collect()
    }

    /// Whether `handle` belongs to this pool
    pub fn contains(&self, handle: DmaHandle) -> bool {
        self.buffers.iter().any(|b| b.handle() == handle)
    }

    /// Framebuffer with the given handle
    pub fn get_mut(&mut self, handle: DmaHandle) -> Option<&mut DmaBuffer> {
        self.buffers.iter_mut().find(|b| b.handle() == handle)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}
