//! Error types for VPU sessions
//!
//! Three layers of errors exist:
//!
//! - [`DmaError`]: returned by a [`DmaAllocator`](crate::dma::DmaAllocator)
//!   implementation (allocation, mapping, release)
//! - [`EngineCode`]: the non-OK status of a hardware engine call
//! - [`VpuError`]: what a decoder or encoder session surfaces to the caller,
//!   wrapping the two above with the operation that failed

use thiserror::Error;

/// Non-OK return status of a hardware engine call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineCode {
    /// Call not valid in the engine's current state
    ///
    /// For bitstream pushes this usually means the engine still holds
    /// unconsumed input and has to be flushed first.
    #[error("invalid call")]
    InvalidCall,

    /// Parameters rejected by the engine
    #[error("invalid parameters")]
    InvalidParams,

    /// Engine could not access a DMA buffer it was given
    #[error("DMA memory access error")]
    DmaMemoryAccess,

    /// Engine needs more framebuffers before it can proceed
    #[error("insufficient framebuffers")]
    InsufficientFramebuffers,

    /// Framebuffer or context does not belong to this engine instance
    #[error("framebuffer context mismatch")]
    ContextMismatch,

    /// Engine did not respond in time
    #[error("timeout")]
    Timeout,

    /// Unspecified engine failure
    #[error("engine error")]
    Error,
}

/// Errors reported by a DMA buffer allocator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// Allocator is out of DMA-capable memory
    #[error("out of DMA memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// Zero-sized allocations are not supported
    #[error("invalid allocation size {0}")]
    InvalidSize(usize),

    /// Alignment must be a power of two
    #[error("invalid alignment {0} (must be a power of two)")]
    InvalidAlignment(usize),

    /// Handle does not refer to a live buffer of this allocator
    #[error("unknown DMA buffer {0}")]
    UnknownBuffer(u64),

    /// Buffer is already mapped by another transfer
    #[error("DMA buffer {0} is already mapped")]
    AlreadyMapped(u64),

    /// Buffer cannot be released while mapped
    #[error("DMA buffer {0} is still mapped")]
    StillMapped(u64),

    /// Handle claims more bytes than the buffer it names holds
    #[error("DMA buffer {id} holds {actual} bytes, handle claims {claimed}")]
    SizeMismatch { id: u64, claimed: usize, actual: usize },

    /// Write access requested on a mapping created without the write flag
    #[error("DMA buffer {0} is not mapped for writing")]
    NotWritable(u64),
}

/// Coarse classification of [`VpuError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Memory allocator exhausted or rejected a request
    AllocationFailure,
    /// Hardware engine returned a non-OK status
    EngineRejected,
    /// Pixel format or capability combination not handled
    UnsupportedFormat,
    /// Engine produced an output code outside the recognized set
    ProtocolViolation,
    /// Caller passed an invalid frame or used a closed session
    Usage,
}

/// Error surfaced by decoder and encoder sessions
///
/// Every error leaves the session closable: resources acquired before the
/// failure are released by [`close`](crate::decoder::DecoderSession::close)
/// or on drop.
#[derive(Debug, Error)]
pub enum VpuError {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// DMA buffer allocation failed
    #[error("could not allocate {what}: {source}")]
    AllocationFailure {
        what: &'static str,
        #[source]
        source: DmaError,
    },

    /// DMA buffer could not be mapped into the CPU address space
    #[error("could not map DMA buffer: {0}")]
    MapFailed(#[source] DmaError),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Hardware engine refused an operation
    #[error("engine rejected {operation}: {code}")]
    EngineRejected {
        operation: &'static str,
        code: EngineCode,
    },

    /// Engine produced an output code this session does not understand
    #[error("{direction} engine produced unknown output code {code}")]
    ProtocolViolation {
        direction: &'static str,
        code: u32,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Requested pixel format or capability combination not handled
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Invalid frame dimensions
    #[error("invalid dimensions: {width}x{height} - {reason}")]
    InvalidDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// Caller-supplied frame or engine-reported layout does not fit
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Session was already closed
    #[error("session is closed")]
    SessionClosed,
}

impl VpuError {
    /// Shorthand for an engine rejection
    pub fn engine(operation: &'static str, code: EngineCode) -> Self {
        VpuError::EngineRejected { operation, code }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VpuError::AllocationFailure { .. } | VpuError::MapFailed(_) => {
                ErrorKind::AllocationFailure
            }
            VpuError::EngineRejected { .. } => ErrorKind::EngineRejected,
            VpuError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            VpuError::UnsupportedFormat(_) | VpuError::InvalidDimensions { .. } => {
                ErrorKind::UnsupportedFormat
            }
            VpuError::InvalidFrame(_) | VpuError::SessionClosed => ErrorKind::Usage,
        }
    }

    /// Check if the call can be retried with different input
    ///
    /// Allocation, engine and protocol failures are fatal to the session;
    /// only usage errors leave it in a usable state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VpuError::InvalidFrame(_))
    }
}

/// Result type for session operations
pub type VpuResult<T> = Result<T, VpuError>;
