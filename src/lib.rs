//! # lamco-vpu
//!
//! Session manager for stateful hardware video codecs.
//!
//! A VPU decodes and encodes through a small set of blocking calls and a
//! step primitive that returns one output code at a time. This crate drives
//! that protocol: it negotiates stream parameters, keeps the engine's
//! framebuffer pool in DMA memory, and moves pixels between framebuffers and
//! host images.
//!
//! # Architecture
//!
//! ```text
//! lamco-vpu
//!   ├─> DecoderSession (push, decode dispatcher, stream negotiation)
//!   ├─> EncoderSession (upload, encode dispatcher, drain)
//!   ├─> FramebufferPool (batched growth, epoch reset)
//!   ├─> transfer (stride-aware plane copies, scoped DMA mappings)
//!   └─> engine / dma (collaborator contracts, loopback + heap implementations)
//! ```
//!
//! # Data Flow
//!
//! **Decode:** packet → staging buffer → engine → pool framebuffer → [`Nv12Image`]
//!
//! **Encode:** [`PlanarImage`] → input framebuffer → engine → staging buffer → [`EncodedPacket`]
//!
//! [`Nv12Image`]: image::Nv12Image
//! [`PlanarImage`]: image::PlanarImage
//! [`EncodedPacket`]: image::EncodedPacket

#![warn(clippy::all)]

/// Session and engine error types
pub mod error;

/// DMA buffer allocation and scoped mapping
pub mod dma;

/// Hardware engine contracts
pub mod engine;

/// Host framework image and packet types
pub mod image;

/// Framebuffer pool management
pub mod pool;

/// Pixel transfer between framebuffers and host images
pub mod transfer;

/// Decoder session
pub mod decoder;

/// Encoder session
pub mod encoder;

/// Session configuration
pub mod config;

/// Per-session statistics
pub mod stats;

/// Software loopback engines
///
/// Both engine contracts implemented on the CPU. The CLI and the
/// integration tests run sessions against them.
pub mod loopback;

pub use decoder::DecoderSession;
pub use encoder::EncoderSession;
pub use error::{VpuError, VpuResult};
