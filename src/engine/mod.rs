//! Hardware engine contracts
//!
//! The VPU driver is an external collaborator. This module describes the
//! boundary the sessions drive it through:
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │    DecoderSession    │          │    EncoderSession    │
//! └──────────┬───────────┘          └──────────┬───────────┘
//!            │ push / decode()                 │ push / encode()
//!            ▼                                 ▼
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │ DecodeEngine         │          │ EncodeEngine         │
//! │  (FramebufferSink)   │          │  (FramebufferSink)   │
//! └──────────────────────┘          └──────────────────────┘
//!            ▲                                 ▲
//!            └──────── opened by a Backend ────┘
//! ```
//!
//! Each engine call returns either a value or a non-OK [`EngineCode`]. The
//! single-step primitives (`decode()` / `encode()`) yield one output code per
//! call; the sessions interpret those codes.
//!
//! [`StreamInfo`] is authoritative: sessions never derive buffer sizes or
//! plane layouts themselves, they only cache the latest snapshot.

pub mod decode;
pub mod encode;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dma::DmaHandle;
use crate::error::EngineCode;
use crate::image::PixelFormat;

pub use decode::{
    DecCapability, DecGlobalInfo, DecOpenFlag, DecOpenParams, DecOutputCode, DecodeBackend,
    DecodeEngine, DecodedFrameDescriptor, EncodedUnit, SkipReason, SkippedFrameInfo,
};
pub use encode::{
    EncGlobalInfo, EncOpenParams, EncOutputCode, EncodeBackend, EncodeEngine, EncodedFrameInfo,
    FrameType, RawFrameUnit,
};

/// Result of an engine call
pub type EngineResult<T> = Result<T, EngineCode>;

/// Compressed bitstream formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Mjpeg,
}

impl CompressionFormat {
    /// Stable numeric tag
    pub fn code(self) -> u8 {
        match self {
            CompressionFormat::H264 => 0,
            CompressionFormat::Hevc => 1,
            CompressionFormat::Vp8 => 2,
            CompressionFormat::Vp9 => 3,
            CompressionFormat::Mjpeg => 4,
        }
    }

    /// Inverse of [`code`](Self::code)
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => CompressionFormat::H264,
            1 => CompressionFormat::Hevc,
            2 => CompressionFormat::Vp8,
            3 => CompressionFormat::Vp9,
            4 => CompressionFormat::Mjpeg,
            _ => return None,
        })
    }
}

impl FromStr for CompressionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" => Ok(CompressionFormat::H264),
            "hevc" | "h265" => Ok(CompressionFormat::Hevc),
            "vp8" => Ok(CompressionFormat::Vp8),
            "vp9" => Ok(CompressionFormat::Vp9),
            "mjpeg" | "jpeg" => Ok(CompressionFormat::Mjpeg),
            _ => Err(format!("Unknown compression format: {s}")),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionFormat::H264 => write!(f, "h264"),
            CompressionFormat::Hevc => write!(f, "hevc"),
            CompressionFormat::Vp8 => write!(f, "vp8"),
            CompressionFormat::Vp9 => write!(f, "vp9"),
            CompressionFormat::Mjpeg => write!(f, "mjpeg"),
        }
    }
}

/// Opaque per-framebuffer correlation tag
///
/// The engine hands a framebuffer's context back whenever it returns that
/// framebuffer, so the session can tell which slot it belongs to. The
/// engine never invents one; the session produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameContext(u64);

impl FrameContext {
    /// No context known yet
    pub const UNSET: FrameContext = FrameContext(u64::MAX);

    /// Context of the pool slot at absolute index `index`
    pub const fn for_slot(index: usize) -> Self {
        FrameContext(index as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        FrameContext(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Default for FrameContext {
    fn default() -> Self {
        FrameContext::UNSET
    }
}

impl fmt::Display for FrameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "ctx#{}", self.0)
        } else {
            write!(f, "ctx#unset")
        }
    }
}

/// Plane layout of a frame inside a framebuffer
///
/// Offsets are byte offsets from the start of the framebuffer. For
/// semi-planar formats `u_offset` is the start of the interleaved CbCr
/// plane, `v_offset` is `u_offset + 1`, and `uv_stride` is the stride of
/// that interleaved plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramebufferMetrics {
    /// Width of the visible frame in pixels
    pub actual_width: u32,
    /// Height of the visible frame in pixels
    pub actual_height: u32,
    /// Luma row stride in bytes
    pub y_stride: usize,
    /// Chroma row stride in bytes
    pub uv_stride: usize,
    /// Size of the luma plane in bytes
    pub y_size: usize,
    /// Size of one chroma plane in bytes
    pub uv_size: usize,
    pub y_offset: usize,
    pub u_offset: usize,
    pub v_offset: usize,
}

/// Engine-reported snapshot of buffer sizing and plane layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Minimum number of pool framebuffers the engine needs
    pub min_framebuffer_count: usize,
    /// Size of one pool framebuffer in bytes
    pub framebuffer_size: usize,
    /// Physical address alignment of pool framebuffers
    pub framebuffer_alignment: usize,
    /// Size of a dedicated output framebuffer (decode only)
    pub output_framebuffer_size: usize,
    /// Physical address alignment of a dedicated output framebuffer
    pub output_framebuffer_alignment: usize,
    /// Layout of frames inside a framebuffer
    pub metrics: FramebufferMetrics,
    /// Pixel format of frames inside a framebuffer
    pub color_format: PixelFormat,
    pub fps_num: u32,
    pub fps_den: u32,
}

/// Terminal state of one output dispatcher run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// Engine wants the next input unit
    NeedMoreInput,
    /// Engine reported end of stream
    EndOfStream,
}

/// Engine side of framebuffer pool registration
///
/// Framebuffers are registered in batches; `contexts[i]` belongs to
/// `framebuffers[i]`. On error the engine has registered none of the batch.
#[cfg_attr(test, mockall::automock)]
pub trait FramebufferSink {
    fn add_framebuffers_to_pool(
        &mut self,
        framebuffers: &[DmaHandle],
        contexts: &[FrameContext],
    ) -> EngineResult<()>;
}
