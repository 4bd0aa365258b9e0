//! Software loopback engines
//!
//! Reference implementations of both engine contracts that run on the CPU
//! against any [`DmaAllocator`](crate::dma::DmaAllocator). They follow the
//! same event protocol a VPU does (stream info negotiation, framebuffer
//! pools, one output code per step) but "compress" by storing planes
//! verbatim behind a small header:
//!
//! ```text
//! 0      4        5       6         7          8         12         16
//! ┌──────┬────────┬───────┬─────────┬──────────┬─────────┬──────────┬─────────────┐
//! │ LVPU │ format │ flags │ pixfmt  │ reserved │ width   │ height   │ Y | U | V   │
//! └──────┴────────┴───────┴─────────┴──────────┴─────────┴──────────┴─────────────┘
//! ```
//!
//! Width and height are little-endian `u32`; planes are tightly packed.
//! The decoder only accepts 4:2:0 payloads and produces NV12 framebuffers
//! whose stride padding is filled with [`PADDING_BYTE`].

pub mod decoder;
pub mod encoder;

pub use decoder::{LoopbackDecodeBackend, LoopbackDecoder};
pub use encoder::{LoopbackEncodeBackend, LoopbackEncoder};

use crate::config::LoopbackConfig;
use crate::engine::{CompressionFormat, FramebufferMetrics};
use crate::image::PixelFormat;

/// Bitstream magic
pub const MAGIC: [u8; 4] = *b"LVPU";

/// Size of the frame header in bytes
pub const HEADER_LEN: usize = 16;

/// Fill value of framebuffer bytes outside the visible planes
pub const PADDING_BYTE: u8 = 0xEE;

const FLAG_KEYFRAME: u8 = 0x01;

/// Header of one loopback bitstream frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compression_format: CompressionFormat,
    pub pixel_format: PixelFormat,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
}

impl FrameHeader {
    /// Size of the packed planes following the header
    pub fn payload_len(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// Size of the whole frame
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Serialize into the first [`HEADER_LEN`] bytes of `dst`
    pub fn write(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&MAGIC);
        dst[4] = self.compression_format.code();
        dst[5] = if self.keyframe { FLAG_KEYFRAME } else { 0 };
        dst[6] = self.pixel_format.code();
        dst[7] = 0;
        dst[8..12].copy_from_slice(&self.width.to_le_bytes());
        dst[12..16].copy_from_slice(&self.height.to_le_bytes());
    }

    /// Parse a header; `None` if `src` does not start with one
    pub fn parse(src: &[u8]) -> Option<Self> {
        let header = src.get(..HEADER_LEN)?;
        if header[0..4] != MAGIC {
            return None;
        }
        let width = u32::from_le_bytes(header[8..12].try_into().ok()?);
        let height = u32::from_le_bytes(header[12..16].try_into().ok()?);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            compression_format: CompressionFormat::from_code(header[4])?,
            pixel_format: PixelFormat::from_code(header[6])?,
            keyframe: header[5] & FLAG_KEYFRAME != 0,
            width,
            height,
        })
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two or 0)
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Plane layout and framebuffer size for a frame of `format`
pub(crate) fn framebuffer_layout(
    config: &LoopbackConfig,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> (FramebufferMetrics, usize) {
    let sample = format.bytes_per_sample();
    let chroma_width = format.chroma_width(width) as usize;
    let chroma_rows = format.chroma_height(height) as usize;

    let y_stride = align_up(width as usize * sample, config.stride_alignment);
    let y_size = y_stride * height as usize;
    let y_offset = config.plane_offset;
    let u_offset = y_offset + y_size;

    if format.is_semi_planar() {
        let uv_stride = align_up(chroma_width * 2 * sample, config.stride_alignment);
        let uv_size = uv_stride * chroma_rows;
        let metrics = FramebufferMetrics {
            actual_width: width,
            actual_height: height,
            y_stride,
            uv_stride,
            y_size,
            uv_size,
            y_offset,
            u_offset,
            v_offset: u_offset + sample,
        };
        (metrics, u_offset + uv_size)
    } else {
        let uv_stride = align_up(chroma_width * sample, config.stride_alignment);
        let uv_size = uv_stride * chroma_rows;
        let v_offset = u_offset + uv_size;
        let metrics = FramebufferMetrics {
            actual_width: width,
            actual_height: height,
            y_stride,
            uv_stride,
            y_size,
            uv_size,
            y_offset,
            u_offset,
            v_offset,
        };
        (metrics, v_offset + uv_size)
    }
}
