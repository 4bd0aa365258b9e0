//! Host framework boundary types
//!
//! Images and packets exchanged with the calling media pipeline. These types
//! own ordinary host memory; hardware memory never leaves the sessions.
//!
//! - [`PlanarImage`]: caller-owned raw frame pushed for encode, one plane per
//!   component with its own row stride
//! - [`Nv12Image`]: fixed two-plane image produced by the decoder
//! - [`DecodedFrame`] / [`EncodedPacket`]: output units tagged with the
//!   timestamps of the input unit that produced them

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::FrameContext;
use crate::error::{VpuError, VpuResult};

/// Pixel formats known to the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar 4:2:0, 8 bit (I420)
    Yuv420p,
    /// Planar 4:2:2, 8 bit
    Yuv422p,
    /// Planar 4:4:4, 8 bit
    Yuv444p,
    /// Planar 4:1:1, 8 bit
    Yuv411p,
    /// Semi-planar 4:2:0, 8 bit, interleaved CbCr plane
    Nv12,
    /// Semi-planar 4:2:0, 10 bit in 16 bit words
    P010,
}

impl PixelFormat {
    /// Whether chroma is stored as one interleaved CbCr plane
    pub fn is_semi_planar(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::P010)
    }

    /// Number of planes in memory
    pub fn plane_count(self) -> usize {
        if self.is_semi_planar() {
            2
        } else {
            3
        }
    }

    /// Bytes per sample
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::P010 => 2,
            _ => 1,
        }
    }

    /// Horizontal and vertical chroma subsampling shifts
    pub fn chroma_shift(self) -> (u32, u32) {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 | PixelFormat::P010 => (1, 1),
            PixelFormat::Yuv422p => (1, 0),
            PixelFormat::Yuv444p => (0, 0),
            PixelFormat::Yuv411p => (2, 0),
        }
    }

    /// Width of one chroma component in samples
    pub fn chroma_width(self, width: u32) -> u32 {
        let (shift_x, _) = self.chroma_shift();
        width.div_ceil(1 << shift_x)
    }

    /// Height of the chroma planes in rows
    pub fn chroma_height(self, height: u32) -> u32 {
        let (_, shift_y) = self.chroma_shift();
        height.div_ceil(1 << shift_y)
    }

    /// Tightly packed size of one frame in bytes
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        let chroma =
            self.chroma_width(width) as usize * self.chroma_height(height) as usize * 2;
        (luma + chroma) * self.bytes_per_sample()
    }

    /// Stable numeric tag
    pub fn code(self) -> u8 {
        match self {
            PixelFormat::Yuv420p => 0,
            PixelFormat::Yuv422p => 1,
            PixelFormat::Yuv444p => 2,
            PixelFormat::Yuv411p => 3,
            PixelFormat::Nv12 => 4,
            PixelFormat::P010 => 5,
        }
    }

    /// Inverse of [`code`](Self::code)
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PixelFormat::Yuv420p,
            1 => PixelFormat::Yuv422p,
            2 => PixelFormat::Yuv444p,
            3 => PixelFormat::Yuv411p,
            4 => PixelFormat::Nv12,
            5 => PixelFormat::P010,
            _ => return None,
        })
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yuv420p" | "i420" => Ok(PixelFormat::Yuv420p),
            "yuv422p" => Ok(PixelFormat::Yuv422p),
            "yuv444p" => Ok(PixelFormat::Yuv444p),
            "yuv411p" => Ok(PixelFormat::Yuv411p),
            "nv12" => Ok(PixelFormat::Nv12),
            "p010" => Ok(PixelFormat::P010),
            _ => Err(format!("Unknown pixel format: {s}")),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Yuv420p => write!(f, "yuv420p"),
            PixelFormat::Yuv422p => write!(f, "yuv422p"),
            PixelFormat::Yuv444p => write!(f, "yuv444p"),
            PixelFormat::Yuv411p => write!(f, "yuv411p"),
            PixelFormat::Nv12 => write!(f, "nv12"),
            PixelFormat::P010 => write!(f, "p010"),
        }
    }
}

/// One plane of a host image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlane {
    /// Plane bytes, `stride * rows` long
    pub data: Vec<u8>,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
}

impl ImagePlane {
    /// Zero-filled plane
    pub fn new(stride: usize, rows: usize) -> Self {
        Self {
            data: vec![0; stride * rows],
            stride,
        }
    }

    /// Bytes of row `y`, `width` long
    pub fn row(&self, y: usize, width: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + width]
    }

    /// Mutable bytes of row `y`, `width` long
    pub fn row_mut(&mut self, y: usize, width: usize) -> &mut [u8] {
        let start = y * self.stride;
        &mut self.data[start..start + width]
    }
}

/// Caller-owned fully planar raw image (Y, U, V)
///
/// Each plane carries its own row stride, which may be larger than the
/// logical row width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarImage {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: [ImagePlane; 3],
}

impl PlanarImage {
    /// Zero-filled image with tightly packed rows
    pub fn new(format: PixelFormat, width: u32, height: u32) -> VpuResult<Self> {
        Self::with_padding(format, width, height, 0)
    }

    /// Zero-filled image whose rows carry `padding` extra bytes
    pub fn with_padding(
        format: PixelFormat,
        width: u32,
        height: u32,
        padding: usize,
    ) -> VpuResult<Self> {
        if format.is_semi_planar() || format.bytes_per_sample() != 1 {
            return Err(VpuError::UnsupportedFormat(format!(
                "{format} is not an 8-bit planar format"
            )));
        }
        if width == 0 || height == 0 {
            return Err(VpuError::InvalidDimensions {
                width,
                height,
                reason: "dimensions must be non-zero".to_string(),
            });
        }

        let cw = format.chroma_width(width) as usize;
        let ch = format.chroma_height(height) as usize;
        Ok(Self {
            format,
            width,
            height,
            planes: [
                ImagePlane::new(width as usize + padding, height as usize),
                ImagePlane::new(cw + padding, ch),
                ImagePlane::new(cw + padding, ch),
            ],
        })
    }

    /// Logical (width, rows) of plane `index`
    pub fn plane_size(&self, index: usize) -> (usize, usize) {
        if index == 0 {
            (self.width as usize, self.height as usize)
        } else {
            (
                self.format.chroma_width(self.width) as usize,
                self.format.chroma_height(self.height) as usize,
            )
        }
    }

    /// Check that every plane holds its logical rows
    pub fn validate(&self) -> VpuResult<()> {
        if self.format.is_semi_planar() || self.format.bytes_per_sample() != 1 {
            return Err(VpuError::UnsupportedFormat(format!(
                "{} is not an 8-bit planar format",
                self.format
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(VpuError::InvalidFrame(format!(
                "empty image {}x{}",
                self.width, self.height
            )));
        }
        for (index, plane) in self.planes.iter().enumerate() {
            let (width, rows) = self.plane_size(index);
            if plane.stride < width {
                return Err(VpuError::InvalidFrame(format!(
                    "plane {index} stride {} is smaller than its width {width}",
                    plane.stride
                )));
            }
            let needed = plane.stride * (rows - 1) + width;
            if plane.data.len() < needed {
                return Err(VpuError::InvalidFrame(format!(
                    "plane {index} holds {} bytes, {needed} needed",
                    plane.data.len()
                )));
            }
        }
        Ok(())
    }
}

/// Fixed two-plane NV12 image handed to the caller by the decoder
///
/// Rows are contiguous: the luma plane is `width * height` bytes and the
/// interleaved chroma plane `width * height / 2` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nv12Image {
    pub width: u32,
    pub height: u32,
    pub luma: Vec<u8>,
    pub chroma: Vec<u8>,
}

impl Nv12Image {
    /// Zero-filled image
    pub fn new(width: u32, height: u32) -> Self {
        let chroma_width = PixelFormat::Nv12.chroma_width(width) as usize * 2;
        let chroma_rows = PixelFormat::Nv12.chroma_height(height) as usize;
        Self {
            width,
            height,
            luma: vec![0; width as usize * height as usize],
            chroma: vec![0; chroma_width * chroma_rows],
        }
    }

    /// Bytes per chroma row (interleaved CbCr)
    pub fn chroma_row_bytes(&self) -> usize {
        PixelFormat::Nv12.chroma_width(self.width) as usize * 2
    }

    /// Split the interleaved chroma plane into separate U and V planes
    pub fn deinterleave_chroma(&self) -> (Vec<u8>, Vec<u8>) {
        let u = self.chroma.iter().step_by(2).copied().collect();
        let v = self.chroma.iter().skip(1).step_by(2).copied().collect();
        (u, v)
    }
}

/// Decoded frame surfaced by a decoder session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub image: Nv12Image,
    pub pts: u64,
    pub dts: u64,
    /// Context tag of the framebuffer the frame was decoded into
    pub context: FrameContext,
}

/// Encoded unit surfaced by an encoder session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: u64,
    pub dts: u64,
    pub is_keyframe: bool,
}
