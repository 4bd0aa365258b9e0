//! Configuration type definitions

use serde::{Deserialize, Serialize};

use crate::engine::{CompressionFormat, EncOpenParams};
use crate::image::PixelFormat;

/// Dispatcher step bound per call
const DEFAULT_MAX_STEPS: usize = 1024;

/// Decoder session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Bitstream format of the input
    pub compression_format: CompressionFormat,

    /// Expected frame width in pixels
    pub width: u32,

    /// Expected frame height in pixels
    pub height: u32,

    /// Pixel format requested by the caller ("yuv420p" only; output is NV12)
    pub pixel_format: PixelFormat,

    /// Let the engine reorder frames (B-frames)
    pub frame_reordering: bool,

    /// Dispatcher steps allowed per call before giving up
    pub max_steps_per_call: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            compression_format: CompressionFormat::H264,
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::Yuv420p,
            frame_reordering: true,
            max_steps_per_call: DEFAULT_MAX_STEPS,
        }
    }
}

/// Encoder session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Bitstream format of the output
    pub compression_format: CompressionFormat,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel format of raw input frames
    pub pixel_format: PixelFormat,

    /// Frame rate numerator
    pub fps_num: u32,

    /// Frame rate denominator
    pub fps_den: u32,

    /// Target bitrate in bits per second
    pub bitrate: u64,

    /// Distance between keyframes (0 = first frame only)
    pub gop_size: u32,

    /// Constant quantization; disables bitrate-based rate control when set
    pub quantization: Option<u32>,

    /// Dispatcher steps allowed per call before giving up
    pub max_steps_per_call: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            compression_format: CompressionFormat::H264,
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::Yuv420p,
            fps_num: 30,
            fps_den: 1,
            bitrate: 4_000_000,
            gop_size: 30,
            quantization: None,
            max_steps_per_call: DEFAULT_MAX_STEPS,
        }
    }
}

impl EncoderConfig {
    /// Bitrate handed to the engine, in kbps
    ///
    /// Rounds down with a minimum of 1 for any non-zero bitrate. Returns 0
    /// when a quantization value disables rate control.
    pub fn bitrate_kbps(&self) -> u32 {
        if self.quantization.is_some() || self.bitrate == 0 {
            return 0;
        }
        u32::try_from(self.bitrate / 1000)
            .unwrap_or(u32::MAX)
            .max(1)
    }

    /// Engine open parameters for this configuration
    pub fn open_params(&self) -> EncOpenParams {
        EncOpenParams {
            compression_format: self.compression_format,
            color_format: self.pixel_format,
            frame_width: self.width,
            frame_height: self.height,
            fps_num: self.fps_num,
            fps_den: self.fps_den,
            bitrate_kbps: self.bitrate_kbps(),
            quantization: self.quantization,
            gop_size: self.gop_size,
        }
    }
}

/// Software loopback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Decode into pool framebuffers (false = dedicated output framebuffer)
    pub frames_from_pool: bool,

    /// Row stride alignment of reported plane layouts, in bytes
    pub stride_alignment: usize,

    /// Byte offset of the first plane inside a framebuffer
    pub plane_offset: usize,

    /// Physical address alignment of framebuffers
    pub framebuffer_alignment: usize,

    /// Minimum framebuffer count reported in stream info
    pub min_framebuffers: usize,

    /// Size of the bitstream staging buffer
    pub stream_buffer_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            frames_from_pool: true,
            stride_alignment: 16,
            plane_offset: 0,
            framebuffer_alignment: 16,
            min_framebuffers: 3,
            stream_buffer_size: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_kbps_rounds_down() {
        let config = EncoderConfig {
            bitrate: 4_999_999,
            ..Default::default()
        };
        assert_eq!(config.bitrate_kbps(), 4999);
    }

    #[test]
    fn test_bitrate_kbps_minimum_one() {
        let config = EncoderConfig {
            bitrate: 500,
            ..Default::default()
        };
        assert_eq!(config.bitrate_kbps(), 1);

        let config = EncoderConfig {
            bitrate: 0,
            ..Default::default()
        };
        assert_eq!(config.bitrate_kbps(), 0);
    }

    #[test]
    fn test_quantization_disables_rate_control() {
        let config = EncoderConfig {
            quantization: Some(28),
            ..Default::default()
        };
        let params = config.open_params();
        assert_eq!(params.bitrate_kbps, 0);
        assert_eq!(params.quantization, Some(28));
    }

    #[test]
    fn test_open_params() {
        let params = EncoderConfig::default().open_params();
        assert_eq!(params.frame_width, 1920);
        assert_eq!(params.bitrate_kbps, 4000);
        assert_eq!(params.gop_size, 30);
        assert_eq!(params.color_format, PixelFormat::Yuv420p);
    }
}
