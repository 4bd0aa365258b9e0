//! Encode engine contract

use super::{CompressionFormat, EngineResult, FrameContext, FramebufferSink, StreamInfo};
use crate::dma::DmaHandle;
use crate::image::PixelFormat;

/// Global information about an encode backend, available before open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncGlobalInfo {
    /// Minimum size of the bitstream staging buffer
    pub min_stream_buffer_size: usize,
    /// Physical address alignment of the bitstream staging buffer
    pub stream_buffer_alignment: usize,
    /// Raw frame formats the engine accepts
    pub supported_color_formats: Vec<PixelFormat>,
}

/// Encoder open parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncOpenParams {
    pub compression_format: CompressionFormat,
    pub color_format: PixelFormat,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    /// Target bitrate; 0 when rate control is disabled
    pub bitrate_kbps: u32,
    /// Constant quantization; `Some` disables rate control
    pub quantization: Option<u32>,
    /// Distance between keyframes; 0 means only the first frame
    pub gop_size: u32,
}

/// Raw frame staged in a framebuffer and pushed for encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameUnit {
    pub framebuffer: DmaHandle,
    pub context: FrameContext,
    pub pts: u64,
    pub dts: u64,
}

/// Output code of one [`EncodeEngine::encode`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncOutputCode {
    NoOutputYetAvailable,
    Eos,
    NeedAdditionalFramebuffer,
    EncodedFrameAvailable,
    MoreInputDataNeeded,
    /// Code outside the documented set
    Other(u32),
}

impl EncOutputCode {
    /// Numeric value of the code
    pub fn raw(self) -> u32 {
        match self {
            EncOutputCode::NoOutputYetAvailable => 0,
            EncOutputCode::Eos => 1,
            EncOutputCode::NeedAdditionalFramebuffer => 2,
            EncOutputCode::EncodedFrameAvailable => 3,
            EncOutputCode::MoreInputDataNeeded => 4,
            EncOutputCode::Other(code) => code,
        }
    }
}

/// Picture type of an encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
}

/// Metadata of a fetched encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameInfo {
    pub size: usize,
    pub frame_type: FrameType,
    /// Context of the raw frame that produced this output
    pub context: FrameContext,
    pub pts: u64,
    pub dts: u64,
}

/// Open encoder instance
pub trait EncodeEngine: FramebufferSink {
    /// Hand a staged raw frame to the engine
    fn push_raw_frame(&mut self, frame: &RawFrameUnit) -> EngineResult<()>;

    /// Run one encoding step, returning the encoded size alongside the code
    fn encode(&mut self) -> EngineResult<(usize, EncOutputCode)>;

    /// Current stream parameters
    fn stream_info(&self) -> EngineResult<StreamInfo>;

    /// Copy the frame announced by [`EncOutputCode::EncodedFrameAvailable`]
    ///
    /// `dst` must hold at least the size reported by that step.
    fn encoded_frame(&mut self, dst: &mut [u8]) -> EngineResult<EncodedFrameInfo>;

    /// Encode remaining queued frames and report end of stream afterwards
    fn enable_drain_mode(&mut self) -> EngineResult<()>;

    /// Close the instance; every later call fails
    fn close(&mut self) -> EngineResult<()>;
}

/// Factory of encoder instances
pub trait EncodeBackend {
    /// Backend identifier for logging
    fn name(&self) -> &'static str;

    /// Static capabilities
    fn global_info(&self) -> EncGlobalInfo;

    /// Open an instance that uses `stream_buffer` for bitstream staging
    fn open(
        &self,
        params: &EncOpenParams,
        stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn EncodeEngine>>;
}
