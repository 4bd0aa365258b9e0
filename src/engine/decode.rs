//! Decode engine contract

use enumflags2::{bitflags, BitFlags};

use super::{CompressionFormat, EngineResult, FrameContext, FramebufferSink, StreamInfo};
use crate::dma::DmaHandle;

/// Static decoder capabilities
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecCapability {
    /// Decoded frames are written into pool framebuffers
    ///
    /// Without this flag the engine writes each decoded frame into a single
    /// dedicated output framebuffer that has to be re-armed per frame with
    /// [`DecodeEngine::set_output_framebuffer`].
    DecodedFramesFromPool = 0b0001,
    /// Engine can decode semi-planar output
    SemiPlanarOutput = 0b0010,
}

/// Global information about a decode backend, available before open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecGlobalInfo {
    pub flags: BitFlags<DecCapability>,
    /// Minimum size of the bitstream staging buffer
    pub min_stream_buffer_size: usize,
    /// Physical address alignment of the bitstream staging buffer
    pub stream_buffer_alignment: usize,
}

impl DecGlobalInfo {
    /// Whether decoded frames come out of the framebuffer pool
    pub fn frames_from_pool(&self) -> bool {
        self.flags.contains(DecCapability::DecodedFramesFromPool)
    }
}

/// Decoder open flags
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecOpenFlag {
    EnableFrameReordering = 0b01,
    UseSemiPlanarColorFormat = 0b10,
}

/// Decoder open parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecOpenParams {
    pub compression_format: CompressionFormat,
    pub flags: BitFlags<DecOpenFlag>,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Encoded bitstream unit pushed for decode (not owned)
#[derive(Debug, Clone, Copy)]
pub struct EncodedUnit<'a> {
    pub data: &'a [u8],
    pub pts: u64,
    pub dts: u64,
    /// Caller tag, reported back for skipped frames
    pub context: FrameContext,
}

/// Output code of one [`DecodeEngine::decode`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecOutputCode {
    NoOutputYetAvailable,
    Eos,
    /// Stream parameters changed; previous pool registrations are dropped
    NewStreamInfoAvailable,
    NeedAdditionalFramebuffer,
    DecodedFrameAvailable,
    MoreInputDataNeeded,
    FrameSkipped,
    /// Code outside the documented set
    Other(u32),
}

impl DecOutputCode {
    /// Numeric value of the code
    pub fn raw(self) -> u32 {
        match self {
            DecOutputCode::NoOutputYetAvailable => 0,
            DecOutputCode::Eos => 1,
            DecOutputCode::NewStreamInfoAvailable => 2,
            DecOutputCode::NeedAdditionalFramebuffer => 3,
            DecOutputCode::DecodedFrameAvailable => 4,
            DecOutputCode::MoreInputDataNeeded => 5,
            DecOutputCode::FrameSkipped => 6,
            DecOutputCode::Other(code) => code,
        }
    }
}

/// Descriptor of a decoded frame held by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrameDescriptor {
    /// Framebuffer holding the frame
    pub framebuffer: DmaHandle,
    /// Context tag of that framebuffer
    pub fb_context: FrameContext,
    /// Caller tag of the input unit that produced the frame
    pub context: FrameContext,
    pub pts: u64,
    pub dts: u64,
}

/// Why the engine dropped an input unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Bitstream could not be parsed
    CorruptFrame,
    /// Frame was decoded but not shown
    NotShown,
    /// Internal engine reason
    Internal,
}

/// Diagnostic information about the last skipped frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedFrameInfo {
    pub reason: SkipReason,
    pub context: FrameContext,
    pub pts: u64,
    pub dts: u64,
}

/// Open decoder instance
///
/// Implementations are driven by one session from one thread at a time.
pub trait DecodeEngine: FramebufferSink {
    /// Hand an encoded unit to the engine
    ///
    /// Returns [`EngineCode::InvalidCall`](crate::error::EngineCode) while
    /// earlier input is still unconsumed.
    fn push_encoded_frame(&mut self, unit: &EncodedUnit<'_>) -> EngineResult<()>;

    /// Discard queued input and return every framebuffer to the free list
    fn flush(&mut self) -> EngineResult<()>;

    /// Decode remaining queued frames and report end of stream afterwards
    fn enable_drain_mode(&mut self) -> EngineResult<()>;

    /// Run one decoding step
    fn decode(&mut self) -> EngineResult<DecOutputCode>;

    /// Current stream parameters
    fn stream_info(&self) -> EngineResult<StreamInfo>;

    /// Fetch the frame announced by [`DecOutputCode::DecodedFrameAvailable`]
    fn decoded_frame(&mut self) -> EngineResult<DecodedFrameDescriptor>;

    /// Give a framebuffer back after its content was consumed
    fn return_framebuffer(&mut self, framebuffer: DmaHandle) -> EngineResult<()>;

    /// Arm the dedicated output framebuffer for the next frame
    fn set_output_framebuffer(
        &mut self,
        framebuffer: DmaHandle,
        context: FrameContext,
    ) -> EngineResult<()>;

    /// Details of the frame announced by [`DecOutputCode::FrameSkipped`]
    fn skipped_frame_info(&mut self) -> EngineResult<SkippedFrameInfo>;

    /// Close the instance; every later call fails
    fn close(&mut self) -> EngineResult<()>;
}

/// Factory of decoder instances
pub trait DecodeBackend {
    /// Backend identifier for logging
    fn name(&self) -> &'static str;

    /// Static capabilities
    fn global_info(&self) -> DecGlobalInfo;

    /// Open an instance that uses `stream_buffer` for bitstream staging
    fn open(
        &self,
        params: &DecOpenParams,
        stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn DecodeEngine>>;
}
