//! Scripted engines for session tests
//!
//! Each engine replays a queue of output codes and records every call it
//! receives. Engine state lives behind a shared handle so tests can keep
//! inspecting it after the session took ownership of the engine.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use enumflags2::BitFlags;
use parking_lot::Mutex;

use lamco_vpu::dma::{DmaAllocator, DmaHandle, DmaMapping, HeapAllocator, MapFlag};
use lamco_vpu::engine::{
    DecCapability, DecGlobalInfo, DecOpenParams, DecOutputCode, DecodeBackend, DecodeEngine,
    DecodedFrameDescriptor, EncGlobalInfo, EncOpenParams, EncOutputCode, EncodeBackend,
    EncodeEngine, EncodedFrameInfo, EncodedUnit, EngineResult, FrameContext, FrameType,
    FramebufferMetrics, FramebufferSink, RawFrameUnit, SkippedFrameInfo, StreamInfo,
};
use lamco_vpu::error::EngineCode;
use lamco_vpu::image::PixelFormat;

/// One recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    Push { pts: u64 },
    PushRaw { framebuffer: DmaHandle, pts: u64 },
    Flush,
    Drain,
    Step,
    StreamInfo,
    DecodedFrame,
    EncodedFrame { capacity: usize },
    Return(DmaHandle),
    SetOutput(DmaHandle, FrameContext),
    SkipInfo,
    AddPool(Vec<FrameContext>),
    Close,
}

/// Heap allocator shared by a test and the engines it drives
pub fn heap() -> (Arc<HeapAllocator>, Arc<dyn DmaAllocator>) {
    let heap = Arc::new(HeapAllocator::new());
    let allocator: Arc<dyn DmaAllocator> = heap.clone();
    (heap, allocator)
}

/// NV12 stream info whose rows are padded to `stride`
pub fn nv12_stream_info(width: u32, height: u32, stride: usize, min_count: usize) -> StreamInfo {
    let y_size = stride * height as usize;
    let uv_size = stride * (height as usize).div_ceil(2);
    let offset = 32;
    StreamInfo {
        min_framebuffer_count: min_count,
        framebuffer_size: offset + y_size + uv_size,
        framebuffer_alignment: 64,
        output_framebuffer_size: offset + y_size + uv_size,
        output_framebuffer_alignment: 64,
        metrics: FramebufferMetrics {
            actual_width: width,
            actual_height: height,
            y_stride: stride,
            uv_stride: stride,
            y_size,
            uv_size,
            y_offset: offset,
            u_offset: offset + y_size,
            v_offset: offset + y_size + 1,
        },
        color_format: PixelFormat::Nv12,
        fps_num: 30,
        fps_den: 1,
    }
}

/// Fully planar stream info with tight rows
pub fn planar_stream_info(
    format: PixelFormat,
    width: u32,
    height: u32,
    min_count: usize,
) -> StreamInfo {
    let y_size = width as usize * height as usize;
    let chroma_width = format.chroma_width(width) as usize;
    let uv_size = chroma_width * format.chroma_height(height) as usize;
    StreamInfo {
        min_framebuffer_count: min_count,
        framebuffer_size: y_size + 2 * uv_size,
        framebuffer_alignment: 16,
        output_framebuffer_size: 0,
        output_framebuffer_alignment: 1,
        metrics: FramebufferMetrics {
            actual_width: width,
            actual_height: height,
            y_stride: width as usize,
            uv_stride: chroma_width,
            y_size,
            uv_size,
            y_offset: 0,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        },
        color_format: format,
        fps_num: 30,
        fps_den: 1,
    }
}

/// Frame content the scripted decoder writes when asked for a decoded frame
#[derive(Debug, Clone)]
pub struct ScriptedFrame {
    pub luma: Vec<u8>,
    pub chroma: Vec<u8>,
    pub pts: u64,
    pub context: FrameContext,
    /// Framebuffer context reported for a dedicated output framebuffer,
    /// instead of the one it was armed with
    pub fb_context: Option<FrameContext>,
}

/// Observable state of a scripted decoder
pub struct DecoderState {
    pub allocator: Arc<dyn DmaAllocator>,
    pub global_info: DecGlobalInfo,
    pub open_result: EngineResult<()>,
    pub close_result: EngineResult<()>,
    /// Output codes, replayed in order
    pub codes: VecDeque<DecOutputCode>,
    /// Code returned once `codes` runs dry
    pub idle_code: DecOutputCode,
    /// Stream infos handed out, one per new-stream-info event
    pub stream_infos: VecDeque<StreamInfo>,
    pub current_info: Option<StreamInfo>,
    pub push_results: VecDeque<EngineResult<()>>,
    pub add_results: VecDeque<EngineResult<()>>,
    pub frames: VecDeque<ScriptedFrame>,
    pub skips: VecDeque<SkippedFrameInfo>,
    /// Registered pool framebuffers
    pub pool: Vec<(DmaHandle, FrameContext)>,
    pub output: Option<(DmaHandle, FrameContext)>,
    pub open_params: Option<DecOpenParams>,
    pub calls: Vec<Call>,
    next_slot: usize,
}

impl DecoderState {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.clone()
    }
}

pub type SharedDecoder = Arc<Mutex<DecoderState>>;

/// Backend opening [`ScriptedDecoder`]s over shared state
pub struct ScriptedDecodeBackend {
    pub state: SharedDecoder,
}

impl ScriptedDecodeBackend {
    pub fn new(allocator: Arc<dyn DmaAllocator>, frames_from_pool: bool) -> Self {
        let mut flags: BitFlags<DecCapability> = DecCapability::SemiPlanarOutput.into();
        if frames_from_pool {
            flags |= DecCapability::DecodedFramesFromPool;
        }
        let state = DecoderState {
            allocator,
            global_info: DecGlobalInfo {
                flags,
                min_stream_buffer_size: 4096,
                stream_buffer_alignment: 256,
            },
            open_result: Ok(()),
            close_result: Ok(()),
            codes: VecDeque::new(),
            idle_code: DecOutputCode::MoreInputDataNeeded,
            stream_infos: VecDeque::new(),
            current_info: None,
            push_results: VecDeque::new(),
            add_results: VecDeque::new(),
            frames: VecDeque::new(),
            skips: VecDeque::new(),
            pool: Vec::new(),
            output: None,
            open_params: None,
            calls: Vec::new(),
            next_slot: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue output codes
    pub fn script(&self, codes: impl IntoIterator<Item = DecOutputCode>) {
        self.state.lock().codes.extend(codes);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls()
    }
}

impl DecodeBackend for ScriptedDecodeBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn global_info(&self) -> DecGlobalInfo {
        self.state.lock().global_info.clone()
    }

    fn open(
        &self,
        params: &DecOpenParams,
        _stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn DecodeEngine>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Open);
        state.open_params = Some(params.clone());
        state.open_result?;
        Ok(Box::new(ScriptedDecoder {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct ScriptedDecoder {
    state: SharedDecoder,
}

/// Write an NV12 frame into a framebuffer per `metrics`
fn write_nv12(
    allocator: &dyn DmaAllocator,
    handle: DmaHandle,
    metrics: &FramebufferMetrics,
    frame: &ScriptedFrame,
) -> EngineResult<()> {
    let mut mapping = DmaMapping::new(allocator, handle, MapFlag::Write.into())
        .map_err(|_| EngineCode::DmaMemoryAccess)?;
    let dst = mapping
        .as_mut_slice()
        .map_err(|_| EngineCode::DmaMemoryAccess)?;
    dst.fill(0xEE);

    let width = metrics.actual_width as usize;
    let chroma_rows = (metrics.actual_height as usize).div_ceil(2);
    let chroma_bytes = width.div_ceil(2) * 2;
    for (y, row) in frame.luma.chunks_exact(width).enumerate() {
        let start = metrics.y_offset + y * metrics.y_stride;
        dst[start..start + width].copy_from_slice(row);
    }
    for (y, row) in frame.chroma.chunks_exact(chroma_bytes).take(chroma_rows).enumerate() {
        let start = metrics.u_offset + y * metrics.uv_stride;
        dst[start..start + chroma_bytes].copy_from_slice(row);
    }
    Ok(())
}

impl FramebufferSink for ScriptedDecoder {
    fn add_framebuffers_to_pool(
        &mut self,
        framebuffers: &[DmaHandle],
        contexts: &[FrameContext],
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::AddPool(contexts.to_vec()));
        if let Some(result) = state.add_results.pop_front() {
            result?;
        }
        state
            .pool
            .extend(framebuffers.iter().copied().zip(contexts.iter().copied()));
        Ok(())
    }
}

impl DecodeEngine for ScriptedDecoder {
    fn push_encoded_frame(&mut self, unit: &EncodedUnit<'_>) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Push { pts: unit.pts });
        state.push_results.pop_front().unwrap_or(Ok(()))
    }

    fn flush(&mut self) -> EngineResult<()> {
        self.state.lock().calls.push(Call::Flush);
        Ok(())
    }

    fn enable_drain_mode(&mut self) -> EngineResult<()> {
        self.state.lock().calls.push(Call::Drain);
        Ok(())
    }

    fn decode(&mut self) -> EngineResult<DecOutputCode> {
        let mut state = self.state.lock();
        state.calls.push(Call::Step);
        let code = state.codes.pop_front().unwrap_or(state.idle_code);
        if code == DecOutputCode::NewStreamInfoAvailable {
            state.current_info = state.stream_infos.pop_front();
            state.pool.clear();
            state.output = None;
        }
        Ok(code)
    }

    fn stream_info(&self) -> EngineResult<StreamInfo> {
        let mut state = self.state.lock();
        state.calls.push(Call::StreamInfo);
        state.current_info.clone().ok_or(EngineCode::InvalidCall)
    }

    fn decoded_frame(&mut self) -> EngineResult<DecodedFrameDescriptor> {
        let mut state = self.state.lock();
        state.calls.push(Call::DecodedFrame);
        let frame = state.frames.pop_front().ok_or(EngineCode::InvalidCall)?;
        let info = state.current_info.clone().ok_or(EngineCode::InvalidCall)?;

        let (framebuffer, fb_context) = match state.output.take() {
            Some((output, armed)) => (output, frame.fb_context.unwrap_or(armed)),
            None => {
                if state.pool.is_empty() {
                    return Err(EngineCode::InsufficientFramebuffers);
                }
                let slot = state.next_slot % state.pool.len();
                state.next_slot += 1;
                state.pool[slot]
            }
        };
        write_nv12(&*state.allocator, framebuffer, &info.metrics, &frame)?;

        Ok(DecodedFrameDescriptor {
            framebuffer,
            fb_context,
            context: frame.context,
            pts: frame.pts,
            dts: frame.pts,
        })
    }

    fn return_framebuffer(&mut self, framebuffer: DmaHandle) -> EngineResult<()> {
        self.state.lock().calls.push(Call::Return(framebuffer));
        Ok(())
    }

    fn set_output_framebuffer(
        &mut self,
        framebuffer: DmaHandle,
        context: FrameContext,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetOutput(framebuffer, context));
        state.output = Some((framebuffer, context));
        Ok(())
    }

    fn skipped_frame_info(&mut self) -> EngineResult<SkippedFrameInfo> {
        let mut state = self.state.lock();
        state.calls.push(Call::SkipInfo);
        state.skips.pop_front().ok_or(EngineCode::InvalidCall)
    }

    fn close(&mut self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Close);
        state.pool.clear();
        state.close_result
    }
}

/// Observable state of a scripted encoder
pub struct EncoderState {
    pub global_info: EncGlobalInfo,
    pub stream_info: StreamInfo,
    /// Step results, replayed in order
    pub codes: VecDeque<(usize, EncOutputCode)>,
    pub idle_code: EncOutputCode,
    pub frames: VecDeque<EncodedFrameInfo>,
    pub pool: Vec<(DmaHandle, FrameContext)>,
    pub open_params: Option<EncOpenParams>,
    pub calls: Vec<Call>,
}

pub type SharedEncoder = Arc<Mutex<EncoderState>>;

/// Backend opening [`ScriptedEncoder`]s over shared state
pub struct ScriptedEncodeBackend {
    pub state: SharedEncoder,
}

impl ScriptedEncodeBackend {
    pub fn new(stream_info: StreamInfo) -> Self {
        let state = EncoderState {
            global_info: EncGlobalInfo {
                min_stream_buffer_size: 4096,
                stream_buffer_alignment: 256,
                supported_color_formats: vec![
                    PixelFormat::Yuv420p,
                    PixelFormat::Yuv422p,
                    PixelFormat::Yuv444p,
                    PixelFormat::Yuv411p,
                ],
            },
            stream_info,
            codes: VecDeque::new(),
            idle_code: EncOutputCode::MoreInputDataNeeded,
            frames: VecDeque::new(),
            pool: Vec::new(),
            open_params: None,
            calls: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue step results
    pub fn script(&self, codes: impl IntoIterator<Item = (usize, EncOutputCode)>) {
        self.state.lock().codes.extend(codes);
    }

    /// Queue an encoded frame of `size` bytes; its data is `size` copies of `pts as u8`
    pub fn produce(&self, size: usize, pts: u64, frame_type: FrameType) {
        let mut state = self.state.lock();
        state.codes.push_back((size, EncOutputCode::EncodedFrameAvailable));
        state.frames.push_back(EncodedFrameInfo {
            size,
            frame_type,
            context: FrameContext::from_raw(pts),
            pts,
            dts: pts,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }
}

impl EncodeBackend for ScriptedEncodeBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn global_info(&self) -> EncGlobalInfo {
        self.state.lock().global_info.clone()
    }

    fn open(
        &self,
        params: &EncOpenParams,
        _stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn EncodeEngine>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Open);
        state.open_params = Some(params.clone());
        Ok(Box::new(ScriptedEncoder {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct ScriptedEncoder {
    state: SharedEncoder,
}

impl FramebufferSink for ScriptedEncoder {
    fn add_framebuffers_to_pool(
        &mut self,
        framebuffers: &[DmaHandle],
        contexts: &[FrameContext],
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::AddPool(contexts.to_vec()));
        state
            .pool
            .extend(framebuffers.iter().copied().zip(contexts.iter().copied()));
        Ok(())
    }
}

impl EncodeEngine for ScriptedEncoder {
    fn push_raw_frame(&mut self, frame: &RawFrameUnit) -> EngineResult<()> {
        self.state.lock().calls.push(Call::PushRaw {
            framebuffer: frame.framebuffer,
            pts: frame.pts,
        });
        Ok(())
    }

    fn encode(&mut self) -> EngineResult<(usize, EncOutputCode)> {
        let mut state = self.state.lock();
        state.calls.push(Call::Step);
        Ok(state.codes.pop_front().unwrap_or((0, state.idle_code)))
    }

    fn stream_info(&self) -> EngineResult<StreamInfo> {
        let mut state = self.state.lock();
        state.calls.push(Call::StreamInfo);
        Ok(state.stream_info.clone())
    }

    fn encoded_frame(&mut self, dst: &mut [u8]) -> EngineResult<EncodedFrameInfo> {
        let mut state = self.state.lock();
        state.calls.push(Call::EncodedFrame {
            capacity: dst.len(),
        });
        let info = state.frames.pop_front().ok_or(EngineCode::InvalidCall)?;
        if dst.len() < info.size {
            return Err(EngineCode::InvalidParams);
        }
        dst[..info.size].fill(info.pts as u8);
        Ok(info)
    }

    fn enable_drain_mode(&mut self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Drain);
        state.idle_code = EncOutputCode::Eos;
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Close);
        state.pool.clear();
        Ok(())
    }
}
