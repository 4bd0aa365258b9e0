//! Loopback encode engine

use std::sync::Arc;

use tracing::{debug, info, trace};

use super::{framebuffer_layout, FrameHeader, HEADER_LEN};
use crate::config::LoopbackConfig;
use crate::dma::{DmaAllocator, DmaHandle, DmaMapping, MapFlag};
use crate::engine::{
    EncGlobalInfo, EncOpenParams, EncOutputCode, EncodeBackend, EncodeEngine, EncodedFrameInfo,
    EngineResult, FrameContext, FrameType, FramebufferMetrics, FramebufferSink, RawFrameUnit,
    StreamInfo,
};
use crate::error::EngineCode;
use crate::image::PixelFormat;

/// Factory of [`LoopbackEncoder`] instances
pub struct LoopbackEncodeBackend {
    allocator: Arc<dyn DmaAllocator>,
    config: LoopbackConfig,
}

impl LoopbackEncodeBackend {
    pub fn new(allocator: Arc<dyn DmaAllocator>, config: LoopbackConfig) -> Self {
        Self { allocator, config }
    }
}

impl EncodeBackend for LoopbackEncodeBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn global_info(&self) -> EncGlobalInfo {
        EncGlobalInfo {
            min_stream_buffer_size: self.config.stream_buffer_size,
            stream_buffer_alignment: self.config.framebuffer_alignment,
            supported_color_formats: vec![
                PixelFormat::Yuv420p,
                PixelFormat::Yuv422p,
                PixelFormat::Yuv444p,
                PixelFormat::Yuv411p,
                PixelFormat::P010,
            ],
        }
    }

    fn open(
        &self,
        params: &EncOpenParams,
        stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn EncodeEngine>> {
        let format = params.color_format;
        if format.is_semi_planar() || format.bytes_per_sample() != 1 {
            return Err(EngineCode::InvalidParams);
        }
        if params.frame_width == 0 || params.frame_height == 0 || params.fps_den == 0 {
            return Err(EngineCode::InvalidParams);
        }
        if stream_buffer.size() < self.config.stream_buffer_size {
            return Err(EngineCode::InvalidParams);
        }

        let (metrics, size) =
            framebuffer_layout(&self.config, format, params.frame_width, params.frame_height);
        let stream_info = StreamInfo {
            min_framebuffer_count: self.config.min_framebuffers,
            framebuffer_size: size,
            framebuffer_alignment: self.config.framebuffer_alignment,
            output_framebuffer_size: 0,
            output_framebuffer_alignment: 1,
            metrics,
            color_format: format,
            fps_num: params.fps_num,
            fps_den: params.fps_den,
        };

        match params.quantization {
            Some(q) => debug!("Loopback encoder: constant quantization {}", q),
            None => debug!("Loopback encoder: target bitrate {} kbps", params.bitrate_kbps),
        }
        info!(
            "Loopback encoder opened: {} {} {}x{} @ {}/{}",
            params.compression_format,
            format,
            params.frame_width,
            params.frame_height,
            params.fps_num,
            params.fps_den
        );

        Ok(Box::new(LoopbackEncoder {
            allocator: Arc::clone(&self.allocator),
            params: params.clone(),
            stream_buffer,
            stream_info,
            pool: Vec::new(),
            pending: None,
            encoded: None,
            frame_index: 0,
            drain: false,
            closed: false,
        }))
    }
}

/// Software encoder instance
pub struct LoopbackEncoder {
    allocator: Arc<dyn DmaAllocator>,
    params: EncOpenParams,
    stream_buffer: DmaHandle,
    stream_info: StreamInfo,
    pool: Vec<(DmaHandle, FrameContext)>,
    pending: Option<RawFrameUnit>,
    encoded: Option<EncodedFrameInfo>,
    frame_index: u64,
    drain: bool,
    closed: bool,
}

/// Append `rows` rows of `width` bytes at `offset`/`stride` to `dst`
fn pack_plane(
    dst: &mut [u8],
    src: &[u8],
    offset: usize,
    stride: usize,
    width: usize,
    rows: usize,
) -> usize {
    for y in 0..rows {
        let start = offset + y * stride;
        dst[y * width..(y + 1) * width].copy_from_slice(&src[start..start + width]);
    }
    width * rows
}

impl LoopbackEncoder {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineCode::InvalidCall)
        } else {
            Ok(())
        }
    }

    fn is_keyframe(&self) -> bool {
        match self.params.gop_size {
            0 => self.frame_index == 0,
            gop => self.frame_index % u64::from(gop) == 0,
        }
    }

    /// Pack the raw frame into the stream buffer, returning the frame size
    fn compress(&self, frame: &RawFrameUnit, keyframe: bool) -> EngineResult<usize> {
        let format = self.stream_info.color_format;
        let FramebufferMetrics {
            actual_width,
            actual_height,
            y_stride,
            uv_stride,
            y_offset,
            u_offset,
            v_offset,
            ..
        } = self.stream_info.metrics;

        let header = FrameHeader {
            compression_format: self.params.compression_format,
            pixel_format: format,
            keyframe,
            width: actual_width,
            height: actual_height,
        };
        if header.frame_len() > self.stream_buffer.size() {
            return Err(EngineCode::Error);
        }

        let source = DmaMapping::new(&*self.allocator, frame.framebuffer, MapFlag::Read.into())
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let mut stream =
            DmaMapping::new(&*self.allocator, self.stream_buffer, MapFlag::Write.into())
                .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let dst = stream
            .as_mut_slice()
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let src = source.as_slice();

        header.write(dst);
        let width = actual_width as usize;
        let height = actual_height as usize;
        let chroma_width = format.chroma_width(actual_width) as usize;
        let chroma_rows = format.chroma_height(actual_height) as usize;

        let mut at = HEADER_LEN;
        at += pack_plane(&mut dst[at..], src, y_offset, y_stride, width, height);
        at += pack_plane(&mut dst[at..], src, u_offset, uv_stride, chroma_width, chroma_rows);
        at += pack_plane(&mut dst[at..], src, v_offset, uv_stride, chroma_width, chroma_rows);

        trace!("Encoded frame {} into {} bytes", self.frame_index, at);
        Ok(at)
    }
}

impl FramebufferSink for LoopbackEncoder {
    fn add_framebuffers_to_pool(
        &mut self,
        framebuffers: &[DmaHandle],
        contexts: &[FrameContext],
    ) -> EngineResult<()> {
        self.ensure_open()?;
        if framebuffers.len() != contexts.len() {
            return Err(EngineCode::InvalidParams);
        }
        if framebuffers
            .iter()
            .any(|fb| fb.size() < self.stream_info.framebuffer_size)
        {
            return Err(EngineCode::InvalidParams);
        }
        self.pool
            .extend(framebuffers.iter().copied().zip(contexts.iter().copied()));
        Ok(())
    }
}

impl EncodeEngine for LoopbackEncoder {
    fn push_raw_frame(&mut self, frame: &RawFrameUnit) -> EngineResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(EngineCode::InvalidCall);
        }
        if frame.framebuffer.size() < self.stream_info.framebuffer_size {
            return Err(EngineCode::InvalidParams);
        }
        self.pending = Some(*frame);
        self.drain = false;
        Ok(())
    }

    fn encode(&mut self) -> EngineResult<(usize, EncOutputCode)> {
        self.ensure_open()?;
        if let Some(info) = &self.encoded {
            return Ok((info.size, EncOutputCode::EncodedFrameAvailable));
        }
        if self.pool.len() < self.stream_info.min_framebuffer_count {
            return Ok((0, EncOutputCode::NeedAdditionalFramebuffer));
        }

        let Some(frame) = self.pending else {
            let code = if self.drain {
                EncOutputCode::Eos
            } else {
                EncOutputCode::MoreInputDataNeeded
            };
            return Ok((0, code));
        };

        let keyframe = self.is_keyframe();
        let size = self.compress(&frame, keyframe)?;

        self.pending = None;
        self.frame_index += 1;
        self.encoded = Some(EncodedFrameInfo {
            size,
            frame_type: if keyframe { FrameType::I } else { FrameType::P },
            context: frame.context,
            pts: frame.pts,
            dts: frame.dts,
        });
        Ok((size, EncOutputCode::EncodedFrameAvailable))
    }

    fn stream_info(&self) -> EngineResult<StreamInfo> {
        self.ensure_open()?;
        Ok(self.stream_info.clone())
    }

    fn encoded_frame(&mut self, dst: &mut [u8]) -> EngineResult<EncodedFrameInfo> {
        self.ensure_open()?;
        let info = self.encoded.ok_or(EngineCode::InvalidCall)?;
        if dst.len() < info.size {
            return Err(EngineCode::InvalidParams);
        }

        let stream = DmaMapping::new(&*self.allocator, self.stream_buffer, MapFlag::Read.into())
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        dst[..info.size].copy_from_slice(&stream.as_slice()[..info.size]);

        self.encoded = None;
        Ok(info)
    }

    fn enable_drain_mode(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.drain = true;
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.closed = true;
        self.pool.clear();
        debug!("Loopback encoder closed after {} frame(s)", self.frame_index);
        Ok(())
    }
}
