//! Loopback decode engine

use std::sync::Arc;

use enumflags2::BitFlags;
use tracing::{debug, info, trace};

use super::{framebuffer_layout, FrameHeader, HEADER_LEN, PADDING_BYTE};
use crate::config::LoopbackConfig;
use crate::dma::{DmaAllocator, DmaHandle, DmaMapping, MapFlag};
use crate::engine::{
    DecCapability, DecGlobalInfo, DecOpenFlag, DecOpenParams, DecOutputCode, DecodeBackend,
    DecodeEngine, DecodedFrameDescriptor, EncodedUnit, EngineResult, FrameContext,
    FramebufferSink, SkipReason, SkippedFrameInfo, StreamInfo,
};
use crate::error::EngineCode;
use crate::image::{ImagePlane, PixelFormat, PlanarImage};
use crate::transfer;

/// Factory of [`LoopbackDecoder`] instances
pub struct LoopbackDecodeBackend {
    allocator: Arc<dyn DmaAllocator>,
    config: LoopbackConfig,
}

impl LoopbackDecodeBackend {
    pub fn new(allocator: Arc<dyn DmaAllocator>, config: LoopbackConfig) -> Self {
        Self { allocator, config }
    }
}

impl DecodeBackend for LoopbackDecodeBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn global_info(&self) -> DecGlobalInfo {
        let mut flags: BitFlags<DecCapability> = DecCapability::SemiPlanarOutput.into();
        if self.config.frames_from_pool {
            flags |= DecCapability::DecodedFramesFromPool;
        }
        DecGlobalInfo {
            flags,
            min_stream_buffer_size: self.config.stream_buffer_size,
            stream_buffer_alignment: self.config.framebuffer_alignment,
        }
    }

    fn open(
        &self,
        params: &DecOpenParams,
        stream_buffer: DmaHandle,
    ) -> EngineResult<Box<dyn DecodeEngine>> {
        if !params.flags.contains(DecOpenFlag::UseSemiPlanarColorFormat) {
            return Err(EngineCode::InvalidParams);
        }
        if stream_buffer.size() < self.config.stream_buffer_size {
            return Err(EngineCode::InvalidParams);
        }

        info!(
            "Loopback decoder opened: {} {}x{}, {} output",
            params.compression_format,
            params.frame_width,
            params.frame_height,
            if self.config.frames_from_pool {
                "pool"
            } else {
                "dedicated"
            }
        );

        Ok(Box::new(LoopbackDecoder {
            allocator: Arc::clone(&self.allocator),
            config: self.config.clone(),
            params: params.clone(),
            stream_buffer,
            pending: None,
            stream_info: None,
            pool: Vec::new(),
            output: None,
            outstanding_output: None,
            decoded: None,
            skipped: None,
            drain: false,
            closed: false,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingUnit {
    len: usize,
    pts: u64,
    dts: u64,
    context: FrameContext,
}

#[derive(Debug)]
struct PoolSlot {
    handle: DmaHandle,
    context: FrameContext,
    in_use: bool,
}

/// Software decoder instance
pub struct LoopbackDecoder {
    allocator: Arc<dyn DmaAllocator>,
    config: LoopbackConfig,
    params: DecOpenParams,
    stream_buffer: DmaHandle,
    pending: Option<PendingUnit>,
    stream_info: Option<StreamInfo>,
    pool: Vec<PoolSlot>,
    output: Option<(DmaHandle, FrameContext)>,
    outstanding_output: Option<DmaHandle>,
    decoded: Option<DecodedFrameDescriptor>,
    skipped: Option<SkippedFrameInfo>,
    drain: bool,
    closed: bool,
}

impl LoopbackDecoder {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineCode::InvalidCall)
        } else {
            Ok(())
        }
    }

    fn stream_info_for(&self, width: u32, height: u32) -> StreamInfo {
        let (metrics, size) = framebuffer_layout(&self.config, PixelFormat::Nv12, width, height);
        StreamInfo {
            min_framebuffer_count: self.config.min_framebuffers,
            framebuffer_size: size,
            framebuffer_alignment: self.config.framebuffer_alignment,
            output_framebuffer_size: size,
            output_framebuffer_alignment: self.config.framebuffer_alignment,
            metrics,
            color_format: PixelFormat::Nv12,
            fps_num: 0,
            fps_den: 1,
        }
    }

    /// Parse the pending unit's header, or the reason to skip it
    fn inspect(&self, unit: &PendingUnit) -> EngineResult<Result<FrameHeader, SkipReason>> {
        let mapping = DmaMapping::new(&*self.allocator, self.stream_buffer, MapFlag::Read.into())
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let data = &mapping.as_slice()[..unit.len];

        let Some(header) = FrameHeader::parse(data) else {
            return Ok(Err(SkipReason::CorruptFrame));
        };
        if header.compression_format != self.params.compression_format
            || header.frame_len() > data.len()
        {
            return Ok(Err(SkipReason::CorruptFrame));
        }
        if header.pixel_format != PixelFormat::Yuv420p {
            return Ok(Err(SkipReason::Internal));
        }
        Ok(Ok(header))
    }

    fn skip(&mut self, unit: PendingUnit, reason: SkipReason) -> DecOutputCode {
        debug!("Skipping input unit {}: {:?}", unit.context, reason);
        self.pending = None;
        self.skipped = Some(SkippedFrameInfo {
            reason,
            context: unit.context,
            pts: unit.pts,
            dts: unit.dts,
        });
        DecOutputCode::FrameSkipped
    }

    /// Choose the framebuffer the next frame goes into
    fn take_target(&mut self) -> Option<(DmaHandle, FrameContext)> {
        if self.config.frames_from_pool {
            let slot = self.pool.iter_mut().find(|slot| !slot.in_use)?;
            slot.in_use = true;
            Some((slot.handle, slot.context))
        } else {
            self.output.take()
        }
    }

    /// Unpack the pending unit's planes into `target` as NV12
    fn write_frame(
        &self,
        header: &FrameHeader,
        info: &StreamInfo,
        target: DmaHandle,
    ) -> EngineResult<()> {
        let source = DmaMapping::new(&*self.allocator, self.stream_buffer, MapFlag::Read.into())
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let payload = &source.as_slice()[HEADER_LEN..header.frame_len()];

        let luma_len = header.width as usize * header.height as usize;
        let chroma_width = PixelFormat::Yuv420p.chroma_width(header.width) as usize;
        let chroma_len = chroma_width * PixelFormat::Yuv420p.chroma_height(header.height) as usize;
        let image = PlanarImage {
            format: PixelFormat::Yuv420p,
            width: header.width,
            height: header.height,
            planes: [
                ImagePlane {
                    data: payload[..luma_len].to_vec(),
                    stride: header.width as usize,
                },
                ImagePlane {
                    data: payload[luma_len..luma_len + chroma_len].to_vec(),
                    stride: chroma_width,
                },
                ImagePlane {
                    data: payload[luma_len + chroma_len..].to_vec(),
                    stride: chroma_width,
                },
            ],
        };

        let mut mapping = DmaMapping::new(&*self.allocator, target, MapFlag::Write.into())
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let dst = mapping
            .as_mut_slice()
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        dst.fill(PADDING_BYTE);
        transfer::write_frame(&image, &info.metrics, info.color_format, dst)
            .map_err(|_| EngineCode::Error)?;

        trace!("Decoded {}x{} frame into {}", header.width, header.height, target);
        Ok(())
    }
}

impl FramebufferSink for LoopbackDecoder {
    fn add_framebuffers_to_pool(
        &mut self,
        framebuffers: &[DmaHandle],
        contexts: &[FrameContext],
    ) -> EngineResult<()> {
        self.ensure_open()?;
        if framebuffers.len() != contexts.len() {
            return Err(EngineCode::InvalidParams);
        }
        let info = self.stream_info.as_ref().ok_or(EngineCode::InvalidCall)?;
        if framebuffers.iter().any(|fb| fb.size() < info.framebuffer_size) {
            return Err(EngineCode::InvalidParams);
        }

        self.pool
            .extend(framebuffers.iter().zip(contexts).map(|(&handle, &context)| PoolSlot {
                handle,
                context,
                in_use: false,
            }));
        debug!("Loopback decoder pool now holds {} framebuffer(s)", self.pool.len());
        Ok(())
    }
}

impl DecodeEngine for LoopbackDecoder {
    fn push_encoded_frame(&mut self, unit: &EncodedUnit<'_>) -> EngineResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(EngineCode::InvalidCall);
        }
        if unit.data.len() > self.stream_buffer.size() {
            return Err(EngineCode::InvalidParams);
        }

        let mut mapping =
            DmaMapping::new(&*self.allocator, self.stream_buffer, MapFlag::Write.into())
                .map_err(|_| EngineCode::DmaMemoryAccess)?;
        let dst = mapping
            .as_mut_slice()
            .map_err(|_| EngineCode::DmaMemoryAccess)?;
        dst[..unit.data.len()].copy_from_slice(unit.data);

        self.pending = Some(PendingUnit {
            len: unit.data.len(),
            pts: unit.pts,
            dts: unit.dts,
            context: unit.context,
        });
        self.drain = false;
        Ok(())
    }

    fn flush(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.pending = None;
        self.decoded = None;
        self.skipped = None;
        self.outstanding_output = None;
        for slot in &mut self.pool {
            slot.in_use = false;
        }
        Ok(())
    }

    fn enable_drain_mode(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.drain = true;
        Ok(())
    }

    fn decode(&mut self) -> EngineResult<DecOutputCode> {
        self.ensure_open()?;
        if self.decoded.is_some() {
            return Ok(DecOutputCode::DecodedFrameAvailable);
        }

        let Some(unit) = self.pending else {
            return Ok(if self.drain {
                DecOutputCode::Eos
            } else {
                DecOutputCode::MoreInputDataNeeded
            });
        };

        let header = match self.inspect(&unit)? {
            Ok(header) => header,
            Err(reason) => return Ok(self.skip(unit, reason)),
        };

        let dimensions_changed = self.stream_info.as_ref().map_or(true, |info| {
            info.metrics.actual_width != header.width
                || info.metrics.actual_height != header.height
        });
        if dimensions_changed {
            self.stream_info = Some(self.stream_info_for(header.width, header.height));
            self.pool.clear();
            self.output = None;
            info!("Loopback decoder: new stream {}x{}", header.width, header.height);
            return Ok(DecOutputCode::NewStreamInfoAvailable);
        }

        let info = self.stream_info.clone().ok_or(EngineCode::Error)?;
        if self.pool.len() < info.min_framebuffer_count {
            return Ok(DecOutputCode::NeedAdditionalFramebuffer);
        }

        let Some((target, fb_context)) = self.take_target() else {
            if self.config.frames_from_pool {
                return Ok(DecOutputCode::NeedAdditionalFramebuffer);
            }
            return Err(EngineCode::InsufficientFramebuffers);
        };

        self.write_frame(&header, &info, target)?;

        if !self.config.frames_from_pool {
            self.outstanding_output = Some(target);
        }
        self.pending = None;
        self.decoded = Some(DecodedFrameDescriptor {
            framebuffer: target,
            fb_context,
            context: unit.context,
            pts: unit.pts,
            dts: unit.dts,
        });
        Ok(DecOutputCode::DecodedFrameAvailable)
    }

    fn stream_info(&self) -> EngineResult<StreamInfo> {
        self.ensure_open()?;
        self.stream_info.clone().ok_or(EngineCode::InvalidCall)
    }

    fn decoded_frame(&mut self) -> EngineResult<DecodedFrameDescriptor> {
        self.ensure_open()?;
        self.decoded.take().ok_or(EngineCode::InvalidCall)
    }

    fn return_framebuffer(&mut self, framebuffer: DmaHandle) -> EngineResult<()> {
        self.ensure_open()?;
        if let Some(slot) = self.pool.iter_mut().find(|slot| slot.handle == framebuffer) {
            slot.in_use = false;
            return Ok(());
        }
        if self.outstanding_output == Some(framebuffer) {
            self.outstanding_output = None;
            return Ok(());
        }
        Err(EngineCode::ContextMismatch)
    }

    fn set_output_framebuffer(
        &mut self,
        framebuffer: DmaHandle,
        context: FrameContext,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        if self.config.frames_from_pool {
            return Err(EngineCode::InvalidCall);
        }
        let info = self.stream_info.as_ref().ok_or(EngineCode::InvalidCall)?;
        if framebuffer.size() < info.output_framebuffer_size {
            return Err(EngineCode::InvalidParams);
        }
        trace!("Output framebuffer {} armed with {}", framebuffer, context);
        self.output = Some((framebuffer, context));
        Ok(())
    }

    fn skipped_frame_info(&mut self) -> EngineResult<SkippedFrameInfo> {
        self.ensure_open()?;
        self.skipped.take().ok_or(EngineCode::InvalidCall)
    }

    fn close(&mut self) -> EngineResult<()> {
        self.ensure_open()?;
        self.closed = true;
        self.pool.clear();
        self.output = None;
        debug!("Loopback decoder closed");
        Ok(())
    }
}
