//! Encoder session
//!
//! An [`EncoderSession`] stages each caller image into an input framebuffer,
//! pushes it to the engine and collects whatever encoded packets the engine
//! produces in response. [`EncoderSession::finish`] drains the engine at the
//! end of the stream.

mod dispatch;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EncoderConfig;
use crate::dma::{DmaAllocator, DmaBuffer};
use crate::engine::{
    EncGlobalInfo, EncodeBackend, EncodeEngine, FrameContext, RawFrameUnit, StreamInfo,
};
use crate::error::{VpuError, VpuResult};
use crate::image::{EncodedPacket, PixelFormat, PlanarImage};
use crate::pool::{FramebufferPool, FramebufferRequest};
use crate::stats::SessionStats;
use crate::transfer;

/// Hardware encoder session
pub struct EncoderSession {
    config: EncoderConfig,
    backend: &'static str,
    global_info: EncGlobalInfo,
    engine: Option<Box<dyn EncodeEngine>>,
    allocator: Option<Arc<dyn DmaAllocator>>,
    stream_buffer: Option<DmaBuffer>,
    stream_info: Option<StreamInfo>,
    pool: FramebufferPool,
    /// Framebuffer raw frames are staged in before each push
    input: Option<DmaBuffer>,
    /// Reusable output buffer; grows, never shrinks
    output: Vec<u8>,
    input_sequence: u64,
    finished: bool,
    stats: SessionStats,
    closed: bool,
}

impl EncoderSession {
    /// Open an encoder on `backend`
    ///
    /// Pixel format, dimensions and frame rate are checked before any
    /// hardware resource is created.
    pub fn open(
        backend: &dyn EncodeBackend,
        allocator: Arc<dyn DmaAllocator>,
        config: &EncoderConfig,
    ) -> VpuResult<Self> {
        let format = config.pixel_format;
        if !matches!(
            format,
            PixelFormat::Yuv420p
                | PixelFormat::Yuv422p
                | PixelFormat::Yuv444p
                | PixelFormat::Yuv411p
        ) {
            return Err(VpuError::UnsupportedFormat(format!(
                "encoder input {format} is not supported"
            )));
        }
        let global_info = backend.global_info();
        if !global_info.supported_color_formats.contains(&format) {
            return Err(VpuError::UnsupportedFormat(format!(
                "'{}' does not encode {format} input",
                backend.name()
            )));
        }
        if config.width == 0 || config.height == 0 {
            return Err(VpuError::InvalidDimensions {
                width: config.width,
                height: config.height,
                reason: "dimensions must be non-zero".to_string(),
            });
        }
        if config.fps_num == 0 || config.fps_den == 0 {
            return Err(VpuError::UnsupportedFormat(format!(
                "invalid frame rate {}/{}",
                config.fps_num, config.fps_den
            )));
        }

        let params = config.open_params();
        info!(
            "Opening {} encoder on '{}': {}x{} {} @ {}/{}, {}",
            config.compression_format,
            backend.name(),
            config.width,
            config.height,
            format,
            config.fps_num,
            config.fps_den,
            match params.quantization {
                Some(q) => format!("quantization {q}"),
                None => format!("{} kbps", params.bitrate_kbps),
            }
        );

        let mut session = Self {
            config: config.clone(),
            backend: backend.name(),
            global_info,
            engine: None,
            allocator: Some(Arc::clone(&allocator)),
            stream_buffer: None,
            stream_info: None,
            pool: FramebufferPool::new(),
            input: None,
            output: Vec::new(),
            input_sequence: 0,
            finished: false,
            stats: SessionStats::new(backend.name()),
            closed: false,
        };

        let stream_buffer = DmaBuffer::allocate(
            &allocator,
            session.global_info.min_stream_buffer_size,
            session.global_info.stream_buffer_alignment,
        )
        .map_err(|source| VpuError::AllocationFailure {
            what: "bitstream staging buffer",
            source,
        })?;
        let stream_handle = stream_buffer.handle();
        session.stream_buffer = Some(stream_buffer);

        let engine = session.engine.insert(
            backend
                .open(&params, stream_handle)
                .map_err(|code| VpuError::engine("open encoder", code))?,
        );

        let info = engine
            .stream_info()
            .map_err(|code| VpuError::engine("get stream info", code))?;
        debug!(
            "Encoder stream: {} framebuffer(s) of {} bytes, strides {}/{}",
            info.min_framebuffer_count,
            info.framebuffer_size,
            info.metrics.y_stride,
            info.metrics.uv_stride
        );

        let request = FramebufferRequest::pool(&info);
        session
            .pool
            .grow(&allocator, &mut **engine, info.min_framebuffer_count, request)?;
        session.stats.record_pool_growth(info.min_framebuffer_count);

        let input = DmaBuffer::allocate(&allocator, request.size, request.alignment).map_err(
            |source| VpuError::AllocationFailure {
                what: "input framebuffer",
                source,
            },
        )?;
        session.input = Some(input);
        session.stream_info = Some(info);

        Ok(session)
    }

    /// Encode one raw image
    ///
    /// Returns the packets the engine produced in response, possibly none.
    /// An image that does not match the configured format or dimensions is
    /// rejected with [`VpuError::InvalidFrame`] and leaves the session usable.
    pub fn encode(
        &mut self,
        image: &PlanarImage,
        pts: u64,
        dts: u64,
    ) -> VpuResult<Vec<EncodedPacket>> {
        if self.closed {
            return Err(VpuError::SessionClosed);
        }
        if self.finished {
            return Err(VpuError::InvalidFrame(
                "encoder was already finished".to_string(),
            ));
        }
        if image.format != self.config.pixel_format {
            return Err(VpuError::InvalidFrame(format!(
                "image is {}, encoder expects {}",
                image.format, self.config.pixel_format
            )));
        }
        if image.width != self.config.width || image.height != self.config.height {
            return Err(VpuError::InvalidFrame(format!(
                "image is {}x{}, encoder expects {}x{}",
                image.width, image.height, self.config.width, self.config.height
            )));
        }
        image.validate()?;

        let (Some(input), Some(info)) = (self.input.as_mut(), &self.stream_info) else {
            return Err(VpuError::SessionClosed);
        };
        transfer::upload_frame(input, info, image)?;

        let frame = RawFrameUnit {
            framebuffer: input.handle(),
            context: FrameContext::from_raw(self.input_sequence),
            pts,
            dts,
        };
        self.engine_mut()?
            .push_raw_frame(&frame)
            .map_err(|code| VpuError::engine("push raw frame", code))?;
        self.input_sequence += 1;
        self.stats.record_input();

        let mut packets = Vec::new();
        self.run_dispatcher(&mut packets)?;
        Ok(packets)
    }

    /// Drain the engine and return the remaining packets
    pub fn finish(&mut self) -> VpuResult<Vec<EncodedPacket>> {
        if self.closed {
            return Err(VpuError::SessionClosed);
        }
        let mut packets = Vec::new();
        if self.finished {
            return Ok(packets);
        }

        debug!("Draining encoder");
        self.engine_mut()?
            .enable_drain_mode()
            .map_err(|code| VpuError::engine("enable drain mode", code))?;
        self.run_until_eos(&mut packets)?;
        self.finished = true;
        info!("Encoder drained, {} packet(s) flushed", packets.len());
        Ok(packets)
    }

    fn engine_mut(&mut self) -> VpuResult<&mut (dyn EncodeEngine + 'static)> {
        self.engine.as_deref_mut().ok_or(VpuError::SessionClosed)
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn global_info(&self) -> &EncGlobalInfo {
        &self.global_info
    }

    pub fn pool(&self) -> &FramebufferPool {
        &self.pool
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Capacity of the reusable output buffer
    pub fn output_capacity(&self) -> usize {
        self.output.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the engine and release every buffer
    ///
    /// Every step is attempted even if an earlier one fails. Calling this
    /// more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut engine) = self.engine.take() {
            if let Err(code) = engine.close() {
                warn!("Encoder engine close failed: {}", code);
            }
        }
        self.pool.reset();
        self.stream_buffer = None;
        self.input = None;
        self.allocator = None;

        info!("Encoder closed: {}", self.stats.summary());
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.close();
    }
}
