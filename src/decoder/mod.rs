//! Decoder session
//!
//! A [`DecoderSession`] owns everything one hardware decode instance needs:
//! the engine handle, the bitstream staging buffer, the framebuffer pool and,
//! for engines that do not decode into pool framebuffers, one dedicated
//! output framebuffer.
//!
//! # Call model
//!
//! ```text
//! decode(packet) ──► push_encoded_frame ──► dispatcher loop ──► Option<DecodedFrame>
//!                      (flush + retry once      │
//!                       on InvalidCall)         ├─ new stream info ─► negotiation
//!                                               ├─ need framebuffer ─► pool.grow(1)
//!                                               └─ decoded frame ─► NV12 download
//! ```
//!
//! Frame reordering means output does not line up with input: a call may
//! yield no frame, and frames produced beyond the first are queued for
//! [`DecoderSession::receive_frame`]. An empty packet switches the engine to
//! drain mode.

mod dispatch;
mod negotiation;

use std::collections::VecDeque;
use std::sync::Arc;

use enumflags2::BitFlags;
use tracing::{debug, info, warn};

use crate::config::DecoderConfig;
use crate::dma::{DmaAllocator, DmaBuffer, DmaHandle};
use crate::engine::{
    DecGlobalInfo, DecOpenFlag, DecOpenParams, DecodeBackend, DecodeEngine, DispatchExit,
    EncodedUnit, FrameContext, StreamInfo,
};
use crate::error::{EngineCode, VpuError, VpuResult};
use crate::image::{DecodedFrame, PixelFormat};
use crate::pool::FramebufferPool;
use crate::stats::SessionStats;

/// Where the engine writes decoded frames, chosen at negotiation
#[derive(Debug)]
pub(crate) enum FrameDestination {
    /// Pool framebuffers
    Pool,
    /// One dedicated framebuffer, re-armed before every dispatcher run
    Dedicated(DmaBuffer),
}

/// Hardware decoder session
pub struct DecoderSession {
    config: DecoderConfig,
    backend: &'static str,
    global_info: DecGlobalInfo,
    engine: Option<Box<dyn DecodeEngine>>,
    allocator: Option<Arc<dyn DmaAllocator>>,
    stream_buffer: Option<DmaBuffer>,
    stream_info: Option<StreamInfo>,
    pool: FramebufferPool,
    destination: Option<FrameDestination>,
    /// Framebuffer context of the last decoded frame, used to re-arm the
    /// dedicated output
    last_context: FrameContext,
    input_sequence: u64,
    ready: VecDeque<DecodedFrame>,
    eos: bool,
    stats: SessionStats,
    closed: bool,
}

impl DecoderSession {
    /// Open a decoder on `backend`
    ///
    /// The requested pixel format and dimensions are checked before any
    /// hardware resource is created. If a later step fails, everything
    /// acquired so far is released before the error is returned.
    pub fn open(
        backend: &dyn DecodeBackend,
        allocator: Arc<dyn DmaAllocator>,
        config: &DecoderConfig,
    ) -> VpuResult<Self> {
        if config.pixel_format != PixelFormat::Yuv420p {
            return Err(VpuError::UnsupportedFormat(format!(
                "decoder output {} requested, only yuv420p is supported",
                config.pixel_format
            )));
        }
        if config.width == 0 || config.height == 0 {
            return Err(VpuError::InvalidDimensions {
                width: config.width,
                height: config.height,
                reason: "dimensions must be non-zero".to_string(),
            });
        }

        let global_info = backend.global_info();
        info!(
            "Opening {} decoder on '{}': {}x{}, frames from pool: {}",
            config.compression_format,
            backend.name(),
            config.width,
            config.height,
            global_info.frames_from_pool()
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
            destination: None,
            last_context: FrameContext::UNSET,
            input_sequence: 0,
            ready: VecDeque::new(),
            eos: false,
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

        let mut flags: BitFlags<DecOpenFlag> = DecOpenFlag::UseSemiPlanarColorFormat.into();
        if config.frame_reordering {
            flags |= DecOpenFlag::EnableFrameReordering;
        }
        let params = DecOpenParams {
            compression_format: config.compression_format,
            flags,
            frame_width: config.width,
            frame_height: config.height,
        };

        let engine = backend
            .open(&params, stream_handle)
            .map_err(|code| VpuError::engine("open decoder", code))?;
        session.engine = Some(engine);

        debug!(
            "Decoder staging buffer: {} (alignment {})",
            stream_handle, session.global_info.stream_buffer_alignment
        );
        Ok(session)
    }

    /// Decode one encoded packet
    ///
    /// Returns the first frame the engine produced for this call, if any.
    /// An empty `data` slice requests a drain of the frames still held by
    /// the engine.
    pub fn decode(&mut self, data: &[u8], pts: u64, dts: u64) -> VpuResult<Option<DecodedFrame>> {
        if self.closed {
            return Err(VpuError::SessionClosed);
        }

        if data.is_empty() {
            debug!("Empty packet, switching decoder to drain mode");
            self.engine_mut()?
                .enable_drain_mode()
                .map_err(|code| VpuError::engine("enable drain mode", code))?;
        } else {
            let unit = EncodedUnit {
                data,
                pts,
                dts,
                context: FrameContext::from_raw(self.input_sequence),
            };
            self.push(&unit)?;
            self.input_sequence += 1;
            self.stats.record_input();
            self.eos = false;
        }

        if let DispatchExit::EndOfStream = self.run_dispatcher()? {
            self.eos = true;
        }
        Ok(self.ready.pop_front())
    }

    /// Next queued frame, without feeding input
    pub fn receive_frame(&mut self) -> Option<DecodedFrame> {
        self.ready.pop_front()
    }

    /// Drop queued input and frames, keeping the negotiated stream
    pub fn flush(&mut self) -> VpuResult<()> {
        if self.closed {
            return Err(VpuError::SessionClosed);
        }
        self.engine_mut()?
            .flush()
            .map_err(|code| VpuError::engine("flush", code))?;
        let dropped = self.ready.len();
        self.ready.clear();
        self.eos = false;
        debug!("Decoder flushed, {} queued frame(s) dropped", dropped);
        Ok(())
    }

    /// Push with the single flush-and-retry on `InvalidCall`
    fn push(&mut self, unit: &EncodedUnit<'_>) -> VpuResult<()> {
        let engine = self.engine_mut()?;
        match engine.push_encoded_frame(unit) {
            Ok(()) => Ok(()),
            Err(EngineCode::InvalidCall) => {
                debug!("Engine refused push of pts {}, flushing and retrying", unit.pts);
                if let Err(code) = engine.flush() {
                    warn!("Decoder flush before retry failed: {}", code);
                }
                engine
                    .push_encoded_frame(unit)
                    .map_err(|code| VpuError::engine("push encoded frame", code))
            }
            Err(code) => Err(VpuError::engine("push encoded frame", code)),
        }
    }

    fn engine_mut(&mut self) -> VpuResult<&mut (dyn DecodeEngine + 'static)> {
        self.engine.as_deref_mut().ok_or(VpuError::SessionClosed)
    }

    /// Latest negotiated stream parameters
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn global_info(&self) -> &DecGlobalInfo {
        &self.global_info
    }

    pub fn pool(&self) -> &FramebufferPool {
        &self.pool
    }

    /// Dedicated output framebuffer, when the engine does not decode into the pool
    pub fn output_framebuffer(&self) -> Option<DmaHandle> {
        match &self.destination {
            Some(FrameDestination::Dedicated(buffer)) => Some(buffer.handle()),
            _ => None,
        }
    }

    /// Context of the last decoded frame, [`FrameContext::UNSET`] before the first
    pub fn last_context(&self) -> FrameContext {
        self.last_context
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Whether the engine reported end of stream since the last input
    pub fn at_end_of_stream(&self) -> bool {
        self.eos
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
                warn!("Decoder engine close failed: {}", code);
            }
        }
        self.pool.reset();
        self.stream_buffer = None;
        self.destination = None;
        self.allocator = None;
        self.ready.clear();

        info!("Decoder closed: {}", self.stats.summary());
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.close();
    }
}
