//! Stream negotiation
//!
//! Runs on every "new stream info" event. Each run fully replaces the
//! previous negotiated state: the pool is torn down and rebuilt at the new
//! minimum count, and the dedicated output framebuffer (if the engine uses
//! one) is reallocated at the new size.

use tracing::{error, info};

use super::{DecoderSession, FrameDestination};
use crate::dma::DmaBuffer;
use crate::error::{VpuError, VpuResult};
use crate::image::PixelFormat;
use crate::pool::FramebufferRequest;

impl DecoderSession {
    pub(super) fn negotiate(&mut self) -> VpuResult<()> {
        let (Some(engine), Some(allocator)) = (self.engine.as_deref_mut(), &self.allocator)
        else {
            return Err(VpuError::SessionClosed);
        };

        let info = engine
            .stream_info()
            .map_err(|code| VpuError::engine("get stream info", code))?;
        if !matches!(info.color_format, PixelFormat::Nv12 | PixelFormat::Yuv420p) {
            error!("Decoder engine negotiated {} output", info.color_format);
            return Err(VpuError::UnsupportedFormat(format!(
                "decoder framebuffers in {} cannot be downloaded",
                info.color_format
            )));
        }

        info!(
            "Decoder stream: {}x{} {}, {} framebuffer(s) of {} bytes, strides {}/{}",
            info.metrics.actual_width,
            info.metrics.actual_height,
            info.color_format,
            info.min_framebuffer_count,
            info.framebuffer_size,
            info.metrics.y_stride,
            info.metrics.uv_stride
        );

        self.pool.reset();
        self.destination = None;
        let pool_request = FramebufferRequest::pool(&info);
        let output_request = FramebufferRequest::output(&info);
        let min_count = info.min_framebuffer_count;
        self.stream_info = Some(info);
        self.stats.record_renegotiation();

        if let Err(e) = self.pool.grow(allocator, engine, min_count, pool_request) {
            error!("Could not build framebuffer pool of {}: {}", min_count, e);
            return Err(e);
        }
        self.stats.record_pool_growth(min_count);

        if self.global_info.frames_from_pool() {
            self.destination = Some(FrameDestination::Pool);
            return Ok(());
        }

        let output = DmaBuffer::allocate(allocator, output_request.size, output_request.alignment)
            .map_err(|source| VpuError::AllocationFailure {
                what: "output framebuffer",
                source,
            })?;
        engine
            .set_output_framebuffer(output.handle(), self.last_context)
            .map_err(|code| VpuError::engine("set output framebuffer", code))?;
        info!(
            "Decoder output framebuffer {} armed with {}",
            output.handle(),
            self.last_context
        );
        self.destination = Some(FrameDestination::Dedicated(output));
        Ok(())
    }
}
