//! Decode output event dispatcher

use tracing::{debug, error, trace, warn};

use super::{DecoderSession, FrameDestination};
use crate::engine::{DecOutputCode, DispatchExit};
use crate::error::{EngineCode, VpuError, VpuResult};
use crate::image::{DecodedFrame, Nv12Image};
use crate::pool::FramebufferRequest;
use crate::stats::StepTimer;
use crate::transfer;

impl DecoderSession {
    /// Step the engine until it wants more input or reaches end of stream
    pub(super) fn run_dispatcher(&mut self) -> VpuResult<DispatchExit> {
        self.rearm_output()?;

        for _ in 0..self.config.max_steps_per_call {
            let timer = StepTimer::start();
            let code = self
                .engine_mut()?
                .decode()
                .map_err(|code| VpuError::engine("decode", code))?;
            self.stats.record_step(timer.elapsed_ms());

            match code {
                DecOutputCode::NoOutputYetAvailable => {
                    trace!("Decoder: no output yet");
                }
                DecOutputCode::Eos => {
                    debug!("Decoder: end of stream");
                    return Ok(DispatchExit::EndOfStream);
                }
                DecOutputCode::NewStreamInfoAvailable => {
                    self.negotiate()?;
                }
                DecOutputCode::NeedAdditionalFramebuffer => {
                    self.grow_on_demand(code.raw())?;
                }
                DecOutputCode::DecodedFrameAvailable => {
                    self.take_decoded_frame()?;
                    self.rearm_output()?;
                }
                DecOutputCode::FrameSkipped => {
                    self.report_skip()?;
                }
                DecOutputCode::MoreInputDataNeeded => {
                    trace!("Decoder: more input needed");
                    return Ok(DispatchExit::NeedMoreInput);
                }
                DecOutputCode::Other(raw) => {
                    error!("Decoder engine produced unknown output code {}", raw);
                    return Err(VpuError::ProtocolViolation {
                        direction: "decoder",
                        code: raw,
                    });
                }
            }
        }

        error!(
            "Decoder engine did not settle within {} steps",
            self.config.max_steps_per_call
        );
        Err(VpuError::engine("decode", EngineCode::Timeout))
    }

    /// Hand the dedicated output framebuffer back to the engine for the next frame
    fn rearm_output(&mut self) -> VpuResult<()> {
        let Some(FrameDestination::Dedicated(buffer)) = &self.destination else {
            return Ok(());
        };
        let handle = buffer.handle();
        let context = self.last_context;
        trace!("Re-arming output framebuffer {} with {}", handle, context);
        self.engine_mut()?
            .set_output_framebuffer(handle, context)
            .map_err(|code| VpuError::engine("set output framebuffer", code))
    }

    fn grow_on_demand(&mut self, raw: u32) -> VpuResult<()> {
        let Some(info) = &self.stream_info else {
            error!("Decoder engine asked for a framebuffer before any stream info");
            return Err(VpuError::ProtocolViolation {
                direction: "decoder",
                code: raw,
            });
        };
        let request = FramebufferRequest::pool(info);
        debug!("Decoder: engine needs an additional framebuffer");

        let (Some(engine), Some(allocator)) = (self.engine.as_deref_mut(), &self.allocator)
        else {
            return Err(VpuError::SessionClosed);
        };
        self.pool.grow(allocator, engine, 1, request)?;
        self.stats.record_pool_growth(1);
        Ok(())
    }

    /// Fetch the decoded frame, download it and give the framebuffer back
    fn take_decoded_frame(&mut self) -> VpuResult<()> {
        let engine = self.engine.as_deref_mut().ok_or(VpuError::SessionClosed)?;
        let descriptor = engine
            .decoded_frame()
            .map_err(|code| VpuError::engine("get decoded frame", code))?;
        self.last_context = descriptor.fb_context;

        let info = self.stream_info.as_ref().ok_or_else(|| {
            VpuError::InvalidFrame("decoded frame before any stream info".to_string())
        })?;

        let framebuffer = match &mut self.destination {
            Some(FrameDestination::Dedicated(buffer))
                if buffer.handle() == descriptor.framebuffer =>
            {
                Some(buffer)
            }
            _ => self.pool.get_mut(descriptor.framebuffer),
        };
        let Some(framebuffer) = framebuffer else {
            error!(
                "Engine returned unknown framebuffer {} ({})",
                descriptor.framebuffer, descriptor.fb_context
            );
            return Err(VpuError::engine(
                "get decoded frame",
                EngineCode::ContextMismatch,
            ));
        };

        let mut image = Nv12Image::new(info.metrics.actual_width, info.metrics.actual_height);
        let downloaded = transfer::download_frame(framebuffer, info, &mut image);

        let returned = engine.return_framebuffer(descriptor.framebuffer);
        downloaded?;
        returned.map_err(|code| VpuError::engine("return framebuffer", code))?;

        debug!(
            "Decoded frame pts {} from {} ({})",
            descriptor.pts, descriptor.framebuffer, descriptor.fb_context
        );
        self.stats.record_output(0, false);
        self.ready.push_back(DecodedFrame {
            image,
            pts: descriptor.pts,
            dts: descriptor.dts,
            context: descriptor.fb_context,
        });
        Ok(())
    }

    fn report_skip(&mut self) -> VpuResult<()> {
        let info = self
            .engine_mut()?
            .skipped_frame_info()
            .map_err(|code| VpuError::engine("get skipped frame info", code))?;
        warn!(
            "Decoder skipped frame pts {} dts {} ({}): {:?}",
            info.pts, info.dts, info.context, info.reason
        );
        self.stats.record_skip();
        Ok(())
    }
}
