//! Encode output event dispatcher

use bytes::Bytes;
use tracing::{debug, error, trace};

use super::EncoderSession;
use crate::engine::{DispatchExit, EncOutputCode, FrameType};
use crate::error::{EngineCode, VpuError, VpuResult};
use crate::image::EncodedPacket;
use crate::pool::FramebufferRequest;
use crate::stats::StepTimer;

impl EncoderSession {
    /// Step the engine until it wants more input or reaches end of stream
    pub(super) fn run_dispatcher(
        &mut self,
        packets: &mut Vec<EncodedPacket>,
    ) -> VpuResult<DispatchExit> {
        for _ in 0..self.config.max_steps_per_call {
            let timer = StepTimer::start();
            let (size, code) = self
                .engine_mut()?
                .encode()
                .map_err(|code| VpuError::engine("encode", code))?;
            self.stats.record_step(timer.elapsed_ms());

            match code {
                EncOutputCode::NoOutputYetAvailable => {
                    trace!("Encoder: no output yet");
                }
                EncOutputCode::Eos => {
                    debug!("Encoder: end of stream");
                    return Ok(DispatchExit::EndOfStream);
                }
                EncOutputCode::NeedAdditionalFramebuffer => {
                    self.grow_on_demand()?;
                }
                EncOutputCode::EncodedFrameAvailable => {
                    packets.push(self.take_encoded_frame(size)?);
                }
                EncOutputCode::MoreInputDataNeeded => {
                    trace!("Encoder: more input needed");
                    return Ok(DispatchExit::NeedMoreInput);
                }
                EncOutputCode::Other(raw) => {
                    error!("Encoder engine produced unknown output code {}", raw);
                    return Err(VpuError::ProtocolViolation {
                        direction: "encoder",
                        code: raw,
                    });
                }
            }
        }

        error!(
            "Encoder engine did not settle within {} steps",
            self.config.max_steps_per_call
        );
        Err(VpuError::engine("encode", EngineCode::Timeout))
    }

    /// Run the dispatcher until the engine reports end of stream
    ///
    /// A drained engine has no input left to ask for, so a request for more
    /// input ends the drain as well.
    pub(super) fn run_until_eos(&mut self, packets: &mut Vec<EncodedPacket>) -> VpuResult<()> {
        match self.run_dispatcher(packets)? {
            DispatchExit::EndOfStream => Ok(()),
            DispatchExit::NeedMoreInput => {
                debug!("Encoder asked for input while draining, treating as end of stream");
                Ok(())
            }
        }
    }

    fn grow_on_demand(&mut self) -> VpuResult<()> {
        let Some(info) = &self.stream_info else {
            return Err(VpuError::SessionClosed);
        };
        let request = FramebufferRequest::pool(info);
        debug!("Encoder: engine needs an additional framebuffer");

        let (Some(engine), Some(allocator)) = (self.engine.as_deref_mut(), &self.allocator)
        else {
            return Err(VpuError::SessionClosed);
        };
        self.pool.grow(allocator, engine, 1, request)?;
        self.stats.record_pool_growth(1);
        Ok(())
    }

    fn take_encoded_frame(&mut self, size: usize) -> VpuResult<EncodedPacket> {
        if self.output.len() < size {
            trace!("Growing encoder output buffer to {} bytes", size);
            self.output.resize(size, 0);
        }

        let engine = self.engine.as_deref_mut().ok_or(VpuError::SessionClosed)?;
        let info = engine
            .encoded_frame(&mut self.output)
            .map_err(|code| VpuError::engine("get encoded frame", code))?;
        if info.size > self.output.len() {
            return Err(VpuError::InvalidFrame(format!(
                "engine reported {} encoded bytes, buffer holds {}",
                info.size,
                self.output.len()
            )));
        }

        let is_keyframe = info.frame_type == FrameType::I;
        debug!(
            "Encoded frame pts {}: {} bytes, {:?}",
            info.pts, info.size, info.frame_type
        );
        self.stats.record_output(info.size, is_keyframe);

        Ok(EncodedPacket {
            data: Bytes::copy_from_slice(&self.output[..info.size]),
            pts: info.pts,
            dts: info.dts,
            is_keyframe,
        })
    }
}
