//! Configuration management
//!
//! Handles loading and validation of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod types;

pub use types::{DecoderConfig, EncoderConfig, LoopbackConfig};

use crate::image::PixelFormat;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Decoder session configuration
    #[serde(default)]
    pub decoder: DecoderConfig,
    /// Encoder session configuration
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// Software loopback engine configuration
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_dimensions("decoder", self.decoder.width, self.decoder.height)?;
        validate_dimensions("encoder", self.encoder.width, self.encoder.height)?;

        if self.decoder.pixel_format != PixelFormat::Yuv420p {
            anyhow::bail!(
                "Unsupported decoder pixel format: {} (only yuv420p)",
                self.decoder.pixel_format
            );
        }

        match self.encoder.pixel_format {
            PixelFormat::Yuv420p
            | PixelFormat::Yuv422p
            | PixelFormat::Yuv444p
            | PixelFormat::Yuv411p => {}
            other => anyhow::bail!("Unsupported encoder pixel format: {}", other),
        }

        if self.encoder.fps_num == 0 || self.encoder.fps_den == 0 {
            anyhow::bail!(
                "Invalid frame rate: {}/{}",
                self.encoder.fps_num,
                self.encoder.fps_den
            );
        }

        if self.decoder.max_steps_per_call == 0 || self.encoder.max_steps_per_call == 0 {
            anyhow::bail!("max_steps_per_call must be at least 1");
        }

        if !self.loopback.stride_alignment.is_power_of_two() {
            anyhow::bail!(
                "stride_alignment ({}) must be a power of two",
                self.loopback.stride_alignment
            );
        }

        if !self.loopback.framebuffer_alignment.is_power_of_two() {
            anyhow::bail!(
                "framebuffer_alignment ({}) must be a power of two",
                self.loopback.framebuffer_alignment
            );
        }

        if self.loopback.min_framebuffers == 0 {
            anyhow::bail!("min_framebuffers must be at least 1");
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        width: Option<u32>,
        height: Option<u32>,
        no_pool_output: bool,
    ) -> Self {
        if let Some(width) = width {
            self.decoder.width = width;
            self.encoder.width = width;
        }
        if let Some(height) = height {
            self.decoder.height = height;
            self.encoder.height = height;
        }
        if no_pool_output {
            self.loopback.frames_from_pool = false;
        }

        self
    }
}

fn validate_dimensions(section: &str, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        anyhow::bail!("[{}] dimensions must be non-zero: {}x{}", section, width, height);
    }
    if width % 2 != 0 || height % 2 != 0 {
        anyhow::bail!("[{}] dimensions must be even: {}x{}", section, width, height);
    }
    Ok(())
}
