//! lamco-vpu - VPU session loopback runner
//!
//! Entry point for the command-line binary. Runs an encoder session and a
//! decoder session back to back on the software loopback engines and
//! reports how the frames came through.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lamco_vpu::config::Config;
use lamco_vpu::dma::{DmaAllocator, HeapAllocator};
use lamco_vpu::image::{DecodedFrame, EncodedPacket, PixelFormat, PlanarImage};
use lamco_vpu::loopback::{LoopbackDecodeBackend, LoopbackEncodeBackend};
use lamco_vpu::{DecoderSession, EncoderSession};

/// Command-line arguments for lamco-vpu
#[derive(Parser, Debug)]
#[command(name = "lamco-vpu")]
#[command(version, about = "VPU codec session loopback runner", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LAMCO_VPU_CONFIG", default_value = "lamco-vpu.toml")]
    pub config: String,

    /// Number of synthetic frames to run through the loop
    #[arg(short, long, default_value = "30")]
    pub frames: u32,

    /// Frame width (overrides both sessions)
    #[arg(long, env = "LAMCO_VPU_WIDTH")]
    pub width: Option<u32>,

    /// Frame height (overrides both sessions)
    #[arg(long, env = "LAMCO_VPU_HEIGHT")]
    pub height: Option<u32>,

    /// Decode into a dedicated output framebuffer instead of the pool
    #[arg(long)]
    pub no_pool_output: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-vpu v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    let config = Config::load(&args.config).or_else(|e| {
        warn!("Failed to load config: {:#}, using defaults", e);
        Ok::<_, anyhow::Error>(Config::default_config())
    })?;
    let config = config.with_overrides(args.width, args.height, args.no_pool_output);
    config.validate().context("Invalid configuration")?;

    info!("Configuration loaded successfully");
    debug!("Config: {:?}", config);

    run_loopback(&config, args.frames)
}

/// Encode synthetic frames, decode the packets and compare the results
fn run_loopback(config: &Config, frame_count: u32) -> Result<()> {
    let heap = Arc::new(HeapAllocator::new());
    let allocator: Arc<dyn DmaAllocator> = heap.clone();

    let encode_backend = LoopbackEncodeBackend::new(allocator.clone(), config.loopback.clone());
    let decode_backend = LoopbackDecodeBackend::new(allocator.clone(), config.loopback.clone());

    let mut encoder = EncoderSession::open(&encode_backend, allocator.clone(), &config.encoder)
        .context("Failed to open encoder")?;
    let mut decoder = DecoderSession::open(&decode_backend, allocator, &config.decoder)
        .context("Failed to open decoder")?;

    let mut sources = Vec::with_capacity(frame_count as usize);
    let mut decoded = Vec::with_capacity(frame_count as usize);

    for index in 0..frame_count {
        let image = synthetic_frame(config, index)?;
        let pts = u64::from(index);
        let packets = encoder
            .encode(&image, pts, pts)
            .with_context(|| format!("Failed to encode frame {}", index))?;
        sources.push(image);
        decode_packets(&mut decoder, &packets, &mut decoded)?;
    }

    let packets = encoder.finish().context("Failed to drain encoder")?;
    decode_packets(&mut decoder, &packets, &mut decoded)?;

    if let Some(frame) = decoder.decode(&[], 0, 0).context("Failed to drain decoder")? {
        decoded.push(frame);
    }
    while let Some(frame) = decoder.receive_frame() {
        decoded.push(frame);
    }

    let mismatched = decoded
        .iter()
        .filter(|frame| {
            sources
                .get(frame.pts as usize)
                .map_or(true, |source| !frame_matches(source, frame))
        })
        .count();

    info!(
        "Loopback finished: {} frame(s) in, {} decoded, {} mismatched",
        frame_count,
        decoded.len(),
        mismatched
    );
    info!("Encoder: {}", encoder.stats().summary());
    info!("Decoder: {}", decoder.stats().summary());

    encoder.close();
    decoder.close();

    let heap_stats = heap.stats();
    info!(
        "DMA heap: {} allocation(s), {} release(s), {} live",
        heap_stats.allocations,
        heap_stats.deallocations,
        heap.live_buffers()
    );

    if mismatched > 0 {
        anyhow::bail!("{} decoded frame(s) did not match their source", mismatched);
    }
    Ok(())
}

fn decode_packets(
    decoder: &mut DecoderSession,
    packets: &[EncodedPacket],
    decoded: &mut Vec<DecodedFrame>,
) -> Result<()> {
    for packet in packets {
        if let Some(frame) = decoder
            .decode(&packet.data, packet.pts, packet.dts)
            .with_context(|| format!("Failed to decode packet pts {}", packet.pts))?
        {
            decoded.push(frame);
        }
        while let Some(frame) = decoder.receive_frame() {
            decoded.push(frame);
        }
    }
    Ok(())
}

/// Moving diagonal gradient with flat chroma
fn synthetic_frame(config: &Config, index: u32) -> Result<PlanarImage> {
    let encoder = &config.encoder;
    let mut image = PlanarImage::new(encoder.pixel_format, encoder.width, encoder.height)?;

    let (width, height) = image.plane_size(0);
    for y in 0..height {
        let row = image.planes[0].row_mut(y, width);
        for (x, sample) in row.iter_mut().enumerate() {
            *sample = (x + y + index as usize * 4) as u8;
        }
    }

    let (chroma_width, chroma_rows) = image.plane_size(1);
    for y in 0..chroma_rows {
        image.planes[1].row_mut(y, chroma_width).fill(96 + (index % 64) as u8);
        image.planes[2].row_mut(y, chroma_width).fill(160);
    }
    Ok(image)
}

/// Compare a decoded NV12 frame against its 4:2:0 source, luma and chroma
fn frame_matches(source: &PlanarImage, frame: &DecodedFrame) -> bool {
    let (width, height) = source.plane_size(0);
    if source.format != PixelFormat::Yuv420p
        || frame.image.width as usize != width
        || frame.image.height as usize != height
    {
        return false;
    }
    let luma_matches = (0..height).all(|y| {
        source.planes[0].row(y, width) == &frame.image.luma[y * width..(y + 1) * width]
    });

    let (chroma_width, chroma_rows) = source.plane_size(1);
    let row_bytes = frame.image.chroma_row_bytes();
    if row_bytes != chroma_width * 2 || frame.image.chroma.len() != row_bytes * chroma_rows {
        return false;
    }
    let chroma_matches = frame
        .image
        .chroma
        .chunks_exact(row_bytes)
        .enumerate()
        .all(|(y, row)| {
            let u = source.planes[1].row(y, chroma_width);
            let v = source.planes[2].row(y, chroma_width);
            row.chunks_exact(2)
                .zip(u.iter().zip(v))
                .all(|(pair, (&cb, &cr))| pair[0] == cb && pair[1] == cr)
        });

    luma_matches && chroma_matches
}

fn init_logging(args: &Args) -> Result<()> {
    use std::fs::File;

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_vpu={level},lamco_vpu::transfer=info,warn",
            level = log_level
        ))
    });

    // If log file is specified, write to both stdout and file
    if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path)
            .with_context(|| format!("Failed to create log file: {}", log_file_path))?;

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path);
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
        }
    }

    Ok(())
}
