//! Pixel transfer between framebuffers and host images
//!
//! Framebuffer layouts come from the engine's [`FramebufferMetrics`]: every
//! plane has its own byte offset and row stride, and strides may be larger
//! than the logical row width. Host images use their own strides
//! ([`PlanarImage`]) or contiguous rows ([`Nv12Image`]).
//!
//! The slice functions ([`read_frame`], [`write_frame`]) do the copying; the
//! buffer functions ([`download_frame`], [`upload_frame`]) wrap them in a
//! scoped mapping that is released on every exit path.

use tracing::trace;

use crate::dma::{DmaBuffer, MapFlag};
use crate::engine::{FramebufferMetrics, StreamInfo};
use crate::error::{VpuError, VpuResult};
use crate::image::{ImagePlane, Nv12Image, PixelFormat, PlanarImage};

/// Check that `rows` rows of `width` bytes at `offset`/`stride` fit in `len`
fn check_plane(
    len: usize,
    offset: usize,
    stride: usize,
    width: usize,
    rows: usize,
    plane: &str,
) -> VpuResult<()> {
    if rows == 0 || width == 0 {
        return Ok(());
    }
    if stride < width {
        return Err(VpuError::InvalidFrame(format!(
            "{plane} stride {stride} is smaller than its row width {width}"
        )));
    }
    let end = stride
        .checked_mul(rows - 1)
        .and_then(|n| n.checked_add(width))
        .and_then(|n| n.checked_add(offset))
        .ok_or_else(|| VpuError::InvalidFrame(format!("{plane} layout overflows")))?;
    if end > len {
        return Err(VpuError::InvalidFrame(format!(
            "{plane} ends at byte {end}, framebuffer holds {len}"
        )));
    }
    Ok(())
}

fn check_dimensions(metrics: &FramebufferMetrics, width: u32, height: u32) -> VpuResult<()> {
    if metrics.actual_width != width || metrics.actual_height != height {
        return Err(VpuError::InvalidFrame(format!(
            "image is {}x{}, framebuffer holds {}x{}",
            width, height, metrics.actual_width, metrics.actual_height
        )));
    }
    Ok(())
}

/// Copy a frame from framebuffer bytes into an NV12 image
///
/// `format` is the framebuffer's color format: NV12 is copied row by row,
/// fully planar 4:2:0 is interleaved on the way.
pub fn read_frame(
    src: &[u8],
    metrics: &FramebufferMetrics,
    format: PixelFormat,
    dst: &mut Nv12Image,
) -> VpuResult<()> {
    check_dimensions(metrics, dst.width, dst.height)?;

    let width = dst.width as usize;
    let height = dst.height as usize;
    let chroma_width = PixelFormat::Nv12.chroma_width(dst.width) as usize;
    let chroma_rows = PixelFormat::Nv12.chroma_height(dst.height) as usize;
    let chroma_row_bytes = chroma_width * 2;

    if width == 0
        || height == 0
        || dst.luma.len() != width * height
        || dst.chroma.len() != chroma_row_bytes * chroma_rows
    {
        return Err(VpuError::InvalidFrame(format!(
            "NV12 destination planes do not match {}x{}",
            dst.width, dst.height
        )));
    }

    check_plane(src.len(), metrics.y_offset, metrics.y_stride, width, height, "luma plane")?;
    for (y, row) in dst.luma.chunks_exact_mut(width).enumerate() {
        let start = metrics.y_offset + y * metrics.y_stride;
        row.copy_from_slice(&src[start..start + width]);
    }
    trace!("Copied {} luma rows (stride {})", height, metrics.y_stride);

    match format {
        PixelFormat::Nv12 => {
            check_plane(
                src.len(),
                metrics.u_offset,
                metrics.uv_stride,
                chroma_row_bytes,
                chroma_rows,
                "chroma plane",
            )?;
            for (y, row) in dst.chroma.chunks_exact_mut(chroma_row_bytes).enumerate() {
                let start = metrics.u_offset + y * metrics.uv_stride;
                row.copy_from_slice(&src[start..start + chroma_row_bytes]);
            }
        }
        PixelFormat::Yuv420p => {
            for (offset, name) in [(metrics.u_offset, "U plane"), (metrics.v_offset, "V plane")] {
                check_plane(
                    src.len(),
                    offset,
                    metrics.uv_stride,
                    chroma_width,
                    chroma_rows,
                    name,
                )?;
            }
            for (y, row) in dst.chroma.chunks_exact_mut(chroma_row_bytes).enumerate() {
                let u_start = metrics.u_offset + y * metrics.uv_stride;
                let v_start = metrics.v_offset + y * metrics.uv_stride;
                let u = &src[u_start..u_start + chroma_width];
                let v = &src[v_start..v_start + chroma_width];
                for (pair, (&cb, &cr)) in row.chunks_exact_mut(2).zip(u.iter().zip(v)) {
                    pair[0] = cb;
                    pair[1] = cr;
                }
            }
        }
        other => {
            return Err(VpuError::UnsupportedFormat(format!(
                "cannot read {other} framebuffers into NV12"
            )))
        }
    }
    trace!("Copied {} chroma rows (stride {})", chroma_rows, metrics.uv_stride);

    Ok(())
}

fn write_plane(
    dst: &mut [u8],
    plane: &ImagePlane,
    width: usize,
    rows: usize,
    offset: usize,
    stride: usize,
) {
    for y in 0..rows {
        let start = offset + y * stride;
        dst[start..start + width].copy_from_slice(plane.row(y, width));
    }
}

/// Copy a planar host image into framebuffer bytes
///
/// `format` is the framebuffer's color format. It must equal the image
/// format, except that a 4:2:0 image may be written into an NV12 layout.
pub fn write_frame(
    image: &PlanarImage,
    metrics: &FramebufferMetrics,
    format: PixelFormat,
    dst: &mut [u8],
) -> VpuResult<()> {
    image.validate()?;
    check_dimensions(metrics, image.width, image.height)?;

    let (width, height) = image.plane_size(0);
    let (chroma_width, chroma_rows) = image.plane_size(1);

    check_plane(dst.len(), metrics.y_offset, metrics.y_stride, width, height, "luma plane")?;

    match (image.format, format) {
        (source, target) if source == target => {
            for (offset, name) in [(metrics.u_offset, "U plane"), (metrics.v_offset, "V plane")] {
                check_plane(
                    dst.len(),
                    offset,
                    metrics.uv_stride,
                    chroma_width,
                    chroma_rows,
                    name,
                )?;
            }
            write_plane(dst, &image.planes[0], width, height, metrics.y_offset, metrics.y_stride);
            write_plane(
                dst,
                &image.planes[1],
                chroma_width,
                chroma_rows,
                metrics.u_offset,
                metrics.uv_stride,
            );
            write_plane(
                dst,
                &image.planes[2],
                chroma_width,
                chroma_rows,
                metrics.v_offset,
                metrics.uv_stride,
            );
        }
        (PixelFormat::Yuv420p, PixelFormat::Nv12) => {
            check_plane(
                dst.len(),
                metrics.u_offset,
                metrics.uv_stride,
                chroma_width * 2,
                chroma_rows,
                "chroma plane",
            )?;
            write_plane(dst, &image.planes[0], width, height, metrics.y_offset, metrics.y_stride);
            for y in 0..chroma_rows {
                let start = metrics.u_offset + y * metrics.uv_stride;
                let row = &mut dst[start..start + chroma_width * 2];
                let u = image.planes[1].row(y, chroma_width);
                let v = image.planes[2].row(y, chroma_width);
                for (pair, (&cb, &cr)) in row.chunks_exact_mut(2).zip(u.iter().zip(v)) {
                    pair[0] = cb;
                    pair[1] = cr;
                }
            }
        }
        (source, target) => {
            return Err(VpuError::UnsupportedFormat(format!(
                "cannot write {source} images into {target} framebuffers"
            )))
        }
    }
    trace!(
        "Wrote {}x{} {} image (strides {}/{})",
        image.width,
        image.height,
        image.format,
        metrics.y_stride,
        metrics.uv_stride
    );

    Ok(())
}

/// Map a framebuffer for reading and copy its frame into `dst`
pub fn download_frame(
    framebuffer: &mut DmaBuffer,
    info: &StreamInfo,
    dst: &mut Nv12Image,
) -> VpuResult<()> {
    let mapping = framebuffer
        .map(MapFlag::Read.into())
        .map_err(VpuError::MapFailed)?;
    read_frame(mapping.as_slice(), &info.metrics, info.color_format, dst)
}

/// Map a framebuffer for writing and copy `image` into it
pub fn upload_frame(
    framebuffer: &mut DmaBuffer,
    info: &StreamInfo,
    image: &PlanarImage,
) -> VpuResult<()> {
    let mut mapping = framebuffer
        .map(MapFlag::Write.into())
        .map_err(VpuError::MapFailed)?;
    let dst = mapping.as_mut_slice().map_err(VpuError::MapFailed)?;
    write_frame(image, &info.metrics, info.color_format, dst)
}
