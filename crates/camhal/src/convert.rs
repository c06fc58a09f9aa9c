//! Software pixel conversion from the sensor layout to the consumer layout.
//!
//! Sources may carry row padding (`FormatDescriptor::stride`); outputs are
//! always tightly packed.

use crate::error::{CameraError, Result};
use crate::format::{FormatDescriptor, PixelFormat};
use common::span;

fn short(needed: usize, got: usize) -> CameraError {
    CameraError::DecodeFailed(format!("frame too short: need {needed} bytes, got {got}"))
}

fn check_even(width: u32, height: u32) -> Result<()> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(CameraError::DecodeFailed(format!(
            "4:2:0 output needs even dimensions, got {width}x{height}"
        )));
    }
    Ok(())
}

/// BT.601 fixed point, 8-bit fraction.
#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32) -> [u8; 3] {
    let rv = (359 * v) >> 8;
    let gu = (88 * u + 183 * v) >> 8;
    let bu = (454 * u) >> 8;
    [
        (y + rv).clamp(0, 255) as u8,
        (y - gu).clamp(0, 255) as u8,
        (y + bu).clamp(0, 255) as u8,
    ]
}

#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn rgb_to_uv(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// Copies `rows` rows of `row_bytes` from a strided source.
fn copy_rows(src: &[u8], stride: usize, row_bytes: usize, rows: usize, out: &mut Vec<u8>) -> Result<()> {
    let needed = stride * rows.saturating_sub(1) + row_bytes;
    if src.len() < needed {
        return Err(short(needed, src.len()));
    }
    if stride == row_bytes {
        out.extend_from_slice(&src[..row_bytes * rows]);
        return Ok(());
    }
    for row in 0..rows {
        out.extend_from_slice(&src[row * stride..row * stride + row_bytes]);
    }
    Ok(())
}

/// NV21 with padded rows to tight NV21.
pub fn nv21_realign(src: &[u8], stride: usize, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    out.clear();
    out.reserve(w * h * 3 / 2);
    copy_rows(src, stride, w, h, out)?;
    let chroma = src.get(stride * h..).unwrap_or(&[]);
    copy_rows(chroma, stride, w, h / 2, out)
}

/// YV12 with padded rows to tight YV12. Chroma planes use half the luma stride.
pub fn yv12_realign(src: &[u8], stride: usize, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    out.clear();
    out.reserve(w * h * 3 / 2);
    copy_rows(src, stride, w, h, out)?;
    let c_stride = stride / 2;
    let v_plane = src.get(stride * h..).unwrap_or(&[]);
    copy_rows(v_plane, c_stride, w / 2, h / 2, out)?;
    let u_plane = src.get(stride * h + c_stride * h / 2..).unwrap_or(&[]);
    copy_rows(u_plane, c_stride, w / 2, h / 2, out)
}

fn yuyv_rows(src: &[u8], stride: usize, width: u32, height: u32) -> Result<()> {
    let row_bytes = width as usize * 2;
    let needed = stride * (height as usize).saturating_sub(1) + row_bytes;
    if src.len() < needed {
        return Err(short(needed, src.len()));
    }
    Ok(())
}

/// Packed 4:2:2 to NV21, taking chroma from even rows.
pub fn yuyv_to_nv21(src: &[u8], stride: usize, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()> {
    check_even(width, height)?;
    yuyv_rows(src, stride, width, height)?;
    let (w, h) = (width as usize, height as usize);
    out.clear();
    out.resize(w * h * 3 / 2, 0);
    let (luma, chroma) = out.split_at_mut(w * h);

    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 2];
        let y_out = &mut luma[row * w..(row + 1) * w];
        for (px, y) in line.chunks_exact(2).zip(y_out.iter_mut()) {
            *y = px[0];
        }
        if row % 2 == 0 {
            let vu = &mut chroma[(row / 2) * w..(row / 2 + 1) * w];
            for (px, dst) in line.chunks_exact(4).zip(vu.chunks_exact_mut(2)) {
                dst[0] = px[3];
                dst[1] = px[1];
            }
        }
    }
    Ok(())
}

/// Packed 4:2:2 to planar YV12 (`Y`, then `V`, then `U`).
pub fn yuyv_to_yv12(src: &[u8], stride: usize, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()> {
    check_even(width, height)?;
    yuyv_rows(src, stride, width, height)?;
    let (w, h) = (width as usize, height as usize);
    let quarter = w * h / 4;
    out.clear();
    out.resize(w * h * 3 / 2, 0);
    let (luma, chroma) = out.split_at_mut(w * h);
    let (v_plane, u_plane) = chroma.split_at_mut(quarter);

    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 2];
        for (x, px) in line.chunks_exact(2).enumerate() {
            luma[row * w + x] = px[0];
        }
        if row % 2 == 0 {
            let base = (row / 2) * (w / 2);
            for (x, px) in line.chunks_exact(4).enumerate() {
                u_plane[base + x] = px[1];
                v_plane[base + x] = px[3];
            }
        }
    }
    Ok(())
}

pub fn yuyv_to_rgb24(src: &[u8], stride: usize, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()> {
    yuyv_rows(src, stride, width, height)?;
    let (w, h) = (width as usize, height as usize);
    out.clear();
    out.reserve(w * h * 3);
    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 2];
        for chunk in line.chunks_exact(4) {
            let y0 = chunk[0] as i32;
            let u = chunk[1] as i32 - 128;
            let y1 = chunk[2] as i32;
            let v = chunk[3] as i32 - 128;
            out.extend_from_slice(&yuv_to_rgb(y0, u, v));
            out.extend_from_slice(&yuv_to_rgb(y1, u, v));
        }
    }
    Ok(())
}

/// RGB24 to 4:2:0, averaging chroma over each 2x2 block.
pub fn rgb24_to_yuv420(
    rgb: &[u8],
    width: u32,
    height: u32,
    target: PixelFormat,
    out: &mut Vec<u8>,
) -> Result<()> {
    check_even(width, height)?;
    let (w, h) = (width as usize, height as usize);
    if rgb.len() < w * h * 3 {
        return Err(short(w * h * 3, rgb.len()));
    }
    out.clear();
    out.resize(w * h * 3 / 2, 0);
    let (luma, chroma) = out.split_at_mut(w * h);

    for (i, px) in rgb[..w * h * 3].chunks_exact(3).enumerate() {
        luma[i] = rgb_to_y(px[0] as i32, px[1] as i32, px[2] as i32);
    }

    let quarter = w * h / 4;
    for by in 0..h / 2 {
        for bx in 0..w / 2 {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let p = ((by * 2 + dy) * w + bx * 2 + dx) * 3;
                r += rgb[p] as i32;
                g += rgb[p + 1] as i32;
                b += rgb[p + 2] as i32;
            }
            let (u, v) = rgb_to_uv(r / 4, g / 4, b / 4);
            let c = by * (w / 2) + bx;
            match target {
                PixelFormat::Nv21 => {
                    chroma[c * 2] = v;
                    chroma[c * 2 + 1] = u;
                }
                PixelFormat::Nv12 => {
                    chroma[c * 2] = u;
                    chroma[c * 2 + 1] = v;
                }
                PixelFormat::Yv12 => {
                    chroma[c] = v;
                    chroma[quarter + c] = u;
                }
                PixelFormat::I420 => {
                    chroma[c] = u;
                    chroma[quarter + c] = v;
                }
                other => {
                    return Err(CameraError::DecodeFailed(format!(
                        "{other} is not a 4:2:0 layout"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Converts captured frames, holding the JPEG decompressor and scratch space
/// across frames.
pub struct FrameConverter {
    decompressor: turbojpeg::Decompressor,
    rgb_buffer: Vec<u8>,
}

impl FrameConverter {
    pub fn new() -> Result<Self> {
        let decompressor = turbojpeg::Decompressor::new()
            .map_err(|e| CameraError::DecodeFailed(format!("decompressor init: {e}")))?;
        Ok(Self {
            decompressor,
            rgb_buffer: Vec::new(),
        })
    }

    /// Pairs this converter can produce.
    pub fn supports(source: PixelFormat, target: PixelFormat) -> bool {
        use PixelFormat::*;
        matches!(
            (source, target),
            (Yuyv, Yuyv | Nv21 | Yv12 | Rgb24)
                | (Nv21, Nv21)
                | (Yv12, Yv12)
                | (Rgb24, Rgb24)
                | (Mjpeg, Nv21 | Nv12 | Yv12 | I420 | Rgb24)
        )
    }

    /// Decodes a JPEG into the internal RGB buffer. The JPEG must match the
    /// negotiated size.
    fn decode_jpeg(&mut self, jpeg: &[u8], width: u32, height: u32) -> Result<()> {
        let _s = span!("decode");
        let header = self
            .decompressor
            .read_header(jpeg)
            .map_err(|e| CameraError::DecodeFailed(e.to_string()))?;
        if header.width != width as usize || header.height != height as usize {
            return Err(CameraError::DecodeFailed(format!(
                "jpeg is {}x{}, expected {}x{}",
                header.width, header.height, width, height
            )));
        }
        let rgb_size = header.width * header.height * 3;
        if self.rgb_buffer.len() < rgb_size {
            self.rgb_buffer.resize(rgb_size, 0);
        }
        let output = turbojpeg::Image {
            pixels: &mut self.rgb_buffer[..rgb_size],
            width: header.width,
            pitch: header.width * 3,
            height: header.height,
            format: turbojpeg::PixelFormat::RGB,
        };
        self.decompressor
            .decompress(jpeg, output)
            .map_err(|e| CameraError::DecodeFailed(e.to_string()))
    }

    /// Converts `src` laid out as `layout` into `target`, replacing `out`.
    /// For compressed sources only `src[..bytes_used]` is read.
    pub fn convert_into(
        &mut self,
        src: &[u8],
        bytes_used: usize,
        layout: &FormatDescriptor,
        target: PixelFormat,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let (w, h) = (layout.width, layout.height);
        let stride = layout.stride as usize;
        match (layout.pixel_format, target) {
            (PixelFormat::Mjpeg, PixelFormat::Rgb24) => {
                let jpeg = &src[..bytes_used.min(src.len())];
                self.decode_jpeg(jpeg, w, h)?;
                out.clear();
                out.extend_from_slice(&self.rgb_buffer[..w as usize * h as usize * 3]);
                Ok(())
            }
            (PixelFormat::Mjpeg, target) if target.is_planar_420() => {
                let jpeg = &src[..bytes_used.min(src.len())];
                self.decode_jpeg(jpeg, w, h)?;
                let _s = span!("convert");
                rgb24_to_yuv420(&self.rgb_buffer, w, h, target, out)
            }
            (PixelFormat::Yuyv, PixelFormat::Yuyv) => {
                out.clear();
                copy_rows(src, stride, w as usize * 2, h as usize, out)
            }
            (PixelFormat::Rgb24, PixelFormat::Rgb24) => {
                out.clear();
                copy_rows(src, stride, w as usize * 3, h as usize, out)
            }
            (PixelFormat::Yuyv, PixelFormat::Nv21) => yuyv_to_nv21(src, stride, w, h, out),
            (PixelFormat::Yuyv, PixelFormat::Yv12) => yuyv_to_yv12(src, stride, w, h, out),
            (PixelFormat::Yuyv, PixelFormat::Rgb24) => yuyv_to_rgb24(src, stride, w, h, out),
            (PixelFormat::Nv21, PixelFormat::Nv21) => {
                let tight = PixelFormat::Nv21.frame_size(w, h);
                if src.len() == tight {
                    out.clear();
                    out.extend_from_slice(src);
                    return Ok(());
                }
                nv21_realign(src, stride, w, h, out)
            }
            (PixelFormat::Yv12, PixelFormat::Yv12) => yv12_realign(src, stride, w, h, out),
            (source, target) => Err(CameraError::DecodeFailed(format!(
                "no conversion from {source} to {target}"
            ))),
        }
    }

    pub fn convert(
        &mut self,
        src: &[u8],
        bytes_used: usize,
        layout: &FormatDescriptor,
        target: PixelFormat,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(target.frame_size(layout.width, layout.height));
        self.convert_into(src, bytes_used, layout, target, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_yuyv(width: u32, height: u32, stride: usize) -> Vec<u8> {
        let mut buf = vec![0xEE; stride * height as usize];
        for row in 0..height as usize {
            for px in buf[row * stride..row * stride + width as usize * 2].chunks_exact_mut(4) {
                px.copy_from_slice(&[100, 90, 110, 160]);
            }
        }
        buf
    }

    fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
        use image::{ImageEncoder, codecs::jpeg::JpegEncoder};
        let pixels = vec![128u8; (width * height * 3) as usize];
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .write_image(&pixels, width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        jpeg
    }

    #[test]
    fn test_yuyv_to_nv21() {
        let src = gray_yuyv(4, 2, 8);
        let mut out = Vec::new();
        yuyv_to_nv21(&src, 8, 4, 2, &mut out).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..8], &[100, 110, 100, 110, 100, 110, 100, 110]);
        assert_eq!(&out[8..], &[160, 90, 160, 90]);
    }

    #[test]
    fn test_yuyv_to_yv12_with_padding() {
        let src = gray_yuyv(4, 2, 12);
        let mut out = Vec::new();
        yuyv_to_yv12(&src, 12, 4, 2, &mut out).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[8..10], &[160, 160]);
        assert_eq!(&out[10..], &[90, 90]);
        assert!(!out.contains(&0xEE));
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_gray() {
        let src = vec![128u8; 8];
        let mut out = Vec::new();
        yuyv_to_rgb24(&src, 8, 4, 1, &mut out).unwrap();
        assert_eq!(out, vec![128u8; 12]);
    }

    #[test]
    fn test_nv21_realign_strips_padding() {
        let (w, h, stride) = (4u32, 2u32, 8usize);
        let mut src = vec![0xEE; stride * 3];
        src[..4].copy_from_slice(&[1, 2, 3, 4]);
        src[8..12].copy_from_slice(&[5, 6, 7, 8]);
        src[16..20].copy_from_slice(&[9, 10, 11, 12]);
        let mut out = Vec::new();
        nv21_realign(&src, stride, w, h, &mut out).unwrap();
        assert_eq!(out, (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_tight_nv21_is_copied() {
        let layout = FormatDescriptor::new(4, 2, PixelFormat::Nv21);
        let src: Vec<u8> = (0..12).collect();
        let mut conv = FrameConverter::new().unwrap();
        let out = conv.convert(&src, 12, &layout, PixelFormat::Nv21).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_short_source_rejected() {
        let layout = FormatDescriptor::new(640, 480, PixelFormat::Yuyv);
        let mut conv = FrameConverter::new().unwrap();
        let err = conv
            .convert(&[0u8; 100], 100, &layout, PixelFormat::Nv21)
            .unwrap_err();
        assert!(matches!(err, CameraError::DecodeFailed(_)));
    }

    #[test]
    fn test_mjpeg_to_nv21() {
        let jpeg = test_jpeg(64, 48);
        let layout = FormatDescriptor::new(64, 48, PixelFormat::Mjpeg);
        let mut buffer = jpeg.clone();
        buffer.resize(layout.size as usize, 0);

        let mut conv = FrameConverter::new().unwrap();
        let out = conv
            .convert(&buffer, jpeg.len(), &layout, PixelFormat::Nv21)
            .unwrap();
        assert_eq!(out.len(), 64 * 48 * 3 / 2);
        // Mid gray: luma near 126, chroma near neutral.
        assert!(out[0].abs_diff(126) < 6, "luma {}", out[0]);
        assert!(out[64 * 48].abs_diff(128) < 6);
    }

    #[test]
    fn test_mjpeg_size_mismatch_rejected() {
        let jpeg = test_jpeg(32, 32);
        let layout = FormatDescriptor::new(64, 48, PixelFormat::Mjpeg);
        let mut conv = FrameConverter::new().unwrap();
        assert!(conv.convert(&jpeg, jpeg.len(), &layout, PixelFormat::Yv12).is_err());
    }

    #[test]
    fn test_corrupt_mjpeg_rejected() {
        let layout = FormatDescriptor::new(64, 48, PixelFormat::Mjpeg);
        let mut conv = FrameConverter::new().unwrap();
        let err = conv
            .convert(&[0xFF, 0xD8, 0, 1, 2], 5, &layout, PixelFormat::Nv21)
            .unwrap_err();
        assert!(matches!(err, CameraError::DecodeFailed(_)));
    }

    #[test]
    fn test_supported_pairs() {
        assert!(FrameConverter::supports(PixelFormat::Mjpeg, PixelFormat::Yv12));
        assert!(FrameConverter::supports(PixelFormat::Yuyv, PixelFormat::Nv21));
        assert!(!FrameConverter::supports(PixelFormat::Nv21, PixelFormat::Yuyv));
    }
}
