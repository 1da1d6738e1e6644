//! Plane-level operations shared by the raw-video stages.
//!
//! Drawing itself happens on `image` buffers; this module moves pixels
//! between those and the four raw layouts, and fills and blits planes
//! directly. YUV colors use BT.601 limited range; chroma of 4:2:0 layouts is
//! averaged over each 2x2 block when converting from RGB.

use anyhow::Context;
use image::{Rgba, RgbaImage};
use livemix_pipeline_core::{PixelFormat, VideoFrame, VideoFrameMut};

/// An opaque RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn gray(level: u8) -> Self {
        Self::new(level, level, level)
    }

    pub fn to_yuv(self) -> (u8, u8, u8) {
        let (r, g, b) = (i32::from(self.r), i32::from(self.g), i32::from(self.b));
        let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
        let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
        let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
        (clamp(y), clamp(u), clamp(v))
    }

    pub fn from_yuv(y: u8, u: u8, v: u8) -> Self {
        let c = i32::from(y) - 16;
        let d = i32::from(u) - 128;
        let e = i32::from(v) - 128;
        Self {
            r: clamp((298 * c + 409 * e + 128) >> 8),
            g: clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
            b: clamp((298 * c + 516 * d + 128) >> 8),
        }
    }
}

impl From<Rgb> for Rgba<u8> {
    fn from(c: Rgb) -> Self {
        Rgba([c.r, c.g, c.b, 255])
    }
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Sampling of one plane: horizontal and vertical subsampling, bytes per
/// sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneSampling {
    sub_x: i64,
    sub_y: i64,
    bytes: usize,
}

fn sampling(format: PixelFormat) -> &'static [PlaneSampling] {
    const LUMA: PlaneSampling = PlaneSampling { sub_x: 1, sub_y: 1, bytes: 1 };
    const CHROMA: PlaneSampling = PlaneSampling { sub_x: 2, sub_y: 2, bytes: 1 };
    const CHROMA_PAIR: PlaneSampling = PlaneSampling { sub_x: 2, sub_y: 2, bytes: 2 };
    const PACKED: PlaneSampling = PlaneSampling { sub_x: 1, sub_y: 1, bytes: 4 };
    match format {
        PixelFormat::I420 => &[LUMA, CHROMA, CHROMA],
        PixelFormat::Nv12 => &[LUMA, CHROMA_PAIR],
        PixelFormat::Rgba | PixelFormat::Bgra => &[PACKED],
    }
}

/// Per-plane sample values of a color in `format`.
fn plane_values(format: PixelFormat, color: Rgb) -> Vec<Vec<u8>> {
    let (y, u, v) = color.to_yuv();
    match format {
        PixelFormat::I420 => vec![vec![y], vec![u], vec![v]],
        PixelFormat::Nv12 => vec![vec![y], vec![u, v]],
        PixelFormat::Rgba => vec![vec![color.r, color.g, color.b, 255]],
        PixelFormat::Bgra => vec![vec![color.b, color.g, color.r, 255]],
    }
}

/// The visible part of a `width` x `height` rectangle placed at `(x, y)`
/// inside a `bound_w` x `bound_h` area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clip {
    /// First visible column and row of the rectangle.
    pub src_x: usize,
    pub src_y: usize,
    /// Where that column and row land in the area.
    pub dst_x: usize,
    pub dst_y: usize,
    pub width: usize,
    pub height: usize,
}

/// Clip a rectangle against an area. `None` when nothing is visible.
pub fn clip(x: i64, y: i64, width: usize, height: usize, bound_w: usize, bound_h: usize) -> Option<Clip> {
    let (src_x, dst_x, w) = clip_axis(x, width, bound_w)?;
    let (src_y, dst_y, h) = clip_axis(y, height, bound_h)?;
    Some(Clip {
        src_x,
        src_y,
        dst_x,
        dst_y,
        width: w,
        height: h,
    })
}

fn clip_axis(pos: i64, len: usize, bound: usize) -> Option<(usize, usize, usize)> {
    let start = pos.max(0);
    let end = pos.saturating_add(len as i64).min(bound as i64);
    if end <= start {
        return None;
    }
    Some(((start - pos) as usize, start as usize, (end - start) as usize))
}

fn div_floor(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

fn div_ceil(a: i64, b: i64) -> i64 {
    -(-a).div_euclid(b)
}

/// Fill a rectangle with a color. Parts outside the frame are clipped.
pub fn fill_rect(frame: &mut VideoFrameMut, x: i64, y: i64, width: u32, height: u32, color: Rgb) {
    let layouts = frame.planes();
    let values = plane_values(frame.format, color);
    for ((layout, s), value) in layouts.iter().zip(sampling(frame.format)).zip(values) {
        let plane_w = layout.stride / s.bytes;
        // Any sample touched by the rectangle is painted.
        let x0 = div_floor(x, s.sub_x);
        let y0 = div_floor(y, s.sub_y);
        let x1 = div_ceil(x + i64::from(width), s.sub_x);
        let y1 = div_ceil(y + i64::from(height), s.sub_y);
        let Some(c) = clip(
            x0,
            y0,
            (x1 - x0).max(0) as usize,
            (y1 - y0).max(0) as usize,
            plane_w,
            layout.rows,
        ) else {
            continue;
        };
        for row in c.dst_y..c.dst_y + c.height {
            let start = layout.offset + row * layout.stride + c.dst_x * s.bytes;
            let span = &mut frame.data[start..start + c.width * s.bytes];
            for sample in span.chunks_exact_mut(s.bytes) {
                sample.copy_from_slice(&value);
            }
        }
    }
}

/// Fill the whole frame with a color.
pub fn fill(frame: &mut VideoFrameMut, color: Rgb) {
    let (w, h) = (frame.width, frame.height);
    fill_rect(frame, 0, 0, w, h, color);
}

/// Copy `src` onto `dst` with its top-left corner at `(x, y)`, clipping
/// whatever falls outside `dst`. Both frames must share a pixel layout.
pub fn blit(dst: &mut VideoFrameMut, src: &VideoFrame, x: i64, y: i64) -> anyhow::Result<()> {
    anyhow::ensure!(
        dst.format == src.format,
        "cannot blit {} onto {}",
        src.format,
        dst.format
    );
    let dst_layouts = dst.planes();
    let src_layouts = src.planes();
    for ((d, sl), s) in dst_layouts.iter().zip(&src_layouts).zip(sampling(dst.format)) {
        // Chroma of an odd offset lands on the sample to its upper left.
        let px = div_floor(x, s.sub_x);
        let py = div_floor(y, s.sub_y);
        let Some(c) = clip(px, py, sl.stride / s.bytes, sl.rows, d.stride / s.bytes, d.rows) else {
            continue;
        };
        let row_bytes = c.width * s.bytes;
        for row in 0..c.height {
            let from = sl.offset + (c.src_y + row) * sl.stride + c.src_x * s.bytes;
            let to = d.offset + (c.dst_y + row) * d.stride + c.dst_x * s.bytes;
            dst.data[to..to + row_bytes].copy_from_slice(&src.data[from..from + row_bytes]);
        }
    }
    Ok(())
}

/// Pack an image into `format`.
pub fn encode_image(image: &RgbaImage, format: PixelFormat) -> VideoFrameMut {
    encode_rgba(image.as_raw(), image.width(), image.height(), format)
}

/// Unpack any raw frame into an image.
pub fn decode_image(frame: &VideoFrame) -> anyhow::Result<RgbaImage> {
    RgbaImage::from_raw(frame.width, frame.height, decode_rgba(frame))
        .with_context(|| format!("{}x{} frame is truncated", frame.width, frame.height))
}

/// Copy the `width` x `height` region of `frame` at `(x, y)` into an image.
/// Pixels past the frame edge come out black.
pub fn crop_image(frame: &VideoFrame, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |px, py| {
        pixel_at(frame, x + px, y + py).unwrap_or(Rgb::BLACK).into()
    })
}

fn encode_rgba(rgba: &[u8], width: u32, height: u32, format: PixelFormat) -> VideoFrameMut {
    let mut frame = VideoFrameMut::zeroed(format, width, height);
    let (w, h) = (width as usize, height as usize);
    let pixel = |px: usize, py: usize| {
        let i = (py * w + px) * 4;
        Rgb::new(rgba[i], rgba[i + 1], rgba[i + 2])
    };
    match format {
        PixelFormat::Rgba => frame.data.copy_from_slice(&rgba[..w * h * 4]),
        PixelFormat::Bgra => {
            for (dst, src) in frame.data.chunks_exact_mut(4).zip(rgba.chunks_exact(4)) {
                dst.copy_from_slice(&[src[2], src[1], src[0], src[3]]);
            }
        }
        PixelFormat::I420 | PixelFormat::Nv12 => {
            let planes = frame.planes();
            for py in 0..h {
                for px in 0..w {
                    frame.data[py * w + px] = pixel(px, py).to_yuv().0;
                }
            }
            let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
            for cy in 0..ch {
                for cx in 0..cw {
                    let (mut u_sum, mut v_sum, mut n) = (0u32, 0u32, 0u32);
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let (px, py) = (cx * 2 + dx, cy * 2 + dy);
                        if px < w && py < h {
                            let (_, u, v) = pixel(px, py).to_yuv();
                            u_sum += u32::from(u);
                            v_sum += u32::from(v);
                            n += 1;
                        }
                    }
                    let (u, v) = ((u_sum / n) as u8, (v_sum / n) as u8);
                    if format == PixelFormat::I420 {
                        frame.data[planes[1].offset + cy * cw + cx] = u;
                        frame.data[planes[2].offset + cy * cw + cx] = v;
                    } else {
                        let at = planes[1].offset + cy * cw * 2 + cx * 2;
                        frame.data[at] = u;
                        frame.data[at + 1] = v;
                    }
                }
            }
        }
    }
    frame
}

fn decode_rgba(frame: &VideoFrame) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    match frame.format {
        PixelFormat::Rgba => frame.data.to_vec(),
        PixelFormat::Bgra => frame
            .data
            .chunks_exact(4)
            .flat_map(|p| [p[2], p[1], p[0], p[3]])
            .collect(),
        PixelFormat::I420 | PixelFormat::Nv12 => {
            let planes = frame.planes();
            let cw = w.div_ceil(2);
            let mut out = Vec::with_capacity(w * h * 4);
            for py in 0..h {
                for px in 0..w {
                    let y = frame.data[py * w + px];
                    let (cx, cy) = (px / 2, py / 2);
                    let (u, v) = if frame.format == PixelFormat::I420 {
                        (
                            frame.data[planes[1].offset + cy * cw + cx],
                            frame.data[planes[2].offset + cy * cw + cx],
                        )
                    } else {
                        let at = planes[1].offset + cy * cw * 2 + cx * 2;
                        (frame.data[at], frame.data[at + 1])
                    };
                    let c = Rgb::from_yuv(y, u, v);
                    out.extend_from_slice(&[c.r, c.g, c.b, 255]);
                }
            }
            out
        }
    }
}

/// Re-pack a frame into another layout of the same size.
pub fn convert(frame: &VideoFrame, format: PixelFormat) -> VideoFrame {
    if frame.format == format {
        return frame.clone();
    }
    encode_rgba(&decode_rgba(frame), frame.width, frame.height, format).freeze()
}

/// Color of the pixel at `(x, y)`, for inspection.
pub fn pixel_at(frame: &VideoFrame, x: u32, y: u32) -> Option<Rgb> {
    if x >= frame.width || y >= frame.height {
        return None;
    }
    let (w, px, py) = (frame.width as usize, x as usize, y as usize);
    let planes = frame.planes();
    let data = &frame.data;
    Some(match frame.format {
        PixelFormat::Rgba => {
            let i = (py * w + px) * 4;
            Rgb::new(data[i], data[i + 1], data[i + 2])
        }
        PixelFormat::Bgra => {
            let i = (py * w + px) * 4;
            Rgb::new(data[i + 2], data[i + 1], data[i])
        }
        PixelFormat::I420 => {
            let cw = w.div_ceil(2);
            let c = (py / 2) * cw + px / 2;
            Rgb::from_yuv(
                data[py * w + px],
                data[planes[1].offset + c],
                data[planes[2].offset + c],
            )
        }
        PixelFormat::Nv12 => {
            let cw = w.div_ceil(2);
            let at = planes[1].offset + (py / 2) * cw * 2 + (px / 2) * 2;
            Rgb::from_yuv(data[py * w + px], data[at], data[at + 1])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Rgb, b: Rgb) -> bool {
        let d = |x: u8, y: u8| (i32::from(x) - i32::from(y)).abs();
        d(a.r, b.r) <= 3 && d(a.g, b.g) <= 3 && d(a.b, b.b) <= 3
    }

    #[test]
    fn test_yuv_round_trip_is_close() {
        for color in [Rgb::BLACK, Rgb::WHITE, Rgb::RED, Rgb::GREEN, Rgb::BLUE, Rgb::gray(128)] {
            let (y, u, v) = color.to_yuv();
            assert!(close(Rgb::from_yuv(y, u, v), color), "{color:?}");
        }
        assert_eq!(Rgb::BLACK.to_yuv(), (16, 128, 128));
        assert_eq!(Rgb::WHITE.to_yuv().0, 235);
    }

    #[test]
    fn test_clip_inside_partial_and_outside() {
        assert_eq!(
            clip(10, 20, 5, 5, 100, 100),
            Some(Clip { src_x: 0, src_y: 0, dst_x: 10, dst_y: 20, width: 5, height: 5 })
        );
        assert_eq!(
            clip(-3, 98, 5, 5, 100, 100),
            Some(Clip { src_x: 3, src_y: 0, dst_x: 0, dst_y: 98, width: 2, height: 2 })
        );
        assert_eq!(clip(640, 0, 640, 360, 640, 360), None);
        assert_eq!(clip(-640, 0, 640, 360, 640, 360), None);
    }

    #[test]
    fn test_fill_rect_clips_at_edges() {
        for format in PixelFormat::ALL {
            let mut frame = VideoFrameMut::zeroed(format, 8, 8);
            fill(&mut frame, Rgb::BLACK);
            fill_rect(&mut frame, 6, -2, 10, 4, Rgb::WHITE);
            let frame = frame.freeze();
            assert!(close(pixel_at(&frame, 7, 0).unwrap(), Rgb::WHITE), "{format}");
            assert!(close(pixel_at(&frame, 7, 1).unwrap(), Rgb::WHITE), "{format}");
            assert!(close(pixel_at(&frame, 0, 0).unwrap(), Rgb::BLACK), "{format}");
            assert!(close(pixel_at(&frame, 7, 4).unwrap(), Rgb::BLACK), "{format}");
        }
    }

    #[test]
    fn test_blit_with_negative_offset() {
        let mut src = VideoFrameMut::zeroed(PixelFormat::Rgba, 4, 4);
        fill(&mut src, Rgb::RED);
        let src = src.freeze();
        let mut dst = VideoFrameMut::zeroed(PixelFormat::Rgba, 6, 6);
        fill(&mut dst, Rgb::BLUE);
        blit(&mut dst, &src, -2, 4).unwrap();
        let dst = dst.freeze();
        assert_eq!(pixel_at(&dst, 0, 4), Some(Rgb::RED));
        assert_eq!(pixel_at(&dst, 1, 5), Some(Rgb::RED));
        assert_eq!(pixel_at(&dst, 2, 4), Some(Rgb::BLUE));
        assert_eq!(pixel_at(&dst, 0, 3), Some(Rgb::BLUE));
    }

    #[test]
    fn test_blit_rejects_mixed_layouts() {
        let src = VideoFrameMut::zeroed(PixelFormat::Rgba, 2, 2).freeze();
        let mut dst = VideoFrameMut::zeroed(PixelFormat::I420, 2, 2);
        assert!(blit(&mut dst, &src, 0, 0).is_err());
    }

    #[test]
    fn test_image_round_trip_and_crop() {
        let mut image = RgbaImage::from_pixel(6, 4, Rgb::BLUE.into());
        image.put_pixel(0, 0, Rgb::WHITE.into());
        for format in PixelFormat::ALL {
            let frame = encode_image(&image, format).freeze();
            let back = decode_image(&frame).unwrap();
            assert_eq!(back.dimensions(), (6, 4));
            let corner = crop_image(&frame, 4, 2, 4, 4);
            let p = corner.get_pixel(0, 0);
            assert!(close(Rgb::new(p[0], p[1], p[2]), Rgb::BLUE), "{format}");
            // Past the edge.
            assert_eq!(*corner.get_pixel(3, 3), Rgba([0, 0, 0, 255]));
        }
        let rgba = encode_image(&image, PixelFormat::Rgba).freeze();
        assert_eq!(pixel_at(&rgba, 0, 0), Some(Rgb::WHITE));
    }

    #[test]
    fn test_convert_preserves_colors() {
        let mut rgba = VideoFrameMut::zeroed(PixelFormat::Rgba, 4, 2);
        fill_rect(&mut rgba, 0, 0, 2, 2, Rgb::RED);
        fill_rect(&mut rgba, 2, 0, 2, 2, Rgb::GREEN);
        let rgba = rgba.freeze();
        for format in PixelFormat::ALL {
            let converted = convert(&rgba, format);
            assert_eq!(converted.format, format);
            assert_eq!(converted.data.len(), format.frame_size(4, 2));
            let back = convert(&converted, PixelFormat::Rgba);
            assert!(close(pixel_at(&back, 0, 0).unwrap(), Rgb::RED), "{format}");
            assert!(close(pixel_at(&back, 3, 1).unwrap(), Rgb::GREEN), "{format}");
        }
    }
}
