//! Synthetic capture source producing test patterns.
//!
//! Stands in for a camera or screen grabber: it produces frames in whatever
//! raw contract its output negotiated, optionally paced against the pipeline
//! clock like a live device.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use livemix_common::clock::FramePacer;
use livemix_pipeline_core::{
    Buffer, Caps, Direction, FormatContract, OptionSpec, PixelFormat, PortTemplate, Processor,
    StageConfig, StageContext, StageDescriptor, StageFactory, StageIo, StageKind, VideoFrame,
};

use image::RgbaImage;
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::draw::{encode_image, Rgb};

/// Side of one checkerboard square.
const CHECKER_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Smpte,
    Snow,
    Black,
    White,
    Red,
    Green,
    Blue,
    Checkers,
    Ball,
}

impl Pattern {
    pub const VALUES: &'static [(&'static str, i64)] = &[
        ("smpte", 0),
        ("snow", 1),
        ("black", 2),
        ("white", 3),
        ("red", 4),
        ("green", 5),
        ("blue", 6),
        ("checkers", 10),
        ("ball", 18),
    ];

    /// Whether every frame is identical.
    pub fn is_static(&self) -> bool {
        !matches!(self, Self::Snow | Self::Ball)
    }

    /// Render frame `index`.
    pub fn paint(&self, index: u64, width: u32, height: u32) -> RgbaImage {
        match self {
            Self::Smpte => smpte(width, height),
            Self::Snow => {
                let mut rng = StdRng::seed_from_u64(index);
                let mut img = RgbaImage::new(width, height);
                for pixel in img.pixels_mut() {
                    let level: u8 = rng.gen();
                    *pixel = Rgb::gray(level).into();
                }
                img
            }
            Self::Black => RgbaImage::from_pixel(width, height, Rgb::BLACK.into()),
            Self::White => RgbaImage::from_pixel(width, height, Rgb::WHITE.into()),
            Self::Red => RgbaImage::from_pixel(width, height, Rgb::RED.into()),
            Self::Green => RgbaImage::from_pixel(width, height, Rgb::GREEN.into()),
            Self::Blue => RgbaImage::from_pixel(width, height, Rgb::BLUE.into()),
            Self::Checkers => {
                let mut img = RgbaImage::from_pixel(width, height, Rgb::WHITE.into());
                for y in (0..height).step_by(CHECKER_SIZE as usize) {
                    for x in (0..width).step_by(CHECKER_SIZE as usize) {
                        if (x / CHECKER_SIZE + y / CHECKER_SIZE) % 2 == 0 {
                            fill_box(&mut img, x, y, x + CHECKER_SIZE, y + CHECKER_SIZE, Rgb::BLACK);
                        }
                    }
                }
                img
            }
            Self::Ball => {
                let mut img = RgbaImage::from_pixel(width, height, Rgb::BLACK.into());
                let radius = (width.min(height) / 10).max(1) as f64;
                let t = index as f64 / 30.0;
                let (w, h) = (f64::from(width), f64::from(height));
                let cx = w / 2.0 + (w / 2.0 - radius) * (t * 1.3).sin();
                let cy = h / 2.0 + (h / 2.0 - radius) * (t * 1.7).cos();
                draw_filled_circle_mut(
                    &mut img,
                    (cx.round() as i32, cy.round() as i32),
                    radius as i32,
                    Rgb::WHITE.into(),
                );
                img
            }
        }
    }
}

/// Fill `[x0, x1) x [y0, y1)`, clipped to the image.
fn fill_box(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb) {
    let (x1, y1) = (x1.min(img.width()), y1.min(img.height()));
    if x1 <= x0 || y1 <= y0 {
        return;
    }
    let rect = Rect::at(x0 as i32, y0 as i32).of_size(x1 - x0, y1 - y0);
    draw_filled_rect_mut(img, rect, color.into());
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smpte" => Ok(Self::Smpte),
            "snow" => Ok(Self::Snow),
            "black" => Ok(Self::Black),
            "white" => Ok(Self::White),
            "red" => Ok(Self::Red),
            "green" => Ok(Self::Green),
            "blue" => Ok(Self::Blue),
            "checkers" => Ok(Self::Checkers),
            "ball" => Ok(Self::Ball),
            other => Err(format!("unknown pattern '{other}'")),
        }
    }
}

/// Color bars over castellations over the PLUGE row.
fn smpte(width: u32, height: u32) -> RgbaImage {
    const BARS: [Rgb; 7] = [
        Rgb::new(191, 191, 191),
        Rgb::new(191, 191, 0),
        Rgb::new(0, 191, 191),
        Rgb::new(0, 191, 0),
        Rgb::new(191, 0, 191),
        Rgb::new(191, 0, 0),
        Rgb::new(0, 0, 191),
    ];
    const CASTELLATIONS: [Rgb; 7] = [
        Rgb::new(0, 0, 191),
        Rgb::new(19, 19, 19),
        Rgb::new(191, 0, 191),
        Rgb::new(19, 19, 19),
        Rgb::new(0, 191, 191),
        Rgb::new(19, 19, 19),
        Rgb::new(191, 191, 191),
    ];
    const PLUGE: [Rgb; 4] = [
        Rgb::new(0, 33, 76),
        Rgb::new(255, 255, 255),
        Rgb::new(50, 0, 106),
        Rgb::new(19, 19, 19),
    ];
    // First column of band `i` when the width is split into `n` bands.
    let edge = |i: u32, n: u32| (i * width).div_ceil(n);
    let (bars_end, castellations_end) = (height * 2 / 3, height * 3 / 4);

    let mut img = RgbaImage::new(width, height);
    for (i, (bar, castellation)) in (0u32..).zip(BARS.iter().zip(CASTELLATIONS)) {
        let (x0, x1) = (edge(i, 7), edge(i + 1, 7));
        fill_box(&mut img, x0, 0, x1, bars_end, *bar);
        fill_box(&mut img, x0, bars_end, x1, castellations_end, castellation);
    }
    for (i, color) in (0u32..).zip(PLUGE) {
        fill_box(&mut img, edge(i, 4), castellations_end, edge(i + 1, 4), height, color);
    }
    img
}

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Capture, "Synthetic video source producing test patterns")
        .port(PortTemplate::always("src", Direction::Output, Caps::any_raw()))
        .option(OptionSpec::enumeration("pattern", Pattern::VALUES, "smpte", "Pattern to draw"))
        .option(OptionSpec::boolean("is-live", false, "Pace output against the pipeline clock"))
        .option(OptionSpec::int(
            "num-buffers",
            -1,
            i64::MAX,
            -1,
            "Frames before end-of-stream (-1 = unlimited)",
        ))
}

pub struct TestPatternFactory {
    descriptor: Arc<StageDescriptor>,
}

impl TestPatternFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for TestPatternFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for TestPatternFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let contract = config.output_contract()?;
        let format = contract
            .pixel_format()
            .with_context(|| format!("'{}' can only produce raw video, not {contract}", config.name))?;
        let pattern = config
            .option_str("pattern")?
            .parse::<Pattern>()
            .map_err(anyhow::Error::msg)?;
        let num_buffers = config.option_int("num-buffers")?;
        Ok(Box::new(TestPatternSource {
            pattern,
            live: config.option_bool("is-live")?,
            num_buffers: u64::try_from(num_buffers).ok(),
            contract,
            format,
            still: None,
        }))
    }
}

struct TestPatternSource {
    pattern: Pattern,
    live: bool,
    num_buffers: Option<u64>,
    contract: FormatContract,
    format: PixelFormat,
    still: Option<VideoFrame>,
}

impl TestPatternSource {
    fn render(&self, index: u64) -> VideoFrame {
        let (w, h) = (self.contract.width, self.contract.height);
        encode_image(&self.pattern.paint(index, w, h), self.format).freeze()
    }

    fn frame(&self, index: u64) -> VideoFrame {
        match &self.still {
            Some(frame) => frame.clone(),
            None => self.render(index),
        }
    }
}

#[async_trait]
impl Processor for TestPatternSource {
    /// Static patterns are rendered once up front so the first frame is
    /// ready the moment the graph starts.
    async fn acquire(&mut self) -> anyhow::Result<()> {
        if self.pattern.is_static() {
            self.still = Some(self.render(0));
        }
        Ok(())
    }

    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let output = io.into_output()?;
        let rate = self.contract.framerate;
        let pacer = FramePacer::new(rate.num, rate.den);

        let mut index = 0u64;
        while self.num_buffers.map_or(true, |n| index < n) {
            let pts = pacer.pts_ns(index);
            if self.live && !ctx.wait_until(pts) {
                break;
            }
            let buffer = Buffer::video(pts, pacer.duration_ns(index), index, self.frame(index));
            if !output.push(buffer, &ctx.stop).is_flowing() {
                break;
            }
            if index == 0 {
                ctx.reporter.first_buffer();
            }
            index += 1;
        }
        tracing::debug!(stage = %ctx.name, frames = index, "Source finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(img: &RgbaImage, x: u32, y: u32) -> Rgb {
        let p = img.get_pixel(x, y);
        Rgb::new(p[0], p[1], p[2])
    }

    #[test]
    fn test_pattern_nicks_parse() {
        for (nick, _) in Pattern::VALUES {
            assert!(nick.parse::<Pattern>().is_ok(), "{nick}");
        }
        assert!("zone-plate".parse::<Pattern>().is_err());
    }

    #[test]
    fn test_smpte_bars() {
        let img = Pattern::Smpte.paint(0, 70, 30);
        assert_eq!(color(&img, 0, 0), Rgb::new(191, 191, 191));
        assert_eq!(color(&img, 9, 0), Rgb::new(191, 191, 191));
        assert_eq!(color(&img, 10, 0), Rgb::new(191, 191, 0));
        assert_eq!(color(&img, 69, 0), Rgb::new(0, 0, 191));
        assert_eq!(color(&img, 69, 21), Rgb::new(191, 191, 191));
        assert_eq!(color(&img, 0, 29), Rgb::new(0, 33, 76));
        assert_eq!(color(&img, 69, 29), Rgb::new(19, 19, 19));
    }

    #[test]
    fn test_checkers_alternate() {
        let img = Pattern::Checkers.paint(0, 20, 10);
        assert_eq!(color(&img, 0, 0), Rgb::BLACK);
        assert_eq!(color(&img, 8, 0), Rgb::WHITE);
        assert_eq!(color(&img, 8, 8), Rgb::BLACK);
        assert_eq!(color(&img, 19, 9), Rgb::WHITE);
        assert_eq!(color(&img, 16, 0), Rgb::BLACK);
    }

    #[test]
    fn test_snow_changes_every_frame() {
        let a = Pattern::Snow.paint(1, 16, 16);
        let b = Pattern::Snow.paint(2, 16, 16);
        assert_ne!(a, b);
        assert_eq!(a, Pattern::Snow.paint(1, 16, 16));
        assert!(a.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
        assert!(!Pattern::Snow.is_static());
        assert!(Pattern::Checkers.is_static());
    }

    #[test]
    fn test_ball_moves() {
        let a = Pattern::Ball.paint(0, 64, 36);
        let b = Pattern::Ball.paint(15, 64, 36);
        assert_ne!(a, b);
        assert!(a.pixels().any(|p| p[0] == 255));
        assert_eq!(a.dimensions(), (64, 36));
    }
}
