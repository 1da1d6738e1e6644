//! Frame compositor: combines every source into one canvas.
//!
//! Each output frame is built from one frame per input. Inputs are drawn
//! bottom to top in the layout's stacking order at their placement, above
//! the background layer. Whatever falls outside the canvas is clipped.

use std::sync::Arc;

use anyhow::Context;
use livemix_pipeline_core::{
    Background, Buffer, Caps, CapsRule, Direction, FormatTemplate, OptionSpec, PixelFormat,
    Placement, PortTemplate, Processor, SharedLayout, StageConfig, StageContext, StageDescriptor,
    StageFactory, StageIo, StageKind, VideoFrame, VideoFrameMut,
};

use crate::draw::{blit, fill, fill_rect, Rgb};

/// Side of one background checker square.
const CHECKER_SIZE: u32 = 8;

/// Pixel layout the compositor works in.
pub const CANVAS_FORMAT: PixelFormat = PixelFormat::I420;

/// The background layer of a given size, ready to draw on.
#[derive(Debug, Clone)]
pub struct Canvas {
    background: Background,
    base: VideoFrame,
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: Background) -> Self {
        let mut base = VideoFrameMut::zeroed(CANVAS_FORMAT, width, height);
        match background {
            Background::Black => fill(&mut base, Rgb::BLACK),
            Background::White => fill(&mut base, Rgb::WHITE),
            Background::Checker => {
                fill(&mut base, Rgb::gray(102));
                for y in (0..height).step_by(CHECKER_SIZE as usize) {
                    for x in (0..width).step_by(CHECKER_SIZE as usize) {
                        if (x / CHECKER_SIZE + y / CHECKER_SIZE) % 2 == 1 {
                            fill_rect(
                                &mut base,
                                i64::from(x),
                                i64::from(y),
                                CHECKER_SIZE,
                                CHECKER_SIZE,
                                Rgb::gray(153),
                            );
                        }
                    }
                }
            }
            Background::Transparent => {}
        }
        Self {
            background,
            base: base.freeze(),
        }
    }

    pub fn background(&self) -> Background {
        self.background
    }

    pub fn width(&self) -> u32 {
        self.base.width
    }

    pub fn height(&self) -> u32 {
        self.base.height
    }

    /// Draw `layers` bottom to top. The result always has the canvas size.
    pub fn compose<'a>(
        &self,
        layers: impl IntoIterator<Item = (&'a VideoFrame, Placement)>,
    ) -> anyhow::Result<VideoFrame> {
        let mut out = self.base.to_mut();
        for (frame, placement) in layers {
            blit(&mut out, frame, i64::from(placement.x), i64::from(placement.y))?;
        }
        Ok(out.freeze())
    }
}

fn descriptor() -> StageDescriptor {
    let canvas = || Caps::from(FormatTemplate::raw(&[CANVAS_FORMAT]));
    StageDescriptor::new(StageKind::Compositor, "Composites every input onto one canvas")
        .port(PortTemplate::request("sink_%u", Direction::Input, canvas()).required(1))
        .port(PortTemplate::always("src", Direction::Output, canvas()))
        .option(OptionSpec::int("width", 1, 16384, 640, "Canvas width"))
        .option(OptionSpec::int("height", 1, 16384, 360, "Canvas height"))
        .option(OptionSpec::enumeration(
            "background",
            Background::VALUES,
            "black",
            "Layer drawn beneath all inputs",
        ))
        .caps_rule(CapsRule::Canvas)
}

pub struct CompositorFactory {
    descriptor: Arc<StageDescriptor>,
}

impl CompositorFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for CompositorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for CompositorFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let contract = config.output_contract()?;
        let layout = config
            .layout
            .clone()
            .with_context(|| format!("compositor '{}' has no layout", config.name))?;
        Ok(Box::new(Compositor {
            width: contract.width,
            height: contract.height,
            layout,
        }))
    }
}

struct Compositor {
    width: u32,
    height: u32,
    layout: SharedLayout,
}

impl Processor for Compositor {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let StageIo { inputs, outputs } = io;
        let output = outputs
            .into_iter()
            .next()
            .context("compositor has no connected output")?;

        let mut canvas = Canvas::new(self.width, self.height, self.layout.read().background());
        let mut latest: Vec<Option<Buffer>> = vec![None; inputs.len()];
        let mut ended = vec![false; inputs.len()];
        let mut cycle = 0u64;

        loop {
            // One frame from every input still running; ended inputs keep
            // showing their last frame.
            let mut pts: Option<u64> = None;
            let mut duration = 0;
            for (i, input) in inputs.iter().enumerate() {
                if ended[i] {
                    continue;
                }
                match input.pop(&ctx.stop) {
                    Some(buffer) => {
                        pts = Some(pts.map_or(buffer.pts_ns, |p| p.max(buffer.pts_ns)));
                        duration = duration.max(buffer.duration_ns);
                        latest[i] = Some(buffer);
                    }
                    None => ended[i] = true,
                }
            }
            if ctx.stop.is_stopped() {
                break;
            }
            let Some(pts) = pts else {
                break;
            };

            let (background, stack) = {
                let layout = self.layout.read();
                (layout.background(), layout.inputs())
            };
            if background != canvas.background() {
                tracing::debug!(stage = %ctx.name, %background, "Background changed");
                canvas = Canvas::new(self.width, self.height, background);
            }
            let layers = stack.iter().filter_map(|(port, placement)| {
                let i = inputs.iter().position(|input| input.binding.port == *port)?;
                let frame = latest[i].as_ref()?.as_video()?;
                Some((frame, *placement))
            });
            let frame = canvas.compose(layers)?;

            if !output
                .push(Buffer::video(pts, duration, cycle, frame), &ctx.stop)
                .is_flowing()
            {
                break;
            }
            if cycle == 0 {
                ctx.reporter.first_buffer();
            }
            cycle += 1;
        }
        tracing::debug!(stage = %ctx.name, frames = cycle, "Compositor finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::pixel_at;
    use proptest::prelude::*;

    fn solid(width: u32, height: u32, color: Rgb) -> VideoFrame {
        let mut frame = VideoFrameMut::zeroed(CANVAS_FORMAT, width, height);
        fill(&mut frame, color);
        frame.freeze()
    }

    fn is(frame: &VideoFrame, x: u32, y: u32, color: Rgb) -> bool {
        let px = pixel_at(frame, x, y).unwrap();
        let d = |a: u8, b: u8| (i32::from(a) - i32::from(b)).abs() <= 3;
        d(px.r, color.r) && d(px.g, color.g) && d(px.b, color.b)
    }

    #[test]
    fn test_default_layout_clips_second_source_entirely() {
        let canvas = Canvas::new(640, 360, Background::Black);
        let a = solid(640, 360, Rgb::RED);
        let b = solid(640, 360, Rgb::GREEN);
        let c = solid(640, 360, Rgb::BLUE);
        let out = canvas
            .compose([
                (&a, Placement::new(0, 0)),
                (&b, Placement::new(640, 0)),
                (&c, Placement::new(360, 360)),
            ])
            .unwrap();
        assert_eq!((out.width, out.height), (640, 360));
        assert!(is(&out, 0, 0, Rgb::RED));
        assert!(is(&out, 639, 359, Rgb::RED));
    }

    #[test]
    fn test_later_inputs_draw_on_top() {
        let canvas = Canvas::new(64, 36, Background::Black);
        let a = solid(32, 36, Rgb::RED);
        let b = solid(32, 18, Rgb::BLUE);
        let out = canvas
            .compose([(&a, Placement::new(0, 0)), (&b, Placement::new(16, 18))])
            .unwrap();
        assert!(is(&out, 0, 0, Rgb::RED));
        assert!(is(&out, 20, 20, Rgb::BLUE));
        assert!(is(&out, 40, 0, Rgb::BLACK));
        assert!(is(&out, 47, 35, Rgb::BLUE));
        assert!(is(&out, 60, 30, Rgb::BLACK));
    }

    #[test]
    fn test_backgrounds() {
        let white = Canvas::new(16, 16, Background::White).compose(std::iter::empty()).unwrap();
        assert!(is(&white, 5, 5, Rgb::WHITE));
        let checker = Canvas::new(16, 16, Background::Checker).compose(std::iter::empty()).unwrap();
        assert!(is(&checker, 0, 0, Rgb::gray(102)));
        assert!(is(&checker, 8, 0, Rgb::gray(153)));
        let transparent = Canvas::new(16, 16, Background::Transparent).compose(std::iter::empty()).unwrap();
        assert!(transparent.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_negative_offsets_clip() {
        let canvas = Canvas::new(32, 32, Background::Black);
        let a = solid(16, 16, Rgb::WHITE);
        let out = canvas.compose([(&a, Placement::new(-8, -8))]).unwrap();
        assert!(is(&out, 0, 0, Rgb::WHITE));
        assert!(is(&out, 7, 7, Rgb::WHITE));
        assert!(is(&out, 8, 8, Rgb::BLACK));
    }

    proptest! {
        #[test]
        fn output_always_has_canvas_size(
            canvas_w in 2u32..96,
            canvas_h in 2u32..64,
            layers in proptest::collection::vec(
                (1u32..80, 1u32..80, -200i32..200, -200i32..200),
                1..6,
            ),
        ) {
            let canvas = Canvas::new(canvas_w, canvas_h, Background::Black);
            let frames: Vec<(VideoFrame, Placement)> = layers
                .iter()
                .map(|(w, h, x, y)| (solid(*w, *h, Rgb::WHITE), Placement::new(*x, *y)))
                .collect();
            let out = canvas
                .compose(frames.iter().map(|(f, p)| (f, *p)))
                .unwrap();
            prop_assert_eq!((out.width, out.height), (canvas_w, canvas_h));
            prop_assert_eq!(out.data.len(), CANVAS_FORMAT.frame_size(canvas_w, canvas_h));
        }

        #[test]
        fn placements_past_the_canvas_leave_background(
            dx in 0i32..1000,
            dy in 0i32..1000,
        ) {
            let canvas = Canvas::new(32, 18, Background::Black);
            let source = solid(32, 18, Rgb::WHITE);
            let out = canvas
                .compose([(&source, Placement::new(32 + dx, 18 + dy))])
                .unwrap();
            prop_assert_eq!(out, canvas.compose(std::iter::empty()).unwrap());
        }
    }
}
