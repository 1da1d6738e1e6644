//! Time overlay: stamps each frame with its running time.

use std::sync::Arc;

use livemix_pipeline_core::{
    Caps, CapsRule, Direction, OptionSpec, Payload, PortTemplate, Processor, StageConfig,
    StageContext, StageDescriptor, StageFactory, StageIo, StageKind, VideoFrame,
};

use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::draw::{blit, clip, crop_image, encode_image, Rgb};
use crate::font::{draw_text, text_size};

const HALIGNMENTS: &[(&str, i64)] = &[("left", 0), ("center", 1), ("right", 2)];
const VALIGNMENTS: &[(&str, i64)] = &[("baseline", 0), ("bottom", 1), ("top", 2), ("center", 4)];

/// Margin between the text box and the frame edge, in pixels.
const PAD: i64 = 4;

/// `HH:MM:SS.mmm`
pub fn format_running_time(ns: u64) -> String {
    let ms = ns / 1_000_000;
    let (h, rem) = (ms / 3_600_000, ms % 3_600_000);
    let (m, rem) = (rem / 60_000, rem % 60_000);
    let (s, ms) = (rem / 1000, rem % 1000);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Overlay, "Draws the buffer running time onto each frame")
        .port(PortTemplate::always("sink", Direction::Input, Caps::any_raw()))
        .port(PortTemplate::always("src", Direction::Output, Caps::any_raw()))
        .option(OptionSpec::enumeration("halignment", HALIGNMENTS, "left", "Horizontal alignment"))
        .option(OptionSpec::enumeration("valignment", VALIGNMENTS, "top", "Vertical alignment"))
        .option(OptionSpec::int("scale", 1, 16, 2, "Font pixel size"))
        .option(OptionSpec::boolean("shaded-background", true, "Draw a dark box behind the text"))
        .option(OptionSpec::boolean("silent", false, "Pass frames through untouched"))
        .caps_rule(CapsRule::Passthrough)
}

pub struct TimeOverlayFactory {
    descriptor: Arc<StageDescriptor>,
}

impl TimeOverlayFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for TimeOverlayFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for TimeOverlayFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        Ok(Box::new(TimeOverlay {
            halign: config.option_str("halignment")?.to_string(),
            valign: config.option_str("valignment")?.to_string(),
            scale: config.option_int("scale")? as u32,
            shaded: config.option_bool("shaded-background")?,
            silent: config.option_bool("silent")?,
        }))
    }
}

struct TimeOverlay {
    halign: String,
    valign: String,
    scale: u32,
    shaded: bool,
    silent: bool,
}

impl TimeOverlay {
    fn origin(&self, frame: &VideoFrame, text_w: u32, text_h: u32) -> (i64, i64) {
        let (fw, fh) = (i64::from(frame.width), i64::from(frame.height));
        let (tw, th) = (i64::from(text_w), i64::from(text_h));
        let x = match self.halign.as_str() {
            "center" => (fw - tw) / 2,
            "right" => fw - tw - PAD,
            _ => PAD,
        };
        let y = match self.valign.as_str() {
            "top" => PAD,
            "center" => (fh - th) / 2,
            _ => fh - th - PAD,
        };
        (x, y)
    }

    /// Only the region under the text box is converted to RGBA, painted and
    /// written back.
    fn stamp(&self, frame: &VideoFrame, running_time_ns: u64) -> anyhow::Result<VideoFrame> {
        let text = format_running_time(running_time_ns);
        let (tw, th) = text_size(&text, self.scale);
        let (x, y) = self.origin(frame, tw, th);
        let margin = if self.shaded { self.scale } else { 0 };
        let (box_w, box_h) = (tw + 2 * margin, th + 2 * margin);
        let (box_x, box_y) = (x - i64::from(margin), y - i64::from(margin));
        let visible = clip(
            box_x,
            box_y,
            box_w as usize,
            box_h as usize,
            frame.width as usize,
            frame.height as usize,
        );
        let Some(visible) = visible else {
            return Ok(frame.clone());
        };
        // Even origin keeps 4:2:0 chroma blocks whole.
        let left = (visible.dst_x & !1) as u32;
        let top = (visible.dst_y & !1) as u32;
        let right = (visible.dst_x + visible.width) as u32;
        let bottom = (visible.dst_y + visible.height) as u32;

        let mut patch = crop_image(frame, left, top, right - left, bottom - top);
        let (dx, dy) = (box_x - i64::from(left), box_y - i64::from(top));
        if self.shaded {
            let shade = Rect::at(dx as i32, dy as i32).of_size(box_w, box_h);
            draw_filled_rect_mut(&mut patch, shade, Rgb::gray(32).into());
        }
        draw_text(
            &mut patch,
            (x - i64::from(left)) as i32,
            (y - i64::from(top)) as i32,
            &text,
            self.scale,
            Rgb::WHITE,
        );

        let mut out = frame.to_mut();
        blit(&mut out, &encode_image(&patch, frame.format).freeze(), i64::from(left), i64::from(top))?;
        Ok(out.freeze())
    }
}

impl Processor for TimeOverlay {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let (input, output) = io.into_single()?;
        while let Some(buffer) = input.pop(&ctx.stop) {
            let stamped = if self.silent {
                None
            } else {
                buffer
                    .as_video()
                    .map(|frame| self.stamp(frame, buffer.pts_ns))
                    .transpose()?
            };
            let buffer = match stamped {
                Some(frame) => buffer.with_payload(Payload::Video(frame)),
                None => buffer,
            };
            if !output.push(buffer, &ctx.stop).is_flowing() {
                break;
            }
        }
        Ok(())
    }
}
