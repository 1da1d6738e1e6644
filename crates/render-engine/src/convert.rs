//! Pixel-layout conversion between the raw formats.

use std::sync::Arc;

use anyhow::Context;
use livemix_pipeline_core::{
    Caps, CapsRule, Direction, Payload, PixelFormat, PortTemplate, Processor, StageConfig,
    StageContext, StageDescriptor, StageFactory, StageIo, StageKind,
};

use crate::draw::convert;

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Convert, "Converts between raw pixel layouts")
        .port(PortTemplate::always("sink", Direction::Input, Caps::any_raw()))
        .port(PortTemplate::always("src", Direction::Output, Caps::any_raw()))
        .caps_rule(CapsRule::Geometry)
}

pub struct ConvertFactory {
    descriptor: Arc<StageDescriptor>,
}

impl ConvertFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for ConvertFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for ConvertFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let input = config.input_contract()?;
        let output = config.output_contract()?;
        let from = input.pixel_format().context("convert input is not raw video")?;
        let to = output.pixel_format().context("convert output is not raw video")?;
        tracing::debug!(stage = %config.name, %from, %to, "Conversion configured");
        Ok(Box::new(Convert { to }))
    }
}

struct Convert {
    to: PixelFormat,
}

impl Processor for Convert {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let (input, output) = io.into_single()?;
        while let Some(buffer) = input.pop(&ctx.stop) {
            let converted = buffer.as_video().map(|frame| convert(frame, self.to));
            let buffer = match converted {
                Some(frame) => buffer.with_payload(Payload::Video(frame)),
                None => anyhow::bail!("convert received a non-video buffer"),
            };
            if !output.push(buffer, &ctx.stop).is_flowing() {
                break;
            }
        }
        Ok(())
    }
}
