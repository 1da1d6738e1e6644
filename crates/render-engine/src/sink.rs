//! Local render sink: the end of the preview branch.
//!
//! Frames are handed to an optional observer (a window, a test harness) and
//! the last one can be saved as an image when the sink stops.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use livemix_pipeline_core::{
    Caps, Direction, FormatTemplate, OptionSpec, PixelFormat, PortTemplate, Processor, StageConfig,
    StageContext, StageDescriptor, StageFactory, StageIo, StageKind, VideoFrame,
};

use image::DynamicImage;

use crate::draw::decode_image;

/// Called with every presented frame and its presentation time.
pub type FrameObserver = Arc<dyn Fn(&VideoFrame, u64) + Send + Sync>;

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::LocalSink, "Presents frames locally")
        .port(PortTemplate::always(
            "sink",
            Direction::Input,
            Caps::from(FormatTemplate::raw(&[PixelFormat::Rgba, PixelFormat::Bgra])),
        ))
        .option(OptionSpec::boolean("sync", true, "Present frames on the pipeline clock"))
        .option(OptionSpec::string("snapshot", "", "Save the last frame to this image file; format from the extension"))
}

#[derive(Clone)]
pub struct LocalSinkFactory {
    descriptor: Arc<StageDescriptor>,
    observer: Option<FrameObserver>,
}

impl LocalSinkFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: FrameObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl Default for LocalSinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for LocalSinkFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let snapshot = config.option_str("snapshot")?;
        Ok(Box::new(LocalSink {
            sync: config.option_bool("sync")?,
            snapshot: (!snapshot.is_empty()).then(|| PathBuf::from(snapshot)),
            observer: self.observer.clone(),
        }))
    }
}

struct LocalSink {
    sync: bool,
    snapshot: Option<PathBuf>,
    observer: Option<FrameObserver>,
}

impl Processor for LocalSink {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let input = io.into_input()?;
        let mut last: Option<VideoFrame> = None;
        let mut rendered = 0u64;

        while let Some(buffer) = input.pop(&ctx.stop) {
            if self.sync && !ctx.wait_until(buffer.pts_ns) {
                break;
            }
            let Some(frame) = buffer.as_video() else {
                continue;
            };
            if let Some(observer) = &self.observer {
                observer(frame, buffer.pts_ns);
            }
            if rendered == 0 {
                ctx.reporter.first_buffer();
            }
            rendered += 1;
            last = Some(frame.clone());
        }

        tracing::info!(stage = %ctx.name, rendered, "Local sink finished");
        if let (Some(path), Some(frame)) = (&self.snapshot, &last) {
            write_snapshot(path, frame)
                .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
            tracing::info!(stage = %ctx.name, path = %path.display(), "Snapshot written");
        }
        Ok(())
    }
}

/// Save a frame as an opaque RGB image.
pub fn write_snapshot(path: &Path, frame: &VideoFrame) -> anyhow::Result<()> {
    DynamicImage::ImageRgba8(decode_image(frame)?).into_rgb8().save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::{fill, Rgb};
    use livemix_pipeline_core::VideoFrameMut;

    #[test]
    fn test_write_snapshot_png() {
        let mut frame = VideoFrameMut::zeroed(PixelFormat::Bgra, 3, 2);
        fill(&mut frame, Rgb::RED);
        let frame = frame.freeze();

        let path = std::env::temp_dir().join(format!("livemix-snapshot-{}.png", std::process::id()));
        write_snapshot(&path, &frame).unwrap();
        let saved = image::open(&path).unwrap().to_rgb8();
        let _ = std::fs::remove_file(&path);

        assert_eq!(saved.dimensions(), (3, 2));
        assert_eq!(*saved.get_pixel(2, 1), image::Rgb([255, 0, 0]));
    }

    #[test]
    fn test_write_snapshot_unknown_extension_fails() {
        let frame = VideoFrameMut::zeroed(PixelFormat::Rgba, 2, 2).freeze();
        let path = std::env::temp_dir().join(format!("livemix-snapshot-{}.nope", std::process::id()));
        assert!(write_snapshot(&path, &frame).is_err());
    }

    #[test]
    fn test_snapshot_option_defaults_to_none() {
        let factory = LocalSinkFactory::new();
        let spec = factory.descriptor().option_spec("snapshot").cloned().unwrap();
        assert_eq!(spec.default.as_str(), Some(""));
        assert!(factory.descriptor().option_spec("sync").is_some());
    }
}
