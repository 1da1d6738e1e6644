//! H.264 encoder stand-in.
//!
//! Produces AVC-framed access units (4-byte big-endian NAL lengths) whose
//! size follows the configured bitrate, with an IDR unit on every key
//! interval. The payload bytes are sampled from the frame's luma plane so
//! identical input yields identical output.

use std::sync::Arc;

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use livemix_pipeline_core::{
    Buffer, Caps, CapsRule, Direction, EncodedUnit, Encoding, FormatTemplate, OptionSpec, Payload,
    PixelFormat, PortTemplate, Processor, StageConfig, StageContext, StageDescriptor, StageFactory,
    StageIo, StageKind, VideoFrame,
};

pub const SPEED_PRESETS: &[(&str, i64)] = &[
    ("none", 0),
    ("ultrafast", 1),
    ("superfast", 2),
    ("veryfast", 3),
    ("faster", 4),
    ("fast", 5),
    ("medium", 6),
    ("slow", 7),
    ("slower", 8),
    ("veryslow", 9),
    ("placebo", 10),
];

pub const TUNES: &[(&str, i64)] = &[
    ("none", 0),
    ("stillimage", 1),
    ("fastdecode", 2),
    ("zerolatency", 4),
];

/// Key interval used when `key-int-max` is 0.
pub const AUTO_KEY_INTERVAL: u32 = 250;

const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const PROFILE_BASELINE: u8 = 66;
const LEVEL_3_1: u8 = 31;

/// Rate control for the stand-in encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    pub bitrate_kbps: u32,
    pub key_interval: u32,
    pub fps_num: u32,
    pub fps_den: u32,
}

impl RateControl {
    /// Average bytes per frame at the configured bitrate.
    pub fn frame_budget(&self) -> usize {
        let bytes_per_sec = u64::from(self.bitrate_kbps) * 1000 / 8;
        let per_frame = bytes_per_sec * u64::from(self.fps_den.max(1)) / u64::from(self.fps_num.max(1));
        per_frame.max(16) as usize
    }

    /// Bytes spent on frame `index`. Keyframes take three budgets, the
    /// remaining frames of the interval share what is left.
    pub fn unit_size(&self, index: u64) -> usize {
        let budget = self.frame_budget();
        if self.key_interval <= 3 {
            return budget;
        }
        if self.is_keyframe(index) {
            return budget * 3;
        }
        let interval = self.key_interval as usize;
        (budget * interval - budget * 3) / (interval - 1)
    }

    pub fn is_keyframe(&self, index: u64) -> bool {
        index % u64::from(self.key_interval.max(1)) == 0
    }
}

/// AVCDecoderConfigurationRecord for the stand-in stream.
pub fn decoder_config(width: u32, height: u32) -> Bytes {
    let mut sps = BytesMut::new();
    sps.put_u8(NAL_SPS);
    sps.put_u8(PROFILE_BASELINE);
    sps.put_u8(0xC0);
    sps.put_u8(LEVEL_3_1);
    sps.put_u16(width as u16);
    sps.put_u16(height as u16);
    let pps = [NAL_PPS, 0xCE, 0x3C, 0x80];

    let mut record = BytesMut::new();
    record.put_u8(1);
    record.put_u8(PROFILE_BASELINE);
    record.put_u8(0xC0);
    record.put_u8(LEVEL_3_1);
    // 4-byte NAL lengths, one SPS, one PPS.
    record.put_u8(0xFF);
    record.put_u8(0xE1);
    record.put_u16(sps.len() as u16);
    record.put_slice(&sps);
    record.put_u8(1);
    record.put_u16(pps.len() as u16);
    record.put_slice(&pps);
    record.freeze()
}

/// One access unit of `size` bytes (length prefix included).
pub fn encode_unit(frame: &VideoFrame, keyframe: bool, size: usize) -> Bytes {
    let nal_len = size.saturating_sub(4).max(1);
    let mut out = BytesMut::with_capacity(nal_len + 4);
    out.put_u32(nal_len as u32);
    out.put_u8(if keyframe { NAL_IDR } else { NAL_SLICE });

    let luma = frame
        .format
        .planes(frame.width, frame.height)
        .first()
        .map(|plane| &frame.data[plane.range()])
        .unwrap_or(&[]);
    let body = nal_len - 1;
    if luma.is_empty() {
        out.put_bytes(0, body);
    } else {
        let step = (luma.len() / body.max(1)).max(1);
        for i in 0..body {
            out.put_u8(luma[(i * step) % luma.len()]);
        }
    }
    out.freeze()
}

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Encoder, "H.264 encoder stand-in")
        .port(PortTemplate::always(
            "sink",
            Direction::Input,
            Caps::from(FormatTemplate::raw(&[PixelFormat::I420])),
        ))
        .port(PortTemplate::always(
            "src",
            Direction::Output,
            Caps::from(FormatTemplate::new(vec![Encoding::H264])),
        ))
        .option(OptionSpec::int("bitrate", 1, 2_048_000, 2048, "Bitrate in kbit/s"))
        .option(OptionSpec::int(
            "key-int-max",
            0,
            i64::from(i32::MAX),
            0,
            "Maximal distance between two key-frames (0 = automatic)",
        ))
        .option(OptionSpec::enumeration("speed-preset", SPEED_PRESETS, "medium", "Preset name"))
        .option(OptionSpec::enumeration("tune", TUNES, "none", "Preset tuning"))
        .caps_rule(CapsRule::Geometry)
}

pub struct EncoderFactory {
    descriptor: Arc<StageDescriptor>,
}

impl EncoderFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for EncoderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for EncoderFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let contract = config.input_contract()?;
        let key_int = u32::try_from(config.option_int("key-int-max")?).context("key-int-max out of range")?;
        let rate = RateControl {
            bitrate_kbps: u32::try_from(config.option_int("bitrate")?).context("bitrate out of range")?,
            key_interval: if key_int == 0 { AUTO_KEY_INTERVAL } else { key_int },
            fps_num: contract.framerate.num,
            fps_den: contract.framerate.den,
        };
        tracing::info!(
            stage = %config.name,
            bitrate = rate.bitrate_kbps,
            key_interval = rate.key_interval,
            speed_preset = %config.option_str("speed-preset")?,
            tune = %config.option_str("tune")?,
            "Encoder configured"
        );
        Ok(Box::new(Encoder {
            rate,
            codec_data: decoder_config(contract.width, contract.height),
        }))
    }
}

struct Encoder {
    rate: RateControl,
    codec_data: Bytes,
}

impl Processor for Encoder {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let (input, output) = io.into_single()?;
        let mut index = 0u64;
        let mut bytes_out = 0usize;
        while let Some(buffer) = input.pop(&ctx.stop) {
            let Some(frame) = buffer.as_video() else {
                anyhow::bail!("encoder received a non-video buffer");
            };
            let keyframe = self.rate.is_keyframe(index);
            let data = encode_unit(frame, keyframe, self.rate.unit_size(index));
            bytes_out += data.len();
            let unit = EncodedUnit {
                keyframe,
                codec_data: (index == 0).then(|| self.codec_data.clone()),
                data,
            };
            let encoded = Buffer {
                pts_ns: buffer.pts_ns,
                duration_ns: buffer.duration_ns,
                sequence: index,
                payload: Payload::Encoded(unit),
            };
            if !output.push(encoded, &ctx.stop).is_flowing() {
                break;
            }
            if index == 0 {
                ctx.reporter.first_buffer();
            }
            index += 1;
        }
        tracing::debug!(stage = %ctx.name, units = index, bytes = bytes_out, "Encoder finished");
        Ok(())
    }
}
