//! FLV container muxing for an H.264 video-only stream.
//!
//! ```text
//! | header (9) | prev size (4) | tag | prev size (4) | tag | prev size (4) | ...
//! tag = | type (1) | data size (3) | timestamp (3) | ts ext (1) | stream id (3) | body |
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use livemix_pipeline_core::{
    Buffer, Caps, CapsRule, Direction, EncodedUnit, Encoding, FormatContract, FormatTemplate,
    Payload, PortTemplate, Processor, StageConfig, StageContext, StageDescriptor, StageFactory,
    StageIo, StageKind,
};

pub const HEADER_LENGTH: usize = 9;
pub const TAG_HEADER_LENGTH: usize = 11;

pub mod tag_type {
    pub const VIDEO: u8 = 9;
    pub const SCRIPT_DATA: u8 = 18;
}

const FLAG_VIDEO: u8 = 0x01;
const CODEC_AVC: u8 = 7;
const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;

mod amf0 {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];
}

/// Stream properties announced in `onMetaData`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
}

impl From<&FormatContract> for StreamInfo {
    fn from(contract: &FormatContract) -> Self {
        Self {
            width: contract.width,
            height: contract.height,
            framerate: contract.framerate.as_f64(),
        }
    }
}

/// Writes FLV bytes for a single video track.
#[derive(Debug, Default)]
pub struct FlvWriter {
    buf: BytesMut,
}

impl FlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// File header followed by the zero `PreviousTagSize0`.
    pub fn write_header(&mut self) {
        self.buf.put_slice(b"FLV");
        self.buf.put_u8(1);
        self.buf.put_u8(FLAG_VIDEO);
        self.buf.put_u32(HEADER_LENGTH as u32);
        self.buf.put_u32(0);
    }

    pub fn write_metadata(&mut self, info: &StreamInfo) {
        let mut body = BytesMut::new();
        put_amf_string(&mut body, "onMetaData");
        let fields: [(&str, f64); 4] = [
            ("width", f64::from(info.width)),
            ("height", f64::from(info.height)),
            ("framerate", info.framerate),
            ("videocodecid", f64::from(CODEC_AVC)),
        ];
        body.put_u8(amf0::ECMA_ARRAY);
        body.put_u32(fields.len() as u32 + 1);
        for (key, value) in fields {
            put_amf_key(&mut body, key);
            body.put_u8(amf0::NUMBER);
            body.put_f64(value);
        }
        put_amf_key(&mut body, "hasAudio");
        body.put_u8(amf0::BOOLEAN);
        body.put_u8(0);
        body.put_slice(&amf0::OBJECT_END);
        self.write_tag(tag_type::SCRIPT_DATA, 0, &body);
    }

    /// AVC sequence header carrying the decoder configuration record.
    pub fn write_sequence_header(&mut self, timestamp_ms: u32, config: &[u8]) {
        let mut body = BytesMut::with_capacity(config.len() + 5);
        body.put_u8(FRAME_KEY << 4 | CODEC_AVC);
        body.put_u8(AVC_SEQUENCE_HEADER);
        body.put_uint(0, 3);
        body.put_slice(config);
        self.write_tag(tag_type::VIDEO, timestamp_ms, &body);
    }

    pub fn write_video(&mut self, timestamp_ms: u32, unit: &EncodedUnit) {
        let frame_type = if unit.keyframe { FRAME_KEY } else { FRAME_INTER };
        let mut body = BytesMut::with_capacity(unit.data.len() + 5);
        body.put_u8(frame_type << 4 | CODEC_AVC);
        body.put_u8(AVC_NALU);
        // Composition time offset: no B-frames.
        body.put_uint(0, 3);
        body.put_slice(&unit.data);
        self.write_tag(tag_type::VIDEO, timestamp_ms, &body);
    }

    fn write_tag(&mut self, kind: u8, timestamp_ms: u32, body: &[u8]) {
        self.buf.put_u8(kind);
        self.buf.put_uint(body.len() as u64, 3);
        self.buf.put_uint(u64::from(timestamp_ms & 0x00FF_FFFF), 3);
        self.buf.put_u8((timestamp_ms >> 24) as u8);
        self.buf.put_uint(0, 3);
        self.buf.put_slice(body);
        self.buf.put_u32((body.len() + TAG_HEADER_LENGTH) as u32);
    }

    /// Everything written since the last call.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

fn put_amf_key(buf: &mut BytesMut, key: &str) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key.as_bytes());
}

fn put_amf_string(buf: &mut BytesMut, value: &str) {
    buf.put_u8(amf0::STRING);
    put_amf_key(buf, value);
}

/// FLV timestamps are milliseconds and wrap after 2^32.
pub fn timestamp_ms(pts_ns: u64) -> u32 {
    (pts_ns / 1_000_000) as u32
}

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::Muxer, "Muxes H.264 into an FLV stream")
        .port(PortTemplate::always(
            "sink",
            Direction::Input,
            Caps::from(FormatTemplate::new(vec![Encoding::H264])),
        ))
        .port(PortTemplate::always(
            "src",
            Direction::Output,
            Caps::from(FormatTemplate::new(vec![Encoding::Flv])),
        ))
        .caps_rule(CapsRule::Geometry)
}

pub struct FlvMuxerFactory {
    descriptor: Arc<StageDescriptor>,
}

impl FlvMuxerFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for FlvMuxerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for FlvMuxerFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        let contract = config.input_contract()?;
        Ok(Box::new(FlvMuxer {
            info: StreamInfo::from(&contract),
        }))
    }
}

struct FlvMuxer {
    info: StreamInfo,
}

impl Processor for FlvMuxer {
    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let (input, output) = io.into_single()?;
        let mut writer = FlvWriter::new();
        writer.write_header();
        writer.write_metadata(&self.info);

        let mut tags = 0u64;
        let mut sent_config = false;
        while let Some(buffer) = input.pop(&ctx.stop) {
            let Payload::Encoded(unit) = &buffer.payload else {
                anyhow::bail!("muxer received a non-encoded buffer");
            };
            let ts = timestamp_ms(buffer.pts_ns);
            if !sent_config {
                match &unit.codec_data {
                    Some(config) => {
                        writer.write_sequence_header(ts, config);
                        sent_config = true;
                    }
                    None => {
                        tracing::warn!(stage = %ctx.name, "Dropping unit before codec configuration");
                        continue;
                    }
                }
            }
            writer.write_video(ts, unit);
            let chunk = Buffer {
                pts_ns: buffer.pts_ns,
                duration_ns: buffer.duration_ns,
                sequence: tags,
                payload: Payload::Stream(writer.take()),
            };
            if !output.push(chunk, &ctx.stop).is_flowing() {
                break;
            }
            if tags == 0 {
                ctx.reporter.first_buffer();
            }
            tags += 1;
        }
        tracing::debug!(stage = %ctx.name, tags, "Muxer finished");
        Ok(())
    }
}
