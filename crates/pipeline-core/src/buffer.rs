//! Data units that travel over connections.

use bytes::{Bytes, BytesMut};

use crate::format::{FormatContract, PixelFormat, PlaneLayout};

/// An immutable raw video frame. Cloning shares the pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl VideoFrame {
    /// Wrap pixel data, checking it has exactly the expected size.
    pub fn new(format: PixelFormat, width: u32, height: u32, data: Bytes) -> anyhow::Result<Self> {
        let expected = format.frame_size(width, height);
        anyhow::ensure!(
            data.len() == expected,
            "{format} {width}x{height} frame needs {expected} bytes, got {}",
            data.len()
        );
        Ok(Self {
            format,
            width,
            height,
            data,
        })
    }

    pub fn planes(&self) -> Vec<PlaneLayout> {
        self.format.planes(self.width, self.height)
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let layout = self.planes().get(index).copied()?;
        self.data.get(layout.range())
    }

    /// Whether the frame has the shape a contract promises.
    pub fn matches(&self, contract: &FormatContract) -> bool {
        contract.pixel_format() == Some(self.format)
            && contract.width == self.width
            && contract.height == self.height
    }

    /// Copy into a writable frame.
    pub fn to_mut(&self) -> VideoFrameMut {
        VideoFrameMut {
            format: self.format,
            width: self.width,
            height: self.height,
            data: BytesMut::from(&self.data[..]),
        }
    }
}

/// A writable raw video frame.
#[derive(Debug, Clone)]
pub struct VideoFrameMut {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: BytesMut,
}

impl VideoFrameMut {
    /// A zero-filled frame.
    pub fn zeroed(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            data: BytesMut::zeroed(format.frame_size(width, height)),
        }
    }

    pub fn planes(&self) -> Vec<PlaneLayout> {
        self.format.planes(self.width, self.height)
    }

    pub fn freeze(self) -> VideoFrame {
        VideoFrame {
            format: self.format,
            width: self.width,
            height: self.height,
            data: self.data.freeze(),
        }
    }
}

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub keyframe: bool,
    /// Codec configuration record, sent once ahead of the first unit.
    pub codec_data: Option<Bytes>,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Video(VideoFrame),
    Encoded(EncodedUnit),
    /// Container bytes ready for a sink.
    Stream(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Self::Video(f) => f.data.len(),
            Self::Encoded(u) => u.data.len(),
            Self::Stream(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A timestamped data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    /// Presentation time as pipeline running time.
    pub pts_ns: u64,
    pub duration_ns: u64,
    /// Per-producer counter, starting at zero.
    pub sequence: u64,
    pub payload: Payload,
}

impl Buffer {
    pub fn video(pts_ns: u64, duration_ns: u64, sequence: u64, frame: VideoFrame) -> Self {
        Self {
            pts_ns,
            duration_ns,
            sequence,
            payload: Payload::Video(frame),
        }
    }

    pub fn as_video(&self) -> Option<&VideoFrame> {
        match &self.payload {
            Payload::Video(f) => Some(f),
            _ => None,
        }
    }

    /// Same timing, new payload.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            pts_ns: self.pts_ns,
            duration_ns: self.duration_ns,
            sequence: self.sequence,
            payload,
        }
    }
}
