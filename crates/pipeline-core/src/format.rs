//! Format contracts and capability negotiation.
//!
//! A [`FormatContract`] is the fully fixed description of what one connection
//! carries. Ports advertise [`Caps`]: an ordered list of [`FormatTemplate`]s,
//! each possibly leaving width, height or frame rate open. Linking intersects
//! the two sides and fixates the first surviving template.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width used when negotiation leaves the width open on both sides.
pub const DEFAULT_WIDTH: u32 = 320;
/// Height used when negotiation leaves the height open on both sides.
pub const DEFAULT_HEIGHT: u32 = 240;
/// Frame rate used when negotiation leaves the rate open on both sides.
pub const DEFAULT_FRAMERATE: Fraction = Fraction { num: 30, den: 1 };

/// Raw pixel layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling.
    I420,
    /// Planar Y followed by interleaved UV, 2x2 subsampled.
    Nv12,
    /// Packed 8-bit R, G, B, A.
    Rgba,
    /// Packed 8-bit B, G, R, A.
    Bgra,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 4] = [Self::I420, Self::Nv12, Self::Rgba, Self::Bgra];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I420 => "I420",
            Self::Nv12 => "NV12",
            Self::Rgba => "RGBA",
            Self::Bgra => "BGRA",
        }
    }

    /// Whether the layout is luma/chroma 4:2:0.
    pub fn is_yuv(&self) -> bool {
        matches!(self, Self::I420 | Self::Nv12)
    }

    /// Byte size of one frame of `width` x `height`.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.planes(width, height)
            .iter()
            .map(|p| p.stride * p.rows)
            .sum()
    }

    /// Plane layout of one frame, in storage order.
    pub fn planes(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            Self::I420 => {
                let y = PlaneLayout { offset: 0, stride: w, rows: h };
                let u = PlaneLayout { offset: w * h, stride: cw, rows: ch };
                let v = PlaneLayout { offset: w * h + cw * ch, stride: cw, rows: ch };
                vec![y, u, v]
            }
            Self::Nv12 => {
                let y = PlaneLayout { offset: 0, stride: w, rows: h };
                let uv = PlaneLayout { offset: w * h, stride: cw * 2, rows: ch };
                vec![y, uv]
            }
            Self::Rgba | Self::Bgra => vec![PlaneLayout { offset: 0, stride: w * 4, rows: h }],
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "I420" => Ok(Self::I420),
            "NV12" => Ok(Self::Nv12),
            "RGBA" => Ok(Self::Rgba),
            "BGRA" => Ok(Self::Bgra),
            other => Err(format!("unknown pixel format '{other}'")),
        }
    }
}

/// Location of one plane inside a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// What a connection carries: raw frames in some pixel layout or an encoded
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Raw(PixelFormat),
    H264,
    Flv,
}

impl Encoding {
    pub fn all_raw() -> Vec<Encoding> {
        PixelFormat::ALL.iter().copied().map(Encoding::Raw).collect()
    }

    /// Every encoding, raw layouts first.
    pub fn all() -> Vec<Encoding> {
        let mut all = Self::all_raw();
        all.extend([Encoding::H264, Encoding::Flv]);
        all
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self {
            Self::Raw(pf) => Some(*pf),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(pf) => write!(f, "video/x-raw,format={pf}"),
            Self::H264 => f.write_str("video/x-h264"),
            Self::Flv => f.write_str("video/x-flv"),
        }
    }
}

/// A frame rate as a reduced fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    /// Create a reduced fraction. A zero denominator is treated as 1.
    pub fn new(num: u32, den: u32) -> Self {
        let den = den.max(1);
        let g = gcd(num, den).max(1);
        Self {
            num: num / g,
            den: den / g,
        }
    }

    /// Nominal duration of one frame, in nanoseconds.
    pub fn frame_duration_ns(&self) -> u64 {
        if self.num == 0 {
            return 0;
        }
        u64::from(self.den) * 1_000_000_000 / u64::from(self.num)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Fraction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = s.split_once('/').unwrap_or((s, "1"));
        let num = num
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid numerator in '{s}': {e}"))?;
        let den = den
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid denominator in '{s}': {e}"))?;
        if den == 0 {
            return Err(format!("zero denominator in '{s}'"));
        }
        Ok(Self::new(num, den))
    }
}

/// The fixed shape and rate of data on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatContract {
    pub encoding: Encoding,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
}

impl FormatContract {
    pub fn raw(format: PixelFormat, width: u32, height: u32, framerate: Fraction) -> Self {
        Self {
            encoding: Encoding::Raw(format),
            width,
            height,
            framerate,
        }
    }

    /// Same geometry and rate, different encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        self.encoding.pixel_format()
    }

    /// Contracts are compatible only when identical.
    pub fn is_compatible(&self, other: &FormatContract) -> bool {
        self == other
    }
}

impl fmt::Display for FormatContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},width={},height={},framerate={}",
            self.encoding, self.width, self.height, self.framerate
        )
    }
}

/// A partially specified contract. `None` fields accept any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTemplate {
    /// Accepted encodings in order of preference.
    pub encodings: Vec<Encoding>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Fraction>,
}

impl FormatTemplate {
    pub fn new(encodings: impl Into<Vec<Encoding>>) -> Self {
        Self {
            encodings: encodings.into(),
            width: None,
            height: None,
            framerate: None,
        }
    }

    pub fn raw(formats: &[PixelFormat]) -> Self {
        Self::new(formats.iter().copied().map(Encoding::Raw).collect::<Vec<_>>())
    }

    pub fn any_raw() -> Self {
        Self::new(Encoding::all_raw())
    }

    pub fn fixed(contract: &FormatContract) -> Self {
        Self {
            encodings: vec![contract.encoding],
            width: Some(contract.width),
            height: Some(contract.height),
            framerate: Some(contract.framerate),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_framerate(mut self, framerate: Fraction) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn accepts(&self, contract: &FormatContract) -> bool {
        self.encodings.contains(&contract.encoding)
            && self.width.map_or(true, |w| w == contract.width)
            && self.height.map_or(true, |h| h == contract.height)
            && self.framerate.map_or(true, |r| r == contract.framerate)
    }

    /// Intersection keeping this template's encoding order.
    pub fn intersect(&self, other: &FormatTemplate) -> Option<FormatTemplate> {
        let encodings: Vec<Encoding> = self
            .encodings
            .iter()
            .copied()
            .filter(|e| other.encodings.contains(e))
            .collect();
        if encodings.is_empty() {
            return None;
        }
        Some(FormatTemplate {
            encodings,
            width: merge_field(self.width, other.width)?,
            height: merge_field(self.height, other.height)?,
            framerate: merge_field(self.framerate, other.framerate)?,
        })
    }

    /// Pick a concrete contract: the first encoding, open fields defaulted.
    ///
    /// Returns `None` for a template without encodings.
    pub fn fixate(&self) -> Option<FormatContract> {
        Some(FormatContract {
            encoding: *self.encodings.first()?,
            width: self.width.unwrap_or(DEFAULT_WIDTH),
            height: self.height.unwrap_or(DEFAULT_HEIGHT),
            framerate: self.framerate.unwrap_or(DEFAULT_FRAMERATE),
        })
    }
}

/// `Some(merged)` when compatible, `None` on conflict.
fn merge_field<T: PartialEq + Copy>(a: Option<T>, b: Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (Some(a), Some(b)) if a != b => None,
        (Some(a), _) => Some(Some(a)),
        (None, b) => Some(b),
    }
}

impl fmt::Display for FormatTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encodings: Vec<String> = self.encodings.iter().map(|e| e.to_string()).collect();
        write!(f, "{{{}}}", encodings.join(" | "))?;
        if let Some(w) = self.width {
            write!(f, ",width={w}")?;
        }
        if let Some(h) = self.height {
            write!(f, ",height={h}")?;
        }
        if let Some(r) = self.framerate {
            write!(f, ",framerate={r}")?;
        }
        Ok(())
    }
}

/// The ordered set of templates a port can carry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Caps {
    templates: Vec<FormatTemplate>,
}

impl Caps {
    pub fn new(templates: Vec<FormatTemplate>) -> Self {
        Self { templates }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn any_raw() -> Self {
        Self::new(vec![FormatTemplate::any_raw()])
    }

    /// Accepts any encoding and geometry.
    pub fn any() -> Self {
        Self::new(vec![FormatTemplate::new(Encoding::all())])
    }

    pub fn fixed(contract: &FormatContract) -> Self {
        Self::new(vec![FormatTemplate::fixed(contract)])
    }

    pub fn templates(&self) -> &[FormatTemplate] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn accepts(&self, contract: &FormatContract) -> bool {
        self.templates.iter().any(|t| t.accepts(contract))
    }

    /// Non-empty pairwise intersections, upstream order first.
    pub fn intersect(&self, downstream: &Caps) -> Caps {
        let templates = self
            .templates
            .iter()
            .flat_map(|up| downstream.templates.iter().filter_map(|down| up.intersect(down)))
            .collect();
        Caps { templates }
    }

    /// The first mutually supported contract, or `None` if there is none.
    pub fn negotiate(&self, downstream: &Caps) -> Option<FormatContract> {
        self.intersect(downstream)
            .templates
            .first()
            .and_then(FormatTemplate::fixate)
    }

    /// Apply `f` to every template, dropping the ones it rejects.
    pub fn map(&self, f: impl Fn(&FormatTemplate) -> Option<FormatTemplate>) -> Caps {
        Caps {
            templates: self.templates.iter().filter_map(f).collect(),
        }
    }
}

impl From<FormatTemplate> for Caps {
    fn from(template: FormatTemplate) -> Self {
        Self::new(vec![template])
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.templates.is_empty() {
            return f.write_str("EMPTY");
        }
        let parts: Vec<String> = self.templates.iter().map(|t| t.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}
