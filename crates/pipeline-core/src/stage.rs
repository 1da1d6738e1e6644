//! Stages, their kinds, option schemas, and port templates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use livemix_common::error::{LivemixError, LivemixResult};

use crate::format::{Caps, Fraction};
use crate::port::{Direction, PortId, Presence, StageId};
use crate::provider::CapabilityProvider;

/// The role a stage plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Capture,
    Overlay,
    Compositor,
    Junction,
    Queue,
    Convert,
    Encoder,
    Muxer,
    NetworkSink,
    LocalSink,
}

impl StageKind {
    pub const ALL: [StageKind; 10] = [
        Self::Capture,
        Self::Overlay,
        Self::Compositor,
        Self::Junction,
        Self::Queue,
        Self::Convert,
        Self::Encoder,
        Self::Muxer,
        Self::NetworkSink,
        Self::LocalSink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Overlay => "overlay",
            Self::Compositor => "compositor",
            Self::Junction => "junction",
            Self::Queue => "queue",
            Self::Convert => "convert",
            Self::Encoder => "encoder",
            Self::Muxer => "muxer",
            Self::NetworkSink => "network-sink",
            Self::LocalSink => "local-sink",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown stage kind '{s}'"))
    }
}

/// A stage option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Fraction(Fraction),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_fraction(&self) -> Option<Fraction> {
        match self {
            Self::Fraction(f) => Some(*f),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::Fraction(_) => "fraction",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Fraction(r) => write!(f, "{r}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Fraction> for OptionValue {
    fn from(v: Fraction) -> Self {
        Self::Fraction(v)
    }
}

/// Type and constraints of an option.
#[derive(Debug, Clone)]
pub enum OptionType {
    Bool,
    Int { min: i64, max: i64 },
    Str,
    /// Named values; an integer selects the entry with that numeric value.
    Enum(&'static [(&'static str, i64)]),
    Fraction,
}

/// Declared option of a stage kind.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub key: &'static str,
    pub ty: OptionType,
    pub default: OptionValue,
    pub blurb: &'static str,
}

impl OptionSpec {
    pub fn boolean(key: &'static str, default: bool, blurb: &'static str) -> Self {
        Self {
            key,
            ty: OptionType::Bool,
            default: OptionValue::Bool(default),
            blurb,
        }
    }

    pub fn int(key: &'static str, min: i64, max: i64, default: i64, blurb: &'static str) -> Self {
        Self {
            key,
            ty: OptionType::Int { min, max },
            default: OptionValue::Int(default),
            blurb,
        }
    }

    pub fn string(key: &'static str, default: &str, blurb: &'static str) -> Self {
        Self {
            key,
            ty: OptionType::Str,
            default: OptionValue::Str(default.to_string()),
            blurb,
        }
    }

    pub fn enumeration(
        key: &'static str,
        values: &'static [(&'static str, i64)],
        default: &'static str,
        blurb: &'static str,
    ) -> Self {
        Self {
            key,
            ty: OptionType::Enum(values),
            default: OptionValue::Str(default.to_string()),
            blurb,
        }
    }

    /// Check `value` against the constraints, normalizing enum values to
    /// their nick.
    pub fn validate(&self, value: OptionValue) -> Result<OptionValue, String> {
        match (&self.ty, value) {
            (OptionType::Bool, v @ OptionValue::Bool(_)) => Ok(v),
            (OptionType::Int { min, max }, OptionValue::Int(i)) => {
                if i < *min || i > *max {
                    Err(format!("value {i} is outside [{min}, {max}]"))
                } else {
                    Ok(OptionValue::Int(i))
                }
            }
            (OptionType::Str, v @ OptionValue::Str(_)) => Ok(v),
            (OptionType::Fraction, OptionValue::Fraction(f)) => positive_fraction(f),
            (OptionType::Fraction, OptionValue::Str(s)) => positive_fraction(s.parse::<Fraction>()?),
            (OptionType::Enum(values), OptionValue::Str(s)) => values
                .iter()
                .find(|(nick, _)| *nick == s)
                .map(|(nick, _)| OptionValue::Str(nick.to_string()))
                .ok_or_else(|| format!("'{s}' is not one of {}", enum_nicks(values))),
            (OptionType::Enum(values), OptionValue::Int(i)) => values
                .iter()
                .find(|(_, v)| *v == i)
                .map(|(nick, _)| OptionValue::Str(nick.to_string()))
                .ok_or_else(|| format!("{i} is not a valid value for {}", enum_nicks(values))),
            (ty, v) => Err(format!("expected {ty:?}, got {}", v.type_name())),
        }
    }
}

fn positive_fraction(f: Fraction) -> Result<OptionValue, String> {
    if f.num == 0 {
        Err("fraction must be positive".to_string())
    } else {
        Ok(OptionValue::Fraction(f))
    }
}

fn enum_nicks(values: &[(&str, i64)]) -> String {
    let nicks: Vec<&str> = values.iter().map(|(n, _)| *n).collect();
    format!("[{}]", nicks.join(", "))
}

/// Declares a port (or a family of request ports) of a stage kind.
#[derive(Debug, Clone)]
pub struct PortTemplate {
    /// Port name; request templates contain `%u`, replaced by a counter.
    pub name: &'static str,
    pub direction: Direction,
    pub presence: Presence,
    pub caps: Caps,
    pub mandatory: bool,
    /// For request templates: how many connected ports the graph needs.
    pub min_count: usize,
}

impl PortTemplate {
    pub fn always(name: &'static str, direction: Direction, caps: Caps) -> Self {
        Self {
            name,
            direction,
            presence: Presence::Always,
            caps,
            mandatory: true,
            min_count: 0,
        }
    }

    pub fn request(name: &'static str, direction: Direction, caps: Caps) -> Self {
        Self {
            name,
            direction,
            presence: Presence::Request,
            caps,
            mandatory: false,
            min_count: 0,
        }
    }

    /// Requested ports must be connected, and at least `min_count` must exist.
    pub fn required(mut self, min_count: usize) -> Self {
        self.mandatory = true;
        self.min_count = min_count;
        self
    }

    pub(crate) fn port_name(&self, counter: u32) -> String {
        self.name.replace("%u", &counter.to_string())
    }
}

/// How a stage derives output capabilities once its inputs are negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsRule {
    /// Outputs always advertise their template.
    Template,
    /// Outputs carry exactly what the input carries, and vice versa.
    Passthrough,
    /// Outputs keep the input's width, height, and frame rate.
    Geometry,
    /// Outputs take width and height from the `width`/`height` options and
    /// the frame rate from the inputs.
    Canvas,
}

/// Everything a capability provider declares about a stage kind.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub kind: StageKind,
    pub description: &'static str,
    pub templates: Vec<PortTemplate>,
    pub options: Vec<OptionSpec>,
    pub caps_rule: CapsRule,
}

impl StageDescriptor {
    pub fn new(kind: StageKind, description: &'static str) -> Self {
        Self {
            kind,
            description,
            templates: Vec::new(),
            options: Vec::new(),
            caps_rule: CapsRule::Template,
        }
    }

    pub fn port(mut self, template: PortTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn option(mut self, spec: OptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    pub fn caps_rule(mut self, rule: CapsRule) -> Self {
        self.caps_rule = rule;
        self
    }

    pub fn option_spec(&self, key: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.key == key)
    }

    pub fn request_template(&self, direction: Direction) -> Option<&PortTemplate> {
        self.templates
            .iter()
            .find(|t| t.direction == direction && t.presence == Presence::Request)
    }

    pub fn always_templates(&self) -> impl Iterator<Item = &PortTemplate> {
        self.templates
            .iter()
            .filter(|t| t.presence == Presence::Always)
    }
}

/// A named processing unit in the graph.
#[derive(Debug, Clone)]
pub struct Stage {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) descriptor: Arc<StageDescriptor>,
    pub(crate) options: BTreeMap<String, OptionValue>,
    pub(crate) ports: Vec<PortId>,
    pub(crate) request_counter: u32,
}

impl Stage {
    /// Create a stage of `kind` as offered by `provider`, applying `options`.
    pub fn create<'a>(
        provider: &dyn CapabilityProvider,
        kind: StageKind,
        name: &str,
        options: impl IntoIterator<Item = (&'a str, OptionValue)>,
    ) -> LivemixResult<Stage> {
        let descriptor = provider
            .describe(kind)
            .ok_or_else(|| LivemixError::UnavailableCapability {
                kind: kind.to_string(),
            })?;
        let mut stage = Stage {
            id: StageId(u32::MAX),
            name: name.to_string(),
            descriptor,
            options: BTreeMap::new(),
            ports: Vec::new(),
            request_counter: 0,
        };
        for (key, value) in options {
            stage.set_option(key, value)?;
        }
        Ok(stage)
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.descriptor.kind
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    /// Validate and store an option.
    pub fn set_option(&mut self, key: &str, value: impl Into<OptionValue>) -> LivemixResult<()> {
        let spec = self
            .descriptor
            .option_spec(key)
            .ok_or_else(|| {
                LivemixError::invalid_option(
                    &self.name,
                    key,
                    format!("unknown option for {} stages", self.kind()),
                )
            })?;
        let value = spec
            .validate(value.into())
            .map_err(|msg| LivemixError::invalid_option(&self.name, key, msg))?;
        tracing::trace!(stage = %self.name, key, %value, "Option set");
        self.options.insert(key.to_string(), value);
        Ok(())
    }

    /// Current value of an option, falling back to its declared default.
    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options
            .get(key)
            .or_else(|| self.descriptor.option_spec(key).map(|s| &s.default))
    }

    /// All options with defaults filled in.
    pub fn resolved_options(&self) -> BTreeMap<String, OptionValue> {
        self.descriptor
            .options
            .iter()
            .map(|spec| {
                let value = self.options.get(spec.key).unwrap_or(&spec.default);
                (spec.key.to_string(), value.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNE: &[(&str, i64)] = &[("none", 0), ("stillimage", 1), ("fastdecode", 2), ("zerolatency", 4)];

    #[test]
    fn test_int_range_rejects_negative() {
        let spec = OptionSpec::int("bitrate", 1, 2_048_000, 2048, "kbit/s");
        assert!(spec.validate(OptionValue::Int(-1)).is_err());
        assert_eq!(spec.validate(OptionValue::Int(3000)), Ok(OptionValue::Int(3000)));
    }

    #[test]
    fn test_enum_accepts_nick_or_number() {
        let spec = OptionSpec::enumeration("tune", TUNE, "none", "tuning");
        assert_eq!(
            spec.validate(OptionValue::Int(4)),
            Ok(OptionValue::Str("zerolatency".into()))
        );
        assert_eq!(
            spec.validate(OptionValue::from("fastdecode")),
            Ok(OptionValue::Str("fastdecode".into()))
        );
        assert!(spec.validate(OptionValue::Int(3)).is_err());
        assert!(spec.validate(OptionValue::from("film")).is_err());
    }

    #[test]
    fn test_fraction_must_be_positive_in_any_form() {
        let spec = OptionSpec {
            key: "framerate",
            ty: OptionType::Fraction,
            default: OptionValue::Fraction(Fraction::new(30, 1)),
            blurb: "rate",
        };
        assert!(spec.validate(OptionValue::Fraction(Fraction::new(0, 1))).is_err());
        assert!(spec.validate(OptionValue::Str("0/1".into())).is_err());
        assert_eq!(
            spec.validate(OptionValue::Str("30000/1001".into())),
            Ok(OptionValue::Fraction(Fraction::new(30000, 1001)))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let spec = OptionSpec::boolean("is-live", false, "live");
        let err = spec.validate(OptionValue::Int(1)).unwrap_err();
        assert!(err.contains("got int"));
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in StageKind::ALL {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
    }
}
