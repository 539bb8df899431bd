//! Writable device properties
//!
//! Each write is validated or clamped the way the device firmware expects
//! before it is rendered into the `properties/write` body.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map, Value};

use super::policy::ControlDecision;

/// Charge limit bounds, percent
const SOC_SET_RANGE: std::ops::RangeInclusive<i64> = 41..=100;
/// Discharge limit bounds, percent
const MIN_SOC_RANGE: std::ops::RangeInclusive<i64> = 1..=89;
const MIN_LIMIT_WATTS: i64 = 30;
const MAX_OUTPUT_WATTS: i64 = 1200;
const MAX_INPUT_WATTS: i64 = 900;
const MAX_INPUT_WATTS_HYPER: i64 = 1200;

/// Property names accepted on the command line
pub const PROPERTY_NAMES: [&str; 6] = [
    "batteryTarget",
    "acMode",
    "socSet",
    "minSoc",
    "outputLimit",
    "inputLimit",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    UnknownProperty(String),
    InvalidValue { property: &'static str, value: String },
    OutOfRange { property: &'static str, value: i64 },
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyError::UnknownProperty(name) => write!(
                f,
                "Unknown property '{}' (expected one of {})",
                name,
                PROPERTY_NAMES.join(", ")
            ),
            PropertyError::InvalidValue { property, value } => {
                write!(f, "Invalid value '{}' for {}", value, property)
            }
            PropertyError::OutOfRange { property, value } => {
                write!(f, "Value {} out of range for {}", value, property)
            }
        }
    }
}

impl std::error::Error for PropertyError {}

/// A validated property write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyWrite {
    BatteryTarget(ControlDecision),
    AcMode(u8),
    /// Charge limit in percent x 10
    SocSet(i64),
    /// Discharge limit in percent x 10
    MinSoc(i64),
    /// Watts
    OutputLimit(i64),
    /// Watts
    InputLimit(i64),
}

impl PropertyWrite {
    pub fn ac_mode(mode: i64) -> Result<Self, PropertyError> {
        match mode {
            0..=2 => Ok(PropertyWrite::AcMode(mode as u8)),
            _ => Err(PropertyError::OutOfRange {
                property: "acMode",
                value: mode,
            }),
        }
    }

    pub fn charge_limit(percent: i64) -> Result<Self, PropertyError> {
        if SOC_SET_RANGE.contains(&percent) {
            Ok(PropertyWrite::SocSet(percent * 10))
        } else {
            Err(PropertyError::OutOfRange {
                property: "socSet",
                value: percent,
            })
        }
    }

    pub fn discharge_limit(percent: i64) -> Result<Self, PropertyError> {
        if MIN_SOC_RANGE.contains(&percent) {
            Ok(PropertyWrite::MinSoc(percent * 10))
        } else {
            Err(PropertyError::OutOfRange {
                property: "minSoc",
                value: percent,
            })
        }
    }

    /// Clamp to 30..=1200 W. Products other than "hyper" only accept 30, 60
    /// and 90 below 100 W.
    pub fn output_limit(watts: f64, product_name: Option<&str>) -> Self {
        let mut limit = round_watts(watts).clamp(MIN_LIMIT_WATTS, MAX_OUTPUT_WATTS);

        if let Some(name) = product_name {
            if !name.to_lowercase().contains("hyper") && limit < 100 {
                limit = match limit {
                    91..=99 => 90,
                    61..=90 => 60,
                    31..=60 => 30,
                    other => other,
                };
            }
        }
        PropertyWrite::OutputLimit(limit)
    }

    /// Clamp to 30 W..=max (1200 W for "hyper", else 900 W). "ace" products
    /// take 100 W steps. Halves round to even, so 450 W becomes 400 W.
    pub fn input_limit(watts: f64, product_name: Option<&str>) -> Self {
        let name = product_name.unwrap_or_default().to_lowercase();
        let max = if name.contains("hyper") {
            MAX_INPUT_WATTS_HYPER
        } else {
            MAX_INPUT_WATTS
        };

        let mut limit = round_watts(watts);
        if name.contains("ace") {
            limit = round_watts(limit as f64 / 100.0) * 100;
        }
        PropertyWrite::InputLimit(limit.clamp(MIN_LIMIT_WATTS, max))
    }

    /// Parse a command-line property write
    pub fn parse(property: &str, value: &str, product_name: Option<&str>) -> Result<Self, PropertyError> {
        match property {
            "batteryTarget" => match value {
                "charging" => Ok(PropertyWrite::BatteryTarget(ControlDecision::Charging)),
                "discharging" => Ok(PropertyWrite::BatteryTarget(ControlDecision::Discharging)),
                _ => Err(invalid("batteryTarget", value)),
            },
            "acMode" => Self::ac_mode(parse_int("acMode", value)?),
            "socSet" => Self::charge_limit(parse_int("socSet", value)?),
            "minSoc" => Self::discharge_limit(parse_int("minSoc", value)?),
            "outputLimit" => Ok(Self::output_limit(
                parse_number("outputLimit", value)?,
                product_name,
            )),
            "inputLimit" => Ok(Self::input_limit(
                parse_number("inputLimit", value)?,
                product_name,
            )),
            other => Err(PropertyError::UnknownProperty(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PropertyWrite::BatteryTarget(_) => "batteryTarget",
            PropertyWrite::AcMode(_) => "acMode",
            PropertyWrite::SocSet(_) => "socSet",
            PropertyWrite::MinSoc(_) => "minSoc",
            PropertyWrite::OutputLimit(_) => "outputLimit",
            PropertyWrite::InputLimit(_) => "inputLimit",
        }
    }

    pub fn value(&self) -> Value {
        match self {
            PropertyWrite::BatteryTarget(decision) => json!(decision),
            PropertyWrite::AcMode(mode) => json!(mode),
            PropertyWrite::SocSet(v)
            | PropertyWrite::MinSoc(v)
            | PropertyWrite::OutputLimit(v)
            | PropertyWrite::InputLimit(v) => json!(v),
        }
    }

    /// `{"properties": {<name>: <value>}}`
    pub fn to_body(&self) -> Value {
        let mut properties = Map::new();
        properties.insert(self.name().to_string(), self.value());
        json!({ "properties": properties })
    }
}

impl From<ControlDecision> for PropertyWrite {
    fn from(decision: ControlDecision) -> Self {
        PropertyWrite::BatteryTarget(decision)
    }
}

impl FromStr for ControlDecision {
    type Err = PropertyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match PropertyWrite::parse("batteryTarget", s, None)? {
            PropertyWrite::BatteryTarget(decision) => Ok(decision),
            _ => Err(invalid("batteryTarget", s)),
        }
    }
}

fn round_watts(watts: f64) -> i64 {
    if watts.is_finite() {
        watts.round_ties_even() as i64
    } else {
        0
    }
}

fn invalid(property: &'static str, value: &str) -> PropertyError {
    PropertyError::InvalidValue {
        property,
        value: value.to_string(),
    }
}

fn parse_int(property: &'static str, value: &str) -> Result<i64, PropertyError> {
    value.trim().parse().map_err(|_| invalid(property, value))
}

fn parse_number(property: &'static str, value: &str) -> Result<f64, PropertyError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(property, value))
}
