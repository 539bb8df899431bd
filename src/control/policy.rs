//! Grid-power threshold policy

use std::fmt;

use serde::Serialize;

/// Grid power above which surplus is stored, in watts
pub const DEFAULT_THRESHOLD_WATTS: i64 = 300;

/// Target storage mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlDecision {
    Charging,
    Discharging,
}

impl ControlDecision {
    /// Wire value of the `batteryTarget` property
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlDecision::Charging => "charging",
            ControlDecision::Discharging => "discharging",
        }
    }
}

impl fmt::Display for ControlDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry that could not be turned into a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    MalformedTelemetry { payload: String, reason: String },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::MalformedTelemetry { payload, reason } => {
                write!(f, "Malformed telemetry {:?}: {}", payload, reason)
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Crisp threshold without hysteresis: strictly above the threshold charges,
/// everything else discharges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    threshold: i64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_WATTS)
    }
}

impl ThresholdPolicy {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn decide(&self, watts: i64) -> ControlDecision {
        if watts > self.threshold {
            ControlDecision::Charging
        } else {
            ControlDecision::Discharging
        }
    }

    /// Parse a payload and decide
    pub fn evaluate(&self, payload: &[u8]) -> Result<(i64, ControlDecision), PolicyError> {
        let watts = parse_grid_power(payload)?;
        Ok((watts, self.decide(watts)))
    }
}

/// Parse a UTF-8 decimal integer, surrounding whitespace allowed
pub fn parse_grid_power(payload: &[u8]) -> Result<i64, PolicyError> {
    let malformed = |reason: String| PolicyError::MalformedTelemetry {
        payload: String::from_utf8_lossy(payload).into_owned(),
        reason,
    };

    let text = std::str::from_utf8(payload).map_err(|e| malformed(e.to_string()))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(malformed("empty payload".to_string()));
    }
    text.parse::<i64>().map_err(|e| malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(300, ControlDecision::Discharging ; "at threshold")]
    #[test_case(301, ControlDecision::Charging ; "just above")]
    #[test_case(450, ControlDecision::Charging ; "export")]
    #[test_case(120, ControlDecision::Discharging ; "low export")]
    #[test_case(-800, ControlDecision::Discharging ; "import")]
    #[test_case(0, ControlDecision::Discharging ; "zero")]
    fn test_decide(watts: i64, expected: ControlDecision) {
        assert_eq!(ThresholdPolicy::default().decide(watts), expected);
    }

    #[test_case(b"450", 450 ; "plain")]
    #[test_case(b" 120\n", 120 ; "whitespace")]
    #[test_case(b"-35", -35 ; "negative")]
    #[test_case(b"+301", 301 ; "explicit sign")]
    fn test_parse_grid_power(payload: &[u8], expected: i64) {
        assert_eq!(parse_grid_power(payload), Ok(expected));
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"   " ; "blank")]
    #[test_case(b"abc" ; "text")]
    #[test_case(b"12.5" ; "fraction")]
    #[test_case(b"{\"power\":450}" ; "json")]
    #[test_case(b"\xff\xfe" ; "invalid utf8")]
    #[test_case(b"99999999999999999999" ; "overflow")]
    fn test_malformed_payload(payload: &[u8]) {
        assert!(matches!(
            ThresholdPolicy::default().evaluate(payload),
            Err(PolicyError::MalformedTelemetry { .. })
        ));
    }

    #[test]
    fn test_custom_threshold() {
        let policy = ThresholdPolicy::new(0);
        assert_eq!(policy.decide(1), ControlDecision::Charging);
        assert_eq!(policy.decide(0), ControlDecision::Discharging);
    }

    #[test]
    fn test_decision_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ControlDecision::Charging).unwrap(),
            "\"charging\""
        );
        assert_eq!(ControlDecision::Discharging.to_string(), "discharging");
    }

    proptest! {
        #[test]
        fn charging_iff_above_threshold(watts in any::<i64>()) {
            let decision = ThresholdPolicy::default().decide(watts);
            prop_assert_eq!(decision == ControlDecision::Charging, watts > 300);
        }

        #[test]
        fn numeric_payloads_evaluate(watts in -100_000i64..100_000) {
            let payload = watts.to_string();
            let (parsed, decision) = ThresholdPolicy::default().evaluate(payload.as_bytes()).unwrap();
            prop_assert_eq!(parsed, watts);
            prop_assert_eq!(decision, ThresholdPolicy::default().decide(watts));
        }

        #[test]
        fn non_numeric_payloads_are_rejected(text in "[a-zA-Z_ ]{0,12}") {
            prop_assert!(ThresholdPolicy::default().evaluate(text.as_bytes()).is_err());
        }
    }
}
