/*!
 * Telemetry samples.
 *
 * A sample is one timestamped reading on a named channel, decoded as a number
 * or a flag when possible and kept as raw bytes otherwise.
 */
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Decoded value carried by a telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    /// Numeric reading (ADC counts, temperatures, duty cycles)
    Numeric(f64),
    /// Boolean reading (pin levels, relay states)
    Boolean(bool),
    /// Undecoded payload
    Raw(Bytes),
}

impl SampleValue {
    /// Numeric projection used for plotting and min/max decimation
    ///
    /// Booleans map to 0.0/1.0; raw payloads have no numeric form.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Numeric(v) => Some(*v),
            SampleValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            SampleValue::Raw(_) => None,
        }
    }

    /// Interpret a textual reading from an ASCII protocol
    pub fn parse(text: &str) -> SampleValue {
        match Value::parse_scalar(text) {
            Value::Integer(i) => SampleValue::Numeric(i as f64),
            Value::Float(f) => SampleValue::Numeric(f),
            Value::Bool(b) => SampleValue::Boolean(b),
            _ => SampleValue::Raw(Bytes::copy_from_slice(text.trim().as_bytes())),
        }
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Numeric(v)
    }
}

impl From<bool> for SampleValue {
    fn from(b: bool) -> Self {
        SampleValue::Boolean(b)
    }
}

impl From<Bytes> for SampleValue {
    fn from(b: Bytes) -> Self {
        SampleValue::Raw(b)
    }
}

/// One decoded telemetry reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Time the frame was decoded
    pub timestamp: DateTime<Utc>,
    /// Channel (stream) the reading belongs to
    pub channel: String,
    /// The reading
    pub value: SampleValue,
}

impl TelemetrySample {
    /// Create a sample stamped with the current time
    pub fn now<C: Into<String>, V: Into<SampleValue>>(channel: C, value: V) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: channel.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            SampleValue::Numeric(v) => write!(f, "{} {}={}", self.timestamp, self.channel, v),
            SampleValue::Boolean(b) => write!(f, "{} {}={}", self.timestamp, self.channel, b),
            SampleValue::Raw(b) => write!(f, "{} {}=<{} bytes>", self.timestamp, self.channel, b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_values() {
        assert_eq!(SampleValue::parse("512"), SampleValue::Numeric(512.0));
        assert_eq!(SampleValue::parse("21.5"), SampleValue::Numeric(21.5));
        assert_eq!(SampleValue::parse("true"), SampleValue::Boolean(true));
        assert_eq!(
            SampleValue::parse("fault"),
            SampleValue::Raw(Bytes::from_static(b"fault"))
        );
    }

    #[test]
    fn test_numeric_projection() {
        assert_eq!(SampleValue::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(SampleValue::Numeric(-2.0).as_f64(), Some(-2.0));
        assert_eq!(SampleValue::Raw(Bytes::new()).as_f64(), None);
    }

    #[test]
    fn test_sample_serializes_tagged() {
        let sample = TelemetrySample::now("adc0", 3.0);
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["channel"], "adc0");
        assert_eq!(json["value"]["kind"], "numeric");
        assert_eq!(json["value"]["value"], 3.0);
    }
}
