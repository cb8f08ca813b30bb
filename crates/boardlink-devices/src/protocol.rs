/*!
 * Wire protocol abstractions.
 *
 * A [`Protocol`] turns `(endpoint, args)` into request bytes and hands out a
 * streaming decoder that classifies inbound bytes into command responses,
 * unsolicited telemetry, or malformed frames. Sessions own one decoder per
 * read task and never interpret bytes themselves.
 */
use std::fmt::{self, Debug};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use boardlink_core::telemetry::TelemetrySample;
use boardlink_core::types::Value;

use crate::error::{DeviceError, Result};

/// Longest ASCII line accepted before the decoder resynchronizes
pub const MAX_LINE_LENGTH: usize = 1024;

/// Characters that delimit fields on the ASCII protocols
const DELIMITERS: [char; 4] = [',', ':', '\r', '\n'];

/// One classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Positive reply to the pending command
    Response(Value),
    /// Negative reply (ERR, ERROR, NAK) to the pending command
    Rejected(String),
    /// Unsolicited reading
    Telemetry(TelemetrySample),
    /// Bytes that do not form a valid frame
    Malformed {
        /// Why the frame was rejected
        reason: String,
        /// Offending bytes
        bytes: Bytes,
    },
    /// A complete frame whose checksum does not match
    ///
    /// Counts toward the malformed-frame threshold and fails the pending
    /// command with [`DeviceError::Checksum`].
    Corrupt {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
        /// The frame and any junk dropped with it
        bytes: Bytes,
    },
}

impl InboundFrame {
    /// Build a malformed frame from an offending line or byte run
    pub fn malformed<S: Into<String>, B: Into<Bytes>>(reason: S, bytes: B) -> Self {
        InboundFrame::Malformed {
            reason: reason.into(),
            bytes: bytes.into(),
        }
    }

    /// Why the frame counts toward the malformed-frame threshold, if it does
    pub fn malformed_reason(&self) -> Option<String> {
        match self {
            InboundFrame::Malformed { reason, .. } => Some(reason.clone()),
            InboundFrame::Corrupt {
                expected, actual, ..
            } => Some(
                DeviceError::Checksum {
                    expected: *expected,
                    actual: *actual,
                }
                .to_string(),
            ),
            _ => None,
        }
    }
}

/// An encoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Bytes to write
    pub bytes: Bytes,
    /// Whether the device answers this command
    pub expects_response: bool,
}

impl Request {
    /// A request that is answered by exactly one response frame
    pub fn new<B: Into<Bytes>>(bytes: B) -> Self {
        Self {
            bytes: bytes.into(),
            expects_response: true,
        }
    }

    /// A request the device does not acknowledge
    pub fn fire_and_forget<B: Into<Bytes>>(bytes: B) -> Self {
        Self {
            bytes: bytes.into(),
            expects_response: false,
        }
    }
}

/// Streaming decoder owned by a session's read task
pub type FrameDecoder = Box<dyn Decoder<Item = InboundFrame, Error = DeviceError> + Send>;

/// A device family's wire protocol
pub trait Protocol: Send + Sync + Debug {
    /// Short protocol name used in logs
    fn name(&self) -> &'static str;

    /// Encode a command for `endpoint`
    fn encode(&self, endpoint: &str, args: &[Value]) -> Result<Request>;

    /// Create a fresh decoder
    fn decoder(&self) -> FrameDecoder;
}

/// Ensure a single text field can be framed without escaping
pub fn check_field(what: &str, text: &str) -> Result<()> {
    if let Some(c) = text.chars().find(|c| DELIMITERS.contains(c)) {
        return Err(DeviceError::invalid_argument(format!(
            "{} {:?} contains delimiter {:?}",
            what, text, c
        )));
    }
    Ok(())
}

/// Validate an endpoint name for an ASCII protocol
pub fn check_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.trim().is_empty() {
        return Err(DeviceError::invalid_argument("endpoint is empty"));
    }
    check_field("endpoint", endpoint)
}

/// Render arguments in canonical form, joined by `,`
///
/// Arguments that would need escaping are rejected instead.
pub fn render_args(args: &[Value]) -> Result<String> {
    let mut rendered = Vec::with_capacity(args.len());
    for (index, arg) in args.iter().enumerate() {
        let text = arg.to_string();
        check_field(&format!("argument {}", index), &text)?;
        rendered.push(text);
    }
    Ok(rendered.join(","))
}

/// Fetch argument `index` or fail with `InvalidArgument`
pub fn arg<'a>(endpoint: &str, args: &'a [Value], index: usize) -> Result<&'a Value> {
    args.get(index).ok_or_else(|| {
        DeviceError::invalid_argument(format!("{} expects argument {}", endpoint, index))
    })
}

/// Fail unless exactly `count` arguments were given
pub fn expect_arity(endpoint: &str, args: &[Value], count: usize) -> Result<()> {
    if args.len() != count {
        return Err(DeviceError::invalid_argument(format!(
            "{} takes {} argument(s), got {}",
            endpoint,
            count,
            args.len()
        )));
    }
    Ok(())
}

/// Argument `index` as an integer in `0..=max`
pub fn arg_u8(endpoint: &str, args: &[Value], index: usize, max: u8) -> Result<u8> {
    let value = arg(endpoint, args, index)?;
    match value.as_integer() {
        Some(n) if (0..=i64::from(max)).contains(&n) => Ok(n as u8),
        Some(n) => Err(DeviceError::invalid_argument(format!(
            "{} argument {} out of range 0..={}: {}",
            endpoint, index, max, n
        ))),
        None => Err(DeviceError::invalid_argument(format!(
            "{} argument {} must be an integer, got {:?}",
            endpoint, index, value
        ))),
    }
}

/// Argument `index` as a level: booleans, 0/1, or HIGH/LOW
pub fn arg_level(endpoint: &str, args: &[Value], index: usize) -> Result<bool> {
    let value = arg(endpoint, args, index)?;
    value
        .as_bool()
        .or_else(|| match value.as_str().map(str::to_ascii_uppercase).as_deref() {
            Some("HIGH") | Some("ON") => Some(true),
            Some("LOW") | Some("OFF") => Some(false),
            _ => None,
        })
        .ok_or_else(|| {
            DeviceError::invalid_argument(format!(
                "{} argument {} must be a level, got {:?}",
                endpoint, index, value
            ))
        })
}

/// Line splitter shared by the ASCII protocols
///
/// Tolerates `\r\n`, skips blank lines and turns overlong or non-UTF-8 lines
/// into malformed frames instead of errors.
#[derive(Debug)]
pub struct LineFramer {
    lines: LinesCodec,
}

/// Result of pulling one line from the buffer
#[derive(Debug, PartialEq)]
pub enum Line {
    /// A complete, trimmed, non-empty line
    Text(String),
    /// A line that could not be decoded
    Malformed(InboundFrame),
}

impl LineFramer {
    /// Create a framer with the default line limit
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }

    /// Next line, or `None` when more bytes are needed
    pub fn next_line(&mut self, src: &mut BytesMut) -> Option<Line> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(Line::Text(trimmed.to_string()));
                }
                Ok(None) => return None,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Some(Line::Malformed(InboundFrame::malformed(
                        format!("line longer than {} bytes", MAX_LINE_LENGTH),
                        Bytes::new(),
                    )))
                }
                Err(LinesCodecError::Io(e)) => {
                    return Some(Line::Malformed(InboundFrame::malformed(
                        e.to_string(),
                        Bytes::new(),
                    )))
                }
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(text) => write!(f, "{:?}", text),
            Err(_) => {
                for (i, b) in self.bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_canonical_args() {
        let args = vec![
            Value::from(13),
            Value::from(true),
            Value::from(2.5),
            Value::from("OUTPUT"),
        ];
        assert_eq!(render_args(&args).unwrap(), "13,true,2.5,OUTPUT");
        assert_eq!(render_args(&[]).unwrap(), "");
    }

    #[test]
    fn test_delimiters_are_rejected() {
        for bad in ["a,b", "a:b", "line\n", "cr\r"] {
            let err = render_args(&[Value::from(bad)]).unwrap_err();
            assert!(matches!(err, DeviceError::InvalidArgument(_)), "{:?}", bad);
        }
        assert!(check_endpoint("").is_err());
        assert!(check_endpoint("servo:write").is_err());
        assert!(check_endpoint("servoWrite").is_ok());
    }

    #[test]
    fn test_argument_helpers() {
        let args = vec![Value::from(13), Value::from("HIGH"), Value::from(300)];
        assert_eq!(arg_u8("x", &args, 0, 255).unwrap(), 13);
        assert!(arg_level("x", &args, 1).unwrap());
        assert!(arg_u8("x", &args, 2, 255).is_err());
        assert!(arg_u8("x", &args, 1, 255).is_err());
        assert!(arg("x", &args, 5).is_err());
        assert!(expect_arity("x", &args, 3).is_ok());
        assert!(expect_arity("x", &args, 2).is_err());
        assert!(!arg_level("x", &[Value::from(0)], 0).unwrap());
    }

    #[test]
    fn test_line_framer() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&b"OK\r\n\r\n  READY \nparti"[..]);

        assert_eq!(framer.next_line(&mut buf), Some(Line::Text("OK".into())));
        assert_eq!(framer.next_line(&mut buf), Some(Line::Text("READY".into())));
        assert_eq!(framer.next_line(&mut buf), None);

        buf.extend_from_slice(b"al\n");
        assert_eq!(framer.next_line(&mut buf), Some(Line::Text("partial".into())));
    }

    #[test]
    fn test_line_framer_flags_bad_utf8() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&[0xFF, 0xFE, b'\n', b'O', b'K', b'\n'][..]);
        assert!(matches!(framer.next_line(&mut buf), Some(Line::Malformed(_))));
        assert_eq!(framer.next_line(&mut buf), Some(Line::Text("OK".into())));
    }

    #[test]
    fn test_request_display() {
        assert_eq!(Request::new("AT\r\n").to_string(), "\"AT\\r\\n\"");
        assert_eq!(
            Request::new(vec![0xAA, 0x01, 0x00, 0x00, 0xAB]).to_string(),
            "AA 01 00 00 AB"
        );
    }
}
