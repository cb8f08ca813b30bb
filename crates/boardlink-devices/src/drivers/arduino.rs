/*!
 * Arduino (AVR) boards running the line-oriented command firmware.
 *
 * ```text
 * host -> ID?\n                      device -> ARDUINO UNO R3\n
 * host -> INIT\n                     device -> READY\n
 * host -> CMD:digitalWrite:13,true\n device -> OK\n | OK:<value>\n | ERR:<message>\n
 *                                    device -> TLM:<stream>:<value>\n (unsolicited)
 * ```
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use boardlink_core::telemetry::{SampleValue, TelemetrySample};
use boardlink_core::types::Value;

use crate::driver::{
    contains_any, probe_signature, Capability, DeviceDriver, DriverDescriptor, DriverTimeouts,
    Handshake,
};
use crate::error::{DeviceError, Result};
use crate::protocol::{
    arg_level, arg_u8, check_endpoint, check_field, expect_arity, render_args, FrameDecoder,
    InboundFrame, Line, LineFramer, Protocol, Request,
};
use crate::transport::{Transport, TransportKind};

/// Identification request
pub const PROBE_REQUEST: &[u8] = b"ID?\n";

/// Handshake request
pub const HANDSHAKE_REQUEST: &[u8] = b"INIT\n";

const SIGNATURES: [&str; 2] = ["ARDUINO", "AVR"];

/// Pin modes accepted by `pinMode`
const PIN_MODES: [&str; 3] = ["INPUT", "OUTPUT", "INPUT_PULLUP"];

/// Resolved Arduino command
#[derive(Debug, Clone, PartialEq)]
pub enum ArduinoCommand {
    /// Set a digital pin
    DigitalWrite {
        /// Pin number
        pin: u8,
        /// Level
        high: bool,
    },
    /// Read a digital pin
    DigitalRead {
        /// Pin number
        pin: u8,
    },
    /// Read an analog input
    AnalogRead {
        /// Analog channel
        pin: u8,
    },
    /// PWM output, duty 0..=255
    AnalogWrite {
        /// Pin number
        pin: u8,
        /// Duty cycle
        duty: u8,
    },
    /// Configure a pin
    PinMode {
        /// Pin number
        pin: u8,
        /// INPUT, OUTPUT or INPUT_PULLUP
        mode: String,
    },
    /// Any other endpoint, framed generically
    Passthrough {
        /// Endpoint name
        endpoint: String,
        /// Arguments as given
        args: Vec<Value>,
    },
}

impl ArduinoCommand {
    /// Resolve an endpoint and its arguments
    pub fn resolve(endpoint: &str, args: &[Value]) -> Result<Self> {
        check_endpoint(endpoint)?;
        let command = match endpoint {
            "digitalWrite" => {
                expect_arity(endpoint, args, 2)?;
                ArduinoCommand::DigitalWrite {
                    pin: arg_u8(endpoint, args, 0, u8::MAX)?,
                    high: arg_level(endpoint, args, 1)?,
                }
            }
            "digitalRead" => {
                expect_arity(endpoint, args, 1)?;
                ArduinoCommand::DigitalRead {
                    pin: arg_u8(endpoint, args, 0, u8::MAX)?,
                }
            }
            "analogRead" => {
                expect_arity(endpoint, args, 1)?;
                ArduinoCommand::AnalogRead {
                    pin: arg_u8(endpoint, args, 0, u8::MAX)?,
                }
            }
            "analogWrite" | "pwmWrite" => {
                expect_arity(endpoint, args, 2)?;
                ArduinoCommand::AnalogWrite {
                    pin: arg_u8(endpoint, args, 0, u8::MAX)?,
                    duty: arg_u8(endpoint, args, 1, u8::MAX)?,
                }
            }
            "pinMode" => {
                expect_arity(endpoint, args, 2)?;
                let mode = args[1]
                    .as_str()
                    .map(str::to_ascii_uppercase)
                    .filter(|mode| PIN_MODES.contains(&mode.as_str()))
                    .ok_or_else(|| {
                        DeviceError::invalid_argument(format!(
                            "pinMode expects one of {:?}, got {:?}",
                            PIN_MODES, args[1]
                        ))
                    })?;
                ArduinoCommand::PinMode {
                    pin: arg_u8(endpoint, args, 0, u8::MAX)?,
                    mode,
                }
            }
            other => ArduinoCommand::Passthrough {
                endpoint: other.to_string(),
                args: args.to_vec(),
            },
        };
        Ok(command)
    }

    /// Wire bytes for this command
    pub fn encode(&self) -> Result<Bytes> {
        let (endpoint, args) = match self {
            ArduinoCommand::DigitalWrite { pin, high } => {
                ("digitalWrite", render_args(&[Value::from(*pin), Value::from(*high)])?)
            }
            ArduinoCommand::DigitalRead { pin } => ("digitalRead", pin.to_string()),
            ArduinoCommand::AnalogRead { pin } => ("analogRead", pin.to_string()),
            ArduinoCommand::AnalogWrite { pin, duty } => ("analogWrite", format!("{},{}", pin, duty)),
            ArduinoCommand::PinMode { pin, mode } => ("pinMode", format!("{},{}", pin, mode)),
            ArduinoCommand::Passthrough { endpoint, args } => (endpoint.as_str(), render_args(args)?),
        };
        Ok(Bytes::from(format!("CMD:{}:{}\n", endpoint, args)))
    }
}

/// Arduino line protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct ArduinoProtocol;

impl Protocol for ArduinoProtocol {
    fn name(&self) -> &'static str {
        "arduino"
    }

    fn encode(&self, endpoint: &str, args: &[Value]) -> Result<Request> {
        Ok(Request::new(ArduinoCommand::resolve(endpoint, args)?.encode()?))
    }

    fn decoder(&self) -> FrameDecoder {
        Box::new(ArduinoDecoder::default())
    }
}

/// Decoder for Arduino replies and telemetry
#[derive(Debug, Default)]
pub struct ArduinoDecoder {
    framer: LineFramer,
}

impl ArduinoDecoder {
    fn classify(line: &str) -> InboundFrame {
        if line == "OK" {
            return InboundFrame::Response(Value::Null);
        }
        if line == "READY" {
            return InboundFrame::Response(Value::from("READY"));
        }
        if let Some(value) = line.strip_prefix("OK:") {
            return InboundFrame::Response(Value::parse_scalar(value));
        }
        if let Some(message) = line.strip_prefix("ERR:") {
            return InboundFrame::Rejected(message.trim().to_string());
        }
        if line == "ERR" {
            return InboundFrame::Rejected(String::from("unspecified error"));
        }
        if let Some(rest) = line.strip_prefix("TLM:") {
            return match rest.split_once(':') {
                Some((stream, value)) if !stream.is_empty() && check_field("stream", stream).is_ok() => {
                    InboundFrame::Telemetry(TelemetrySample::now(stream, SampleValue::parse(value)))
                }
                _ => InboundFrame::malformed("telemetry without stream", line.to_string()),
            };
        }
        InboundFrame::malformed("unrecognized line", line.to_string())
    }
}

impl Decoder for ArduinoDecoder {
    type Item = InboundFrame;
    type Error = DeviceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>> {
        Ok(self.framer.next_line(src).map(|line| match line {
            Line::Text(text) => Self::classify(&text),
            Line::Malformed(frame) => frame,
        }))
    }
}

/// Driver for Arduino boards
#[derive(Debug)]
pub struct ArduinoDriver {
    descriptor: DriverDescriptor,
}

impl ArduinoDriver {
    /// Create the driver with its default descriptor
    pub fn new() -> Self {
        Self {
            descriptor: DriverDescriptor {
                name: "arduino".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                transports: vec![
                    TransportKind::Serial,
                    TransportKind::Tcp,
                    TransportKind::Udp,
                    TransportKind::Mock,
                ],
                capabilities: vec![
                    Capability::Gpio,
                    Capability::Pwm,
                    Capability::Adc,
                    Capability::I2c,
                    Capability::Spi,
                ],
                timeouts: DriverTimeouts::default(),
            },
        }
    }
}

impl Default for ArduinoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceDriver for ArduinoDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn protocol(&self) -> Arc<dyn Protocol> {
        Arc::new(ArduinoProtocol)
    }

    async fn probe(&self, transport: &dyn Transport, timeout: Duration) -> bool {
        probe_signature(transport, PROBE_REQUEST, timeout, |reply| {
            contains_any(reply, &SIGNATURES)
        })
        .await
    }

    fn handshake(&self) -> Option<Handshake> {
        Some(Handshake {
            request: Request::new(HANDSHAKE_REQUEST),
            accept: |reply| reply.as_str() == Some("READY"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(endpoint: &str, args: &[Value]) -> Result<String> {
        let request = ArduinoProtocol.encode(endpoint, args)?;
        Ok(String::from_utf8(request.bytes.to_vec()).unwrap())
    }

    fn decode_all(input: &[u8]) -> Vec<InboundFrame> {
        let mut decoder = ArduinoDecoder::default();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_encode_known_commands() {
        assert_eq!(
            encode("digitalWrite", &[Value::from(13), Value::from(true)]).unwrap(),
            "CMD:digitalWrite:13,true\n"
        );
        assert_eq!(
            encode("digitalWrite", &[Value::from(13), Value::from(0)]).unwrap(),
            "CMD:digitalWrite:13,false\n"
        );
        assert_eq!(encode("analogRead", &[Value::from(0)]).unwrap(), "CMD:analogRead:0\n");
        assert_eq!(
            encode("analogWrite", &[Value::from(9), Value::from(128)]).unwrap(),
            "CMD:analogWrite:9,128\n"
        );
        assert_eq!(
            encode("pinMode", &[Value::from(2), Value::from("input_pullup")]).unwrap(),
            "CMD:pinMode:2,INPUT_PULLUP\n"
        );
    }

    #[test]
    fn test_passthrough_and_validation() {
        assert_eq!(
            encode("servoWrite", &[Value::from(9), Value::from(90)]).unwrap(),
            "CMD:servoWrite:9,90\n"
        );
        assert_eq!(encode("ping", &[]).unwrap(), "CMD:ping:\n");

        assert!(matches!(
            encode("print", &[Value::from("a,b")]),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode("digitalWrite", &[Value::from(13)]),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode("analogWrite", &[Value::from(9), Value::from(256)]),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode("pinMode", &[Value::from(2), Value::from("SIDEWAYS")]),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_replies_and_telemetry() {
        let frames = decode_all(b"OK\r\nOK:512\nERR:bad pin\nREADY\nTLM:adc0:1023\n");
        assert_eq!(frames[0], InboundFrame::Response(Value::Null));
        assert_eq!(frames[1], InboundFrame::Response(Value::Integer(512)));
        assert_eq!(frames[2], InboundFrame::Rejected("bad pin".into()));
        assert_eq!(frames[3], InboundFrame::Response(Value::from("READY")));
        match &frames[4] {
            InboundFrame::Telemetry(sample) => {
                assert_eq!(sample.channel, "adc0");
                assert_eq!(sample.value, SampleValue::Numeric(1023.0));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_lines() {
        let frames = decode_all(b"hello world\nTLM:nostream\n");
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|frame| matches!(frame, InboundFrame::Malformed { .. })));
    }

    #[test]
    fn test_descriptor() {
        let driver = ArduinoDriver::new();
        assert_eq!(driver.descriptor().name, "arduino");
        assert!(driver.descriptor().has_capability(Capability::Pwm));
        assert!(driver.descriptor().supports(TransportKind::Serial));
        let handshake = driver.handshake().unwrap();
        assert_eq!(&handshake.request.bytes[..], HANDSHAKE_REQUEST);
        assert!((handshake.accept)(&Value::from("READY")));
        assert!(!(handshake.accept)(&Value::Null));
    }
}
