/*!
 * ESP32/ESP8266 modules running AT firmware with the SYS command set.
 *
 * Commands are `\r\n` terminated. A reply is zero or more `+CMD:<value>`
 * information lines followed by `OK` or `ERROR`; the value of the last
 * information line becomes the command's result. `+TLM:<stream>,<value>`
 * lines are unsolicited telemetry. With echo still enabled the module repeats
 * each command line, which is skipped.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use boardlink_core::telemetry::{SampleValue, TelemetrySample};
use boardlink_core::types::Value;

use crate::driver::{
    contains_any, probe_signature, Capability, DeviceDriver, DriverDescriptor, DriverTimeouts,
    Handshake,
};
use crate::error::{DeviceError, Result};
use crate::protocol::{
    arg, arg_level, arg_u8, expect_arity, check_field, render_args, FrameDecoder, InboundFrame,
    Line, LineFramer, Protocol, Request,
};
use crate::transport::{Transport, TransportKind};

/// Attention request used to probe
pub const PROBE_REQUEST: &[u8] = b"AT\r\n";

/// Echo-off handshake
pub const HANDSHAKE_REQUEST: &[u8] = b"ATE0\r\n";

const SIGNATURES: [&str; 2] = ["OK", "ESP32"];

/// Highest GPIO number on the ESP32
const MAX_GPIO: u8 = 39;

/// Highest PWM duty at 10-bit resolution
const MAX_DUTY: i64 = 1023;

/// Resolved ESP32 command
#[derive(Debug, Clone, PartialEq)]
pub enum Esp32Command {
    /// `AT+SYSGPIOWRITE=<pin>,<level>`
    GpioWrite {
        /// GPIO number
        pin: u8,
        /// Level
        high: bool,
    },
    /// `AT+SYSGPIOREAD=<pin>`
    GpioRead {
        /// GPIO number
        pin: u8,
    },
    /// `AT+SYSGPIODIR=<pin>,<dir>` with 0 = input, 1 = output
    GpioDirection {
        /// GPIO number
        pin: u8,
        /// Output when true
        output: bool,
    },
    /// `AT+SYSPWM=<pin>,<duty>`
    PwmWrite {
        /// GPIO number
        pin: u8,
        /// Duty cycle, 0..=1023
        duty: u16,
    },
    /// `AT+SYSADC?`
    AdcRead,
    /// Raw AT command, arguments appended after `=`
    Passthrough {
        /// Command, starting with `AT`
        command: String,
        /// Arguments as given
        args: Vec<Value>,
    },
}

impl Esp32Command {
    /// Resolve an endpoint and its arguments
    pub fn resolve(endpoint: &str, args: &[Value]) -> Result<Self> {
        let command = match endpoint {
            "gpioWrite" | "digitalWrite" => {
                expect_arity(endpoint, args, 2)?;
                Esp32Command::GpioWrite {
                    pin: arg_u8(endpoint, args, 0, MAX_GPIO)?,
                    high: arg_level(endpoint, args, 1)?,
                }
            }
            "gpioRead" | "digitalRead" => {
                expect_arity(endpoint, args, 1)?;
                Esp32Command::GpioRead {
                    pin: arg_u8(endpoint, args, 0, MAX_GPIO)?,
                }
            }
            "gpioDirection" | "pinMode" => {
                expect_arity(endpoint, args, 2)?;
                Esp32Command::GpioDirection {
                    pin: arg_u8(endpoint, args, 0, MAX_GPIO)?,
                    output: direction(endpoint, arg(endpoint, args, 1)?)?,
                }
            }
            "pwmWrite" | "analogWrite" => {
                expect_arity(endpoint, args, 2)?;
                let duty = arg(endpoint, args, 1)?
                    .as_integer()
                    .filter(|duty| (0..=MAX_DUTY).contains(duty))
                    .ok_or_else(|| {
                        DeviceError::invalid_argument(format!(
                            "{} duty must be 0..={}, got {:?}",
                            endpoint, MAX_DUTY, args[1]
                        ))
                    })?;
                Esp32Command::PwmWrite {
                    pin: arg_u8(endpoint, args, 0, MAX_GPIO)?,
                    duty: duty as u16,
                }
            }
            "adcRead" | "analogRead" => {
                expect_arity(endpoint, args, 0)?;
                Esp32Command::AdcRead
            }
            raw if raw.starts_with("AT") => {
                check_field("command", raw)?;
                if raw.contains('=') && !args.is_empty() {
                    return Err(DeviceError::invalid_argument(format!(
                        "{} already carries arguments",
                        raw
                    )));
                }
                Esp32Command::Passthrough {
                    command: raw.to_string(),
                    args: args.to_vec(),
                }
            }
            other => return Err(DeviceError::UnsupportedEndpoint(other.to_string())),
        };
        Ok(command)
    }

    /// Wire bytes for this command
    pub fn encode(&self) -> Result<Bytes> {
        let line = match self {
            Esp32Command::GpioWrite { pin, high } => {
                format!("AT+SYSGPIOWRITE={},{}", pin, u8::from(*high))
            }
            Esp32Command::GpioRead { pin } => format!("AT+SYSGPIOREAD={}", pin),
            Esp32Command::GpioDirection { pin, output } => {
                format!("AT+SYSGPIODIR={},{}", pin, u8::from(*output))
            }
            Esp32Command::PwmWrite { pin, duty } => format!("AT+SYSPWM={},{}", pin, duty),
            Esp32Command::AdcRead => "AT+SYSADC?".to_string(),
            Esp32Command::Passthrough { command, args } if args.is_empty() => command.clone(),
            Esp32Command::Passthrough { command, args } => {
                format!("{}={}", command, render_args(args)?)
            }
        };
        Ok(Bytes::from(format!("{}\r\n", line)))
    }
}

fn direction(endpoint: &str, value: &Value) -> Result<bool> {
    if let Some(text) = value.as_str() {
        match text.to_ascii_uppercase().as_str() {
            "OUTPUT" | "OUT" => return Ok(true),
            "INPUT" | "IN" => return Ok(false),
            _ => {}
        }
    }
    value.as_bool().ok_or_else(|| {
        DeviceError::invalid_argument(format!(
            "{} direction must be INPUT/OUTPUT or 0/1, got {:?}",
            endpoint, value
        ))
    })
}

/// ESP32 AT protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct Esp32Protocol;

impl Protocol for Esp32Protocol {
    fn name(&self) -> &'static str {
        "esp32"
    }

    fn encode(&self, endpoint: &str, args: &[Value]) -> Result<Request> {
        Ok(Request::new(Esp32Command::resolve(endpoint, args)?.encode()?))
    }

    fn decoder(&self) -> FrameDecoder {
        Box::new(Esp32Decoder::default())
    }
}

/// Unsolicited AT firmware notices that are neither replies nor errors
fn is_status_line(line: &str) -> bool {
    let notice = match line.split_once(',') {
        // link-scoped notices such as "0,CONNECT"
        Some((link, rest)) if link.parse::<u8>().is_ok() => rest,
        _ => line,
    };
    matches!(
        notice,
        "ready" | "WIFI CONNECTED" | "WIFI GOT IP" | "WIFI DISCONNECT" | "CONNECT" | "CLOSED"
    ) || notice.starts_with("busy ")
}

/// Decoder for AT replies, accumulating information lines until the final result
#[derive(Debug, Default)]
pub struct Esp32Decoder {
    framer: LineFramer,
    info: Option<Value>,
}

impl Esp32Decoder {
    fn classify(&mut self, line: &str) -> Option<InboundFrame> {
        match line {
            "OK" | "SEND OK" => return Some(InboundFrame::Response(self.info.take().unwrap_or_default())),
            "ERROR" | "FAIL" => {
                let message = match self.info.take() {
                    Some(value) if !value.is_null() => value.to_string(),
                    _ => line.to_string(),
                };
                return Some(InboundFrame::Rejected(message));
            }
            _ => {}
        }
        if line.starts_with("AT") {
            // command echo
            return None;
        }
        if is_status_line(line) {
            trace!("Status line {:?}", line);
            return None;
        }
        if let Some(rest) = line.strip_prefix("+TLM:") {
            return Some(match rest.split_once(',') {
                Some((stream, value)) if !stream.is_empty() => {
                    InboundFrame::Telemetry(TelemetrySample::now(stream, SampleValue::parse(value)))
                }
                _ => InboundFrame::malformed("telemetry without stream", line.to_string()),
            });
        }
        if let Some(rest) = line.strip_prefix('+') {
            return match rest.split_once(':') {
                Some((_, value)) => {
                    self.info = Some(Value::parse_scalar(value));
                    None
                }
                None => Some(InboundFrame::malformed("information line without value", line.to_string())),
            };
        }
        Some(InboundFrame::malformed("unrecognized line", line.to_string()))
    }
}

impl Decoder for Esp32Decoder {
    type Item = InboundFrame;
    type Error = DeviceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>> {
        while let Some(line) = self.framer.next_line(src) {
            let frame = match line {
                Line::Text(text) => self.classify(&text),
                Line::Malformed(frame) => Some(frame),
            };
            if frame.is_some() {
                return Ok(frame);
            }
        }
        Ok(None)
    }
}

/// Driver for ESP32/ESP8266 AT modules
#[derive(Debug)]
pub struct Esp32Driver {
    descriptor: DriverDescriptor,
}

impl Esp32Driver {
    /// Create the driver with its default descriptor
    pub fn new() -> Self {
        Self {
            descriptor: DriverDescriptor {
                name: "esp32".to_string(),
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
                    Capability::Wifi,
                ],
                timeouts: DriverTimeouts::default(),
            },
        }
    }
}

impl Default for Esp32Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceDriver for Esp32Driver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn protocol(&self) -> Arc<dyn Protocol> {
        Arc::new(Esp32Protocol)
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
            accept: Value::is_null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(endpoint: &str, args: &[Value]) -> Result<String> {
        let request = Esp32Protocol.encode(endpoint, args)?;
        Ok(String::from_utf8(request.bytes.to_vec()).unwrap())
    }

    fn decode_all(input: &[u8]) -> Vec<InboundFrame> {
        let mut decoder = Esp32Decoder::default();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_encode_sys_commands() {
        assert_eq!(
            encode("gpioWrite", &[Value::from(2), Value::from(true)]).unwrap(),
            "AT+SYSGPIOWRITE=2,1\r\n"
        );
        assert_eq!(encode("gpioRead", &[Value::from(4)]).unwrap(), "AT+SYSGPIOREAD=4\r\n");
        assert_eq!(
            encode("gpioDirection", &[Value::from(4), Value::from("OUTPUT")]).unwrap(),
            "AT+SYSGPIODIR=4,1\r\n"
        );
        assert_eq!(
            encode("pwmWrite", &[Value::from(5), Value::from(512)]).unwrap(),
            "AT+SYSPWM=5,512\r\n"
        );
        assert_eq!(encode("adcRead", &[]).unwrap(), "AT+SYSADC?\r\n");
    }

    #[test]
    fn test_passthrough_and_unsupported() {
        assert_eq!(encode("AT+GMR", &[]).unwrap(), "AT+GMR\r\n");
        assert_eq!(
            encode("AT+CWMODE", &[Value::from(1)]).unwrap(),
            "AT+CWMODE=1\r\n"
        );
        assert!(matches!(
            encode("servoWrite", &[]),
            Err(DeviceError::UnsupportedEndpoint(_))
        ));
        assert!(matches!(
            encode("gpioWrite", &[Value::from(40), Value::from(true)]),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode("pwmWrite", &[Value::from(5), Value::from(2048)]),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_info_lines_echo_and_result() {
        let frames = decode_all(
            b"AT+SYSGPIOREAD=4\r\n+SYSGPIOREAD:1\r\n\r\nOK\r\nOK\r\nERROR\r\n+TLM:rssi,-61\r\n",
        );
        assert_eq!(
            frames[..3],
            [
                InboundFrame::Response(Value::Integer(1)),
                InboundFrame::Response(Value::Null),
                InboundFrame::Rejected("ERROR".into()),
            ]
        );
        match &frames[3] {
            InboundFrame::Telemetry(sample) => {
                assert_eq!(sample.channel, "rssi");
                assert_eq!(sample.value, SampleValue::Numeric(-61.0));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_partial_reply() {
        let mut decoder = Esp32Decoder::default();
        let mut buf = BytesMut::from(&b"+SYSADC:2048\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"OK\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(InboundFrame::Response(Value::Integer(2048)))
        );
    }

    #[test]
    fn test_status_lines_are_ignored() {
        let frames = decode_all(
            b"ready\r\nWIFI CONNECTED\r\nWIFI GOT IP\r\nbusy p...\r\n0,CONNECT\r\n+SYSADC:7\r\nOK\r\nWIFI DISCONNECT\r\n",
        );
        assert_eq!(frames, vec![InboundFrame::Response(Value::Integer(7))]);
    }

    #[test]
    fn test_handshake_accepts_bare_ok_only() {
        let handshake = Esp32Driver::new().handshake().unwrap();
        assert!((handshake.accept)(&Value::Null));
        assert!(!(handshake.accept)(&Value::Integer(1)));
    }

    #[test]
    fn test_decode_garbage() {
        let frames = decode_all(b"ets Jan  8 2013\r\n");
        assert!(matches!(frames[0], InboundFrame::Malformed { .. }));
    }
}
