/*!
 * RioRand serial relay boards.
 *
 * Every frame is five bytes: `0xAA`, opcode, two payload bytes and an XOR
 * checksum over the preceding four. Replies echo the request opcode with the
 * high bit set, `0xFF` is a NAK and `0x90` is an unsolicited relay-state
 * report.
 */
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use boardlink_core::telemetry::{SampleValue, TelemetrySample};
use boardlink_core::types::Value;

use crate::driver::{
    probe_signature, Capability, DeviceDriver, DriverDescriptor, DriverTimeouts, Handshake,
};
use crate::error::{DeviceError, Result};
use crate::protocol::{
    arg_level, arg_u8, expect_arity, FrameDecoder, InboundFrame, Protocol, Request,
};
use crate::transport::{Transport, TransportKind};

/// Frame header
pub const HEADER: u8 = 0xAA;

/// Length of every frame
pub const FRAME_LEN: usize = 5;

/// Request opcodes
pub mod opcode {
    /// Identify the board
    pub const IDENTIFY: u8 = 0x01;
    /// Set one relay
    pub const SET_RELAY: u8 = 0x02;
    /// Read the relay bitmask
    pub const READ_STATUS: u8 = 0x03;
    /// Switch every relay off
    pub const ALL_OFF: u8 = 0x04;
    /// Session handshake
    pub const HELLO: u8 = 0x05;
    /// Set on replies
    pub const RESPONSE_BIT: u8 = 0x80;
    /// Unsolicited relay-state report
    pub const STATE_REPORT: u8 = 0x90;
    /// Negative acknowledgment
    pub const NAK: u8 = 0xFF;
}

/// Telemetry stream carrying relay-state reports
pub const STATE_STREAM: &str = "relays";

/// Value of a decoded HELLO acknowledgment
pub const HELLO_REPLY: &str = "HELLO";

/// Highest relay channel on the largest board
const MAX_CHANNEL: u8 = 16;

/// XOR of `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build a complete frame
pub fn frame(opcode: u8, p0: u8, p1: u8) -> [u8; FRAME_LEN] {
    let head = [HEADER, opcode, p0, p1];
    [HEADER, opcode, p0, p1, checksum(&head)]
}

/// Check header and checksum of a five-byte frame
pub fn verify(frame: &[u8]) -> Result<()> {
    if frame.len() != FRAME_LEN || frame[0] != HEADER {
        return Err(DeviceError::protocol(format!("not a relay frame: {:02X?}", frame)));
    }
    let expected = checksum(&frame[..FRAME_LEN - 1]);
    let actual = frame[FRAME_LEN - 1];
    if expected != actual {
        return Err(DeviceError::Checksum { expected, actual });
    }
    Ok(())
}

/// Resolved relay command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Switch one channel
    SetRelay {
        /// Channel, 1-based
        channel: u8,
        /// On when true
        on: bool,
    },
    /// Read the relay bitmask
    ReadStatus,
    /// Switch every relay off
    AllOff,
    /// Arbitrary opcode and payload
    Raw {
        /// Opcode
        opcode: u8,
        /// First payload byte
        p0: u8,
        /// Second payload byte
        p1: u8,
    },
}

impl RelayCommand {
    /// Resolve an endpoint and its arguments
    pub fn resolve(endpoint: &str, args: &[Value]) -> Result<Self> {
        let command = match endpoint {
            "setRelay" => {
                expect_arity(endpoint, args, 2)?;
                let channel = arg_u8(endpoint, args, 0, MAX_CHANNEL)?;
                if channel == 0 {
                    return Err(DeviceError::invalid_argument("relay channels start at 1"));
                }
                RelayCommand::SetRelay {
                    channel,
                    on: arg_level(endpoint, args, 1)?,
                }
            }
            "readStatus" => {
                expect_arity(endpoint, args, 0)?;
                RelayCommand::ReadStatus
            }
            "allOff" => {
                expect_arity(endpoint, args, 0)?;
                RelayCommand::AllOff
            }
            "raw" => {
                expect_arity(endpoint, args, 3)?;
                RelayCommand::Raw {
                    opcode: arg_u8(endpoint, args, 0, u8::MAX)?,
                    p0: arg_u8(endpoint, args, 1, u8::MAX)?,
                    p1: arg_u8(endpoint, args, 2, u8::MAX)?,
                }
            }
            other => return Err(DeviceError::UnsupportedEndpoint(other.to_string())),
        };
        Ok(command)
    }

    /// Wire frame for this command
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        match *self {
            RelayCommand::SetRelay { channel, on } => frame(opcode::SET_RELAY, channel, u8::from(on)),
            RelayCommand::ReadStatus => frame(opcode::READ_STATUS, 0, 0),
            RelayCommand::AllOff => frame(opcode::ALL_OFF, 0, 0),
            RelayCommand::Raw { opcode, p0, p1 } => frame(opcode, p0, p1),
        }
    }
}

/// RioRand binary protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct RioRandProtocol;

impl Protocol for RioRandProtocol {
    fn name(&self) -> &'static str {
        "riorand"
    }

    fn encode(&self, endpoint: &str, args: &[Value]) -> Result<Request> {
        let frame = RelayCommand::resolve(endpoint, args)?.encode();
        Ok(Request::new(Bytes::copy_from_slice(&frame)))
    }

    fn decoder(&self) -> FrameDecoder {
        Box::new(RioRandDecoder)
    }
}

/// Decoder that resynchronizes on the header byte
#[derive(Debug, Default)]
pub struct RioRandDecoder;

impl RioRandDecoder {
    fn classify(frame: &[u8]) -> InboundFrame {
        let (op, p0, p1) = (frame[1], frame[2], frame[3]);
        match op {
            opcode::NAK => InboundFrame::Rejected(format!(
                "NAK for opcode 0x{:02X} (code {})",
                p0, p1
            )),
            opcode::STATE_REPORT => InboundFrame::Telemetry(TelemetrySample::now(
                STATE_STREAM,
                SampleValue::Numeric(f64::from(p0)),
            )),
            op if op & opcode::RESPONSE_BIT != 0 => {
                let value = match op & !opcode::RESPONSE_BIT {
                    opcode::READ_STATUS => Value::Integer(i64::from(p0)),
                    opcode::IDENTIFY => Value::Integer(i64::from(u16::from_be_bytes([p0, p1]))),
                    opcode::HELLO => Value::from(HELLO_REPLY),
                    _ => Value::Null,
                };
                InboundFrame::Response(value)
            }
            _ => InboundFrame::malformed(
                format!("request opcode 0x{:02X} from device", op),
                Bytes::copy_from_slice(frame),
            ),
        }
    }
}

impl Decoder for RioRandDecoder {
    type Item = InboundFrame;
    type Error = DeviceError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundFrame>> {
        match src.iter().position(|b| *b == HEADER) {
            Some(0) => {}
            Some(skip) => {
                let junk = src.split_to(skip).freeze();
                return Ok(Some(InboundFrame::malformed("bytes before header", junk)));
            }
            None if src.is_empty() => return Ok(None),
            None => {
                let junk = src.split().freeze();
                return Ok(Some(InboundFrame::malformed("no header", junk)));
            }
        }
        if src.len() < FRAME_LEN {
            return Ok(None);
        }

        match verify(&src[..FRAME_LEN]) {
            Ok(()) => {}
            Err(DeviceError::Checksum { expected, actual }) => {
                // one corrupted frame is one item: drop through to the next header
                let end = src[1..]
                    .iter()
                    .position(|b| *b == HEADER)
                    .map_or(src.len(), |offset| offset + 1);
                let bytes = src.split_to(end).freeze();
                return Ok(Some(InboundFrame::Corrupt {
                    expected,
                    actual,
                    bytes,
                }));
            }
            Err(e) => {
                src.advance(1);
                return Ok(Some(InboundFrame::malformed(e.to_string(), Bytes::from_static(&[HEADER]))));
            }
        }
        let frame = src.split_to(FRAME_LEN);
        Ok(Some(Self::classify(&frame)))
    }
}

/// Driver for RioRand relay boards
#[derive(Debug)]
pub struct RioRandDriver {
    descriptor: DriverDescriptor,
}

impl RioRandDriver {
    /// Create the driver with its default descriptor
    pub fn new() -> Self {
        Self {
            descriptor: DriverDescriptor {
                name: "riorand".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                transports: vec![TransportKind::Serial, TransportKind::Tcp, TransportKind::Mock],
                capabilities: vec![Capability::Relay],
                timeouts: DriverTimeouts::default(),
            },
        }
    }
}

impl Default for RioRandDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `bytes` contain a valid identify reply
fn is_identify_reply(bytes: &[u8]) -> bool {
    bytes.windows(FRAME_LEN).any(|window| {
        window[1] == opcode::IDENTIFY | opcode::RESPONSE_BIT && verify(window).is_ok()
    })
}

#[async_trait]
impl DeviceDriver for RioRandDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn protocol(&self) -> Arc<dyn Protocol> {
        Arc::new(RioRandProtocol)
    }

    async fn probe(&self, transport: &dyn Transport, timeout: Duration) -> bool {
        let request = frame(opcode::IDENTIFY, 0, 0);
        probe_signature(transport, &request, timeout, is_identify_reply).await
    }

    fn handshake(&self) -> Option<Handshake> {
        Some(Handshake {
            request: Request::new(Bytes::copy_from_slice(&frame(opcode::HELLO, 0, 0))),
            accept: |reply| reply.as_str() == Some(HELLO_REPLY),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<InboundFrame> {
        let mut decoder = RioRandDecoder;
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_checksum_is_xor_of_preceding_bytes() {
        assert_eq!(checksum(&[0xAA, 0x02, 0x03, 0x01]), 0xAA ^ 0x02 ^ 0x03 ^ 0x01);
        assert_eq!(frame(opcode::SET_RELAY, 3, 1), [0xAA, 0x02, 0x03, 0x01, 0xAA]);
        assert!(verify(&frame(opcode::READ_STATUS, 0, 0)).is_ok());
        assert!(matches!(
            verify(&[0xAA, 0x02, 0x03, 0x01, 0x00]),
            Err(DeviceError::Checksum { expected: 0xAA, actual: 0x00 })
        ));
    }

    #[test]
    fn test_encode_commands() {
        let request = RioRandProtocol
            .encode("setRelay", &[Value::from(3), Value::from(true)])
            .unwrap();
        assert_eq!(&request.bytes[..], &[0xAA, 0x02, 0x03, 0x01, 0xAA]);

        let request = RioRandProtocol.encode("raw", &[Value::from(0x07), Value::from(1), Value::from(2)]).unwrap();
        assert_eq!(&request.bytes[..], &frame(0x07, 1, 2));

        assert!(matches!(
            RioRandProtocol.encode("blink", &[]),
            Err(DeviceError::UnsupportedEndpoint(_))
        ));
        assert!(matches!(
            RioRandProtocol.encode("setRelay", &[Value::from(0), Value::from(true)]),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_responses_nak_and_report() {
        let mut input = Vec::new();
        input.extend_from_slice(&frame(0x83, 0b0000_0101, 0));
        input.extend_from_slice(&frame(0x82, 3, 1));
        input.extend_from_slice(&frame(opcode::NAK, 0x02, 0x01));
        input.extend_from_slice(&frame(opcode::STATE_REPORT, 0x0F, 0));

        let frames = decode_all(&input);
        assert_eq!(frames[0], InboundFrame::Response(Value::Integer(5)));
        assert_eq!(frames[1], InboundFrame::Response(Value::Null));
        assert!(matches!(frames[2], InboundFrame::Rejected(_)));
        match &frames[3] {
            InboundFrame::Telemetry(sample) => {
                assert_eq!(sample.channel, STATE_STREAM);
                assert_eq!(sample.value, SampleValue::Numeric(15.0));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_resync_after_bad_checksum() {
        let mut input = vec![0x00, 0x13];
        input.extend_from_slice(&[0xAA, 0x83, 0x01, 0x00, 0x00]);
        input.extend_from_slice(&frame(0x83, 0x01, 0));

        let frames = decode_all(&input);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], InboundFrame::Malformed { .. }));
        assert_eq!(
            frames[1],
            InboundFrame::Corrupt {
                expected: 0xAA ^ 0x83 ^ 0x01,
                actual: 0x00,
                bytes: Bytes::from_static(&[0xAA, 0x83, 0x01, 0x00, 0x00]),
            }
        );
        assert_eq!(frames[2], InboundFrame::Response(Value::Integer(1)));
    }

    #[test]
    fn test_corrupted_frame_is_a_single_item() {
        let mut corrupted = frame(0x83, 0x01, 0);
        corrupted[FRAME_LEN - 1] ^= 0xFF;

        let frames = decode_all(&corrupted);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].malformed_reason().unwrap().contains("Checksum"));
        assert!(matches!(frames[0], InboundFrame::Corrupt { .. }));
    }

    #[test]
    fn test_false_header_inside_junk_keeps_following_frame() {
        // a stray 0xAA makes the decoder try a frame that overlaps the real one
        let mut input = vec![0xAA, 0x00];
        input.extend_from_slice(&frame(0x83, 0x04, 0));

        let frames = decode_all(&input);
        assert!(matches!(frames[0], InboundFrame::Corrupt { .. }));
        assert_eq!(frames.last(), Some(&InboundFrame::Response(Value::Integer(4))));
    }

    #[test]
    fn test_handshake_requires_hello_ack() {
        let handshake = RioRandDriver::new().handshake().unwrap();
        let mut decoder = RioRandDecoder;

        let mut hello = BytesMut::from(&frame(0x85, 0, 0)[..]);
        match decoder.decode(&mut hello).unwrap() {
            Some(InboundFrame::Response(value)) => assert!((handshake.accept)(&value)),
            other => panic!("unexpected frame {:?}", other),
        }

        let mut identify = BytesMut::from(&frame(0x81, 0, 8)[..]);
        match decoder.decode(&mut identify).unwrap() {
            Some(InboundFrame::Response(value)) => assert!(!(handshake.accept)(&value)),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = RioRandDecoder;
        let full = frame(0x83, 0x02, 0);
        let mut buf = BytesMut::from(&full[..3]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[3..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(InboundFrame::Response(Value::Integer(2)))
        );
    }

    #[test]
    fn test_identify_reply_detection() {
        let mut reply = vec![0x00];
        reply.extend_from_slice(&frame(0x81, 0x01, 0x02));
        assert!(is_identify_reply(&reply));
        assert!(!is_identify_reply(&frame(0x83, 0, 0)));
        assert!(!is_identify_reply(b"OK\r\n"));
    }
}
