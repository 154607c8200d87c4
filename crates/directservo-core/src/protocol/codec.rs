//! Frame encoding/decoding
//!
//! Command frame (host to controller), ASCII, newline terminated:
//! - 2 hex: destination address
//! - 1 byte: opcode
//! - N bytes: opcode-specific parameters
//! - `\n`
//!
//! Reply line (controller to host):
//! - 2 hex: reporting address
//! - 2 hex: peak acceleration since the previous report
//! - either a signed hex angle (4, 6 or 8 digits) or the literal `error`
//!
//! Angles are scaled so that 0xFFFF counts equal one revolution.

use std::fmt;

use super::commands::{ratio_to_magnitude, unsigned_ratio_to_byte, Address, Command, FailsafeParams};
use super::{ProtocolError, FRAME_DELIMITER};

/// Counts per revolution used by the angle and offset fields
const COUNTS_PER_REV: f64 = 65535.0;

/// An encoded command, always terminated by a single newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    bytes: Vec<u8>,
}

impl EncodedFrame {
    /// Raw bytes including the trailing newline
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes, newline included
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for an encoded frame
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Take the raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Display for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.bytes);
        write!(f, "{}", text.trim_end_matches('\n'))
    }
}

/// Scale a failsafe offset in degrees to the 16-bit wire value
pub fn offset_to_counts(offset_degrees: f64) -> Result<u16, ProtocolError> {
    if offset_degrees.is_nan() {
        return Err(ProtocolError::OffsetOutOfRange(offset_degrees));
    }
    let scaled = (offset_degrees.max(0.0) / 360.0 * COUNTS_PER_REV).round();
    if scaled > u16::MAX as f64 {
        return Err(ProtocolError::OffsetOutOfRange(offset_degrees));
    }
    Ok(scaled as u16)
}

fn sign_char(negative: bool) -> char {
    if negative {
        '-'
    } else {
        '+'
    }
}

/// Encode a command for the given destination
///
/// Ratios are clamped; an out-of-range `SetId` target or failsafe offset is
/// rejected before any bytes are produced.
pub fn encode(destination: Address, command: &Command) -> Result<EncodedFrame, ProtocolError> {
    let mut text = format!("{:02X}{}", destination.value(), command.opcode() as char);

    match command {
        Command::Torque { ratio } => {
            let (negative, magnitude) = ratio_to_magnitude(*ratio);
            text.push(sign_char(negative));
            text.push_str(&format!("{:02X}", magnitude));
        }
        Command::SetId { new_address } => {
            let id = u8::try_from(*new_address)
                .map_err(|_| ProtocolError::InvalidAddress(*new_address))?;
            text.push_str(&format!("{:02X}", id));
        }
        Command::SetFailsafe(params) => {
            let offset = offset_to_counts(params.offset_degrees)?;
            let (negative, failover) = ratio_to_magnitude(params.failover_ratio);
            let search = unsigned_ratio_to_byte(params.search_ratio);
            text.push(sign_char(negative));
            text.push_str(&format!("{:02X}{:02X}{:04X}", failover, search, offset));
        }
        Command::Calibrate | Command::GetAngle | Command::SetZeroAngle | Command::Reset => {}
    }

    let mut bytes = text.into_bytes();
    bytes.push(FRAME_DELIMITER);
    Ok(EncodedFrame { bytes })
}

/// Raw parameter fields of a decoded command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParams {
    /// Opcode without parameters
    None,
    /// `T`: sign and magnitude
    Torque {
        /// Minus sign present
        negative: bool,
        /// Scaled magnitude, 0-255
        magnitude: u8,
    },
    /// `I`: the address to store
    SetId {
        /// New bus id
        new_address: u8,
    },
    /// `F`: failover sign and magnitude, search magnitude, offset
    Failsafe {
        /// Minus sign on the failover torque
        negative: bool,
        /// Scaled failover magnitude, 0-255
        failover: u8,
        /// Scaled search magnitude, 0-255
        search: u8,
        /// Offset in counts of 1/65535 revolution
        offset: u16,
    },
}

/// A command frame as seen by a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Controller the frame is addressed to
    pub destination: Address,
    /// Command letter
    pub opcode: u8,
    /// Parameter fields following the opcode
    pub params: FrameParams,
}

impl Frame {
    /// Convert the raw fields back into a typed command
    ///
    /// Returns `None` when the opcode and parameters do not belong together.
    pub fn to_command(&self) -> Option<Command> {
        let command = match (self.opcode, self.params) {
            (b'T', FrameParams::Torque { negative, magnitude }) => {
                let ratio = magnitude as f64 / 255.0;
                Command::Torque {
                    ratio: if negative { -ratio } else { ratio },
                }
            }
            (b'I', FrameParams::SetId { new_address }) => Command::SetId {
                new_address: new_address as u16,
            },
            (
                b'F',
                FrameParams::Failsafe {
                    negative,
                    failover,
                    search,
                    offset,
                },
            ) => {
                let failover_ratio = failover as f64 / 255.0;
                Command::SetFailsafe(FailsafeParams {
                    failover_ratio: if negative { -failover_ratio } else { failover_ratio },
                    search_ratio: search as f64 / 255.0,
                    offset_degrees: offset as f64 / COUNTS_PER_REV * 360.0,
                })
            }
            (b'C', FrameParams::None) => Command::Calibrate,
            (b'a', FrameParams::None) => Command::GetAngle,
            (b'Z', FrameParams::None) => Command::SetZeroAngle,
            (b'R', FrameParams::None) => Command::Reset,
            _ => return None,
        };
        Some(command)
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Parse up to eight hex digits as a big-endian unsigned value
fn parse_hex(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    digits
        .iter()
        .try_fold(0u32, |acc, &c| Some((acc << 4) | hex_nibble(c)? as u32))
}

fn parse_hex_u8(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 {
        return None;
    }
    parse_hex(digits).map(|v| v as u8)
}

fn parse_sign(c: u8) -> Option<bool> {
    match c {
        b'+' => Some(false),
        b'-' => Some(true),
        _ => None,
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Decode a command frame, with or without its trailing newline
pub fn decode_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    let body = strip_line_ending(data);
    let invalid = || ProtocolError::InvalidFrame(String::from_utf8_lossy(body).into_owned());

    if body.len() < 3 {
        return Err(invalid());
    }
    let destination = Address(parse_hex_u8(&body[0..2]).ok_or_else(invalid)?);
    let opcode = body[2];
    let args = &body[3..];

    let params = match opcode {
        b'T' => {
            if args.len() != 3 {
                return Err(invalid());
            }
            FrameParams::Torque {
                negative: parse_sign(args[0]).ok_or_else(invalid)?,
                magnitude: parse_hex_u8(&args[1..3]).ok_or_else(invalid)?,
            }
        }
        b'I' => FrameParams::SetId {
            new_address: parse_hex_u8(args).ok_or_else(invalid)?,
        },
        b'F' => {
            if args.len() != 9 {
                return Err(invalid());
            }
            FrameParams::Failsafe {
                negative: parse_sign(args[0]).ok_or_else(invalid)?,
                failover: parse_hex_u8(&args[1..3]).ok_or_else(invalid)?,
                search: parse_hex_u8(&args[3..5]).ok_or_else(invalid)?,
                offset: parse_hex(&args[5..9]).ok_or_else(invalid)? as u16,
            }
        }
        b'C' | b'a' | b'Z' | b'R' if args.is_empty() => FrameParams::None,
        _ => return Err(invalid()),
    };

    Ok(Frame {
        destination,
        opcode,
        params,
    })
}

/// Outcome of a request as seen by the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Controller reported its state
    Ok,
    /// Controller answered `error`; carries the raw line
    DeviceError(String),
    /// Nothing arrived before the timeout
    NoResponse,
    /// Line could not be parsed; carries the raw line
    Malformed(String),
    /// Torque blocked locally because the safety governor is disarmed
    SafetyRejected,
}

/// A decoded reply line
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Address of the reporting controller (broadcast when unknown)
    pub address: Address,
    /// Reported angle, present only when `status` is `Ok`
    pub angle_degrees: Option<f64>,
    /// Peak acceleration since the previous report
    pub accel: Option<u8>,
    /// How the request ended
    pub status: ReplyStatus,
}

impl Reply {
    /// Reply standing in for a request that timed out
    pub fn no_response(address: Address) -> Self {
        Self {
            address,
            angle_degrees: None,
            accel: None,
            status: ReplyStatus::NoResponse,
        }
    }

    /// Reply standing in for a torque command refused while disarmed
    pub fn safety_rejected(address: Address) -> Self {
        Self {
            address,
            angle_degrees: None,
            accel: None,
            status: ReplyStatus::SafetyRejected,
        }
    }

    fn device_error(address: Address, raw: &str) -> Self {
        Self {
            address,
            angle_degrees: None,
            accel: None,
            status: ReplyStatus::DeviceError(raw.to_string()),
        }
    }

    fn malformed(raw: &str) -> Self {
        Self {
            address: Address::BROADCAST,
            angle_degrees: None,
            accel: None,
            status: ReplyStatus::Malformed(raw.to_string()),
        }
    }

    /// True when the controller reported its state
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// True when the line could not be parsed
    pub fn is_malformed(&self) -> bool {
        matches!(self.status, ReplyStatus::Malformed(_))
    }
}

/// Interpret an angle field as a two's-complement value of its own width
fn signed_counts(digits: &[u8]) -> Option<i64> {
    if !matches!(digits.len(), 4 | 6 | 8) {
        return None;
    }
    let raw = parse_hex(digits)? as i64;
    let bits = digits.len() as u32 * 4;
    let sign_bit = 1i64 << (bits - 1);
    Some(if raw & sign_bit != 0 { raw - (1i64 << bits) } else { raw })
}

/// Convert raw angle counts to degrees
pub fn counts_to_degrees(counts: i64) -> f64 {
    360.0 * counts as f64 / COUNTS_PER_REV
}

/// Decode a reply line. Total over arbitrary input: anything that does not
/// match the reply shape becomes `ReplyStatus::Malformed`.
pub fn decode_reply(line: &[u8]) -> Reply {
    let body = strip_line_ending(line);
    let raw = String::from_utf8_lossy(body);

    if body.len() < 2 {
        return Reply::malformed(&raw);
    }
    let Some(id) = parse_hex_u8(&body[0..2]) else {
        return Reply::malformed(&raw);
    };
    let address = Address(id);
    let rest = &body[2..];

    // Firmware error replies may omit the accel byte
    if rest.eq_ignore_ascii_case(b"error") {
        return Reply::device_error(address, &raw);
    }
    if rest.len() < 2 {
        return Reply::malformed(&raw);
    }
    let Some(accel) = parse_hex_u8(&rest[0..2]) else {
        return Reply::malformed(&raw);
    };
    let info = &rest[2..];

    if info.eq_ignore_ascii_case(b"error") {
        return Reply::device_error(address, &raw);
    }
    match signed_counts(info) {
        Some(counts) => Reply {
            address,
            angle_degrees: Some(counts_to_degrees(counts)),
            accel: Some(accel),
            status: ReplyStatus::Ok,
        },
        None => Reply::malformed(&raw),
    }
}
