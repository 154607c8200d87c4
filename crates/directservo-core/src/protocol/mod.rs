//! Serial Protocol Communication
//!
//! Implements the DirectServo ASCII line protocol spoken over a shared
//! RS485 bus.
//!
//! Every frame is newline terminated and starts with the 2-hex-digit address
//! of the controller it is meant for (or comes from).

pub mod codec;
pub mod commands;
mod error;
pub mod framing;
pub mod serial;
pub mod stream;

pub use codec::{
    counts_to_degrees, decode_frame, decode_reply, encode, offset_to_counts, EncodedFrame, Frame,
    FrameParams, Reply, ReplyStatus,
};
pub use commands::{Address, Command, FailsafeParams};
pub use error::ProtocolError;
pub use framing::LineFramer;
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel};

/// Default baud rate for the servo bus
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default per-read timeout of the transport in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default timeout for replies in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Calibration sweeps the rotor before the controller replies
pub const CALIBRATE_TIMEOUT_MS: u64 = 10_000;

/// Limit search for the failsafe takes longer than calibration
pub const FAILSAFE_TIMEOUT_MS: u64 = 15_000;

/// Frame delimiter
pub const FRAME_DELIMITER: u8 = b'\n';

/// Longest line kept while waiting for a delimiter
pub const MAX_LINE_LENGTH: usize = 256;
