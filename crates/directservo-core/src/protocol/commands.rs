//! Protocol commands
//!
//! Defines the commands understood by DirectServo controllers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{CALIBRATE_TIMEOUT_MS, DEFAULT_TIMEOUT_MS, FAILSAFE_TIMEOUT_MS};

/// Bus address of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub u8);

impl Address {
    /// Reserved address every controller listens on; never assigned to a device
    pub const BROADCAST: Address = Address(0xFF);

    /// Address of the controller with bus id `id`
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    /// True for the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Raw bus id
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Address {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

/// Failsafe configuration sent with the `F` command
///
/// The controller searches for its mechanical limits with `search_ratio`
/// torque, then applies `failover_ratio` whenever it travels within
/// `offset_degrees` of a limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeParams {
    /// Torque applied once a limit is reached [-1.0, 1.0]
    pub failover_ratio: f64,
    /// Torque used while searching for limits [0.0, 1.0]
    pub search_ratio: f64,
    /// Distance from the searched limit at which the failsafe engages [0, 360]
    pub offset_degrees: f64,
}

impl FailsafeParams {
    /// Failsafe settings from their three parts
    pub fn new(failover_ratio: f64, search_ratio: f64, offset_degrees: f64) -> Self {
        Self {
            failover_ratio,
            search_ratio,
            offset_degrees,
        }
    }
}

impl Default for FailsafeParams {
    fn default() -> Self {
        Self {
            failover_ratio: 0.0,
            search_ratio: 0.4,
            offset_degrees: 10.0,
        }
    }
}

/// Commands for a DirectServo controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Set output torque ('T' command), ratio in [-1.0, 1.0]
    Torque {
        /// Fraction of rated torque; the sign sets the direction
        ratio: f64,
    },

    /// Store a new bus address in flash ('I' command)
    SetId {
        /// Address to store; values above 255 are rejected when encoding
        new_address: u16,
    },

    /// Run the encoder calibration routine ('C' command)
    Calibrate,

    /// Report angle and acceleration ('a' command)
    GetAngle,

    /// Make the current position the zero angle ('Z' command)
    SetZeroAngle,

    /// Search limits and arm the failsafe ('F' command)
    SetFailsafe(FailsafeParams),

    /// Reset flash to factory defaults ('R' command)
    Reset,
}

impl Command {
    /// Get the opcode byte
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Torque { .. } => b'T',
            Command::SetId { .. } => b'I',
            Command::Calibrate => b'C',
            Command::GetAngle => b'a',
            Command::SetZeroAngle => b'Z',
            Command::SetFailsafe(_) => b'F',
            Command::Reset => b'R',
        }
    }

    /// Look up the command kind for an opcode byte
    pub fn kind_of(opcode: u8) -> Option<&'static str> {
        match opcode {
            b'T' => Some("Torque"),
            b'I' => Some("SetId"),
            b'C' => Some("Calibrate"),
            b'a' => Some("GetAngle"),
            b'Z' => Some("SetZeroAngle"),
            b'F' => Some("SetFailsafe"),
            b'R' => Some("Reset"),
            _ => None,
        }
    }

    /// Get the expected response timeout in milliseconds
    pub fn timeout_ms(&self) -> u64 {
        match self {
            // The controller physically sweeps the rotor before answering
            Command::Calibrate => CALIBRATE_TIMEOUT_MS,
            Command::SetFailsafe(_) => FAILSAFE_TIMEOUT_MS,
            _ => DEFAULT_TIMEOUT_MS,
        }
    }

    /// True for a torque command that would produce output
    pub fn is_nonzero_torque(&self) -> bool {
        match self {
            Command::Torque { ratio } => ratio_to_magnitude(*ratio).1 != 0,
            _ => false,
        }
    }
}

/// Clamp a signed ratio to [-1, 1] and scale to a sign flag plus 0-255 magnitude.
///
/// Returns `(negative, magnitude)`. The sign follows the ratio even when the
/// magnitude rounds to zero; only zero itself (including `-0.0`) is positive.
/// NaN maps to zero.
pub fn ratio_to_magnitude(ratio: f64) -> (bool, u8) {
    if ratio.is_nan() {
        return (false, 0);
    }
    let clamped = ratio.clamp(-1.0, 1.0);
    let magnitude = (clamped.abs() * 255.0).round() as u8;
    (clamped < 0.0, magnitude)
}

/// Clamp an unsigned ratio to [0, 1] and scale to 0-255. NaN maps to zero.
pub fn unsigned_ratio_to_byte(ratio: f64) -> u8 {
    if ratio.is_nan() {
        return 0;
    }
    (ratio.clamp(0.0, 1.0) * 255.0).round() as u8
}
