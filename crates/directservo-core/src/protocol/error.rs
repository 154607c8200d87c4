//! Protocol errors

use thiserror::Error;

/// Errors that can occur while encoding commands or talking to the bus
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Transport opened but the connection could not be set up
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No port with the requested name
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// `SetId` target does not fit in one byte
    #[error("Address {0} is outside 0-255")]
    InvalidAddress(u16),

    /// Failsafe offset does not fit the 16-bit field
    #[error("Failsafe offset {0} degrees does not fit in 16 bits")]
    OffsetOutOfRange(f64),

    /// Bytes do not form a command frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The blocking shutdown sweep could not run
    #[error("Shutdown failed: {0}")]
    ShutdownFailed(String),

    /// Configuration missing, unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Read or write on the transport failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for errors raised by parameter validation, before anything touches the wire
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidAddress(_) | ProtocolError::OffsetOutOfRange(_)
        )
    }
}
