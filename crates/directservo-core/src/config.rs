//! Bus configuration
//!
//! Settings for opening a servo bus and the default reply timeouts used by
//! device handles. Stored as JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    Command, ProtocolError, CALIBRATE_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_TIMEOUT_MS, FAILSAFE_TIMEOUT_MS,
};

/// Connection/communication settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial port name (e.g. "/dev/ttyUSB0" or "COM7")
    pub port: Option<String>,

    /// Baud rate
    pub baud_rate: u32,

    /// Timeout of a single blocking read on the transport
    pub read_timeout_ms: u64,

    /// Reply timeout for quick commands
    pub response_timeout_ms: u64,

    /// Reply timeout for calibration
    pub calibrate_timeout_ms: u64,

    /// Reply timeout for the failsafe limit search
    pub failsafe_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            calibrate_timeout_ms: CALIBRATE_TIMEOUT_MS,
            failsafe_timeout_ms: FAILSAFE_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    /// Config for a specific port with every other setting at its default
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse a configuration from JSON text
    pub fn from_json(content: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(content).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ProtocolError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Timeout of a single blocking read on the transport
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Default reply timeouts derived from this configuration
    pub fn timeouts(&self) -> ResponseTimeouts {
        ResponseTimeouts {
            response: Duration::from_millis(self.response_timeout_ms),
            calibrate: Duration::from_millis(self.calibrate_timeout_ms),
            failsafe: Duration::from_millis(self.failsafe_timeout_ms),
        }
    }
}

/// Default reply timeouts per command class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeouts {
    /// Most commands
    pub response: Duration,
    /// Encoder calibration
    pub calibrate: Duration,
    /// Failsafe limit search
    pub failsafe: Duration,
}

impl ResponseTimeouts {
    /// Timeout for a command with no explicit override
    pub fn for_command(&self, command: &Command) -> Duration {
        match command {
            Command::Calibrate => self.calibrate,
            Command::SetFailsafe(_) => self.failsafe,
            _ => self.response,
        }
    }
}

impl Default for ResponseTimeouts {
    fn default() -> Self {
        BusConfig::default().timeouts()
    }
}
