//! # DirectServo Core Library
//!
//! Host-side client for DirectServo motor controllers sharing one RS485 bus.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Encoding/decoding of the ASCII line protocol
//! - One shared connection per serial port, with replies routed per address
//! - Per-device handles with timeout-bounded requests
//! - A safety governor that can force every known motor to zero torque
//!
//! ## Example
//!
//! ```rust,ignore
//! use directservo_core::prelude::*;
//!
//! let registry = ConnectionRegistry::new(BusConfig::default());
//! let hip = registry.device("/dev/ttyUSB0", Address(1))?;
//! let knee = registry.device("/dev/ttyUSB0", Address(2))?;
//!
//! hip.calibrate(None).await?;
//! let angle = knee.get_angle().await?;
//! hip.torque(0.25).await?;
//!
//! // On exit
//! let report = registry.trigger_shutdown().await;
//! println!("{}", report);
//! ```

pub mod bus;
pub mod config;
pub mod protocol;
pub mod safety;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{Connection, ConnectionRegistry, DeviceHandle};
    pub use crate::config::BusConfig;
    pub use crate::protocol::{Address, Command, FailsafeParams, ProtocolError, Reply, ReplyStatus};
    pub use crate::safety::{SafetyGovernor, ShutdownReport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
