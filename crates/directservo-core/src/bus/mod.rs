//! Bus multiplexing
//!
//! Many logical devices share one half-duplex serial connection. The
//! registry hands out one `Connection` per port, a reader thread routes
//! replies into per-address inboxes, and `DeviceHandle`s send commands and
//! wait on their own inbox.

mod connection;
mod device;
pub mod inbox;
mod registry;
pub mod router;

pub use connection::Connection;
pub use device::DeviceHandle;
pub use inbox::{Inbox, InboxMap};
pub use registry::{open_serial_channel, ConnectionRegistry, TransportOpener};
pub use router::{ResponseRouter, MALFORMED_RESYNC_THRESHOLD};
