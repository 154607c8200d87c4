//! Connection management
//!
//! A `Connection` owns one open transport shared by every device handle on
//! that bus. Writes go through a mutex so frames from concurrent callers
//! never interleave; reads belong exclusively to the response router.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use super::device::DeviceHandle;
use super::inbox::{Inbox, InboxMap};
use super::router::ResponseRouter;
use crate::config::ResponseTimeouts;
use crate::protocol::{Address, CommunicationChannel, EncodedFrame, ProtocolError, Reply};
use crate::safety::SafetyGovernor;

/// Shared bus connection
pub struct Connection {
    /// Transport identifier (port name)
    transport_id: String,
    /// Baud rate the transport was opened with
    baud_rate: u32,
    /// Write half of the transport
    writer: Mutex<Box<dyn CommunicationChannel>>,
    /// Reply queues, shared with the router thread
    inboxes: Arc<InboxMap>,
    router: ResponseRouter,
    governor: Arc<SafetyGovernor>,
    timeouts: ResponseTimeouts,
}

impl Connection {
    /// Wrap an already open transport and start its response router
    pub fn open(
        transport_id: &str,
        baud_rate: u32,
        channel: Box<dyn CommunicationChannel>,
        governor: Arc<SafetyGovernor>,
        timeouts: ResponseTimeouts,
    ) -> Result<Self, ProtocolError> {
        let reader = channel.try_clone().map_err(|e| {
            ProtocolError::ConnectionFailed(format!("{}: no reader handle: {}", transport_id, e))
        })?;
        let inboxes = Arc::new(InboxMap::new());
        let router = ResponseRouter::spawn(transport_id, reader, inboxes.clone()).map_err(|e| {
            ProtocolError::ConnectionFailed(format!("{}: router did not start: {}", transport_id, e))
        })?;

        tracing::info!(transport = transport_id, baud_rate, "servo bus connection open");

        Ok(Self {
            transport_id: transport_id.to_string(),
            baud_rate,
            writer: Mutex::new(channel),
            inboxes,
            router,
            governor,
            timeouts,
        })
    }

    /// Identifier the registry opened this connection under
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Baud rate the transport was opened at
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Safety governor shared with every other connection of the registry
    pub fn governor(&self) -> &Arc<SafetyGovernor> {
        &self.governor
    }

    /// Default reply timeouts for handles on this bus
    pub fn timeouts(&self) -> ResponseTimeouts {
        self.timeouts
    }

    /// True while the reader thread is alive
    pub fn is_listening(&self) -> bool {
        self.router.is_running()
    }

    /// Write one frame and flush it before releasing the transport
    ///
    /// This is a blocking write, also when called from `DeviceHandle::send`.
    /// A frame is at most 13 bytes, roughly 1 ms on the wire at 115200 baud,
    /// so it runs inline on the calling task.
    pub fn write_frame(&self, frame: &EncodedFrame) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(frame.as_bytes())?;
        writer.flush()?;
        tracing::debug!(transport = %self.transport_id, "sent frame {}", frame);
        Ok(())
    }

    /// Inbox collecting replies reported by `address`
    pub fn inbox(&self, address: Address) -> Arc<Inbox> {
        self.inboxes.get_or_create(address)
    }

    /// Inbox in which the reply to a frame sent to `destination` will land
    ///
    /// A frame sent to broadcast has no unique responder, so its reply is
    /// picked up from the broadcast mirror.
    pub fn reply_inbox(&self, destination: Address) -> Arc<Inbox> {
        if destination.is_broadcast() {
            self.inboxes.broadcast()
        } else {
            self.inboxes.get_or_create(destination)
        }
    }

    /// Snapshot of device addresses seen on this bus or bound to a handle
    pub fn known_addresses(&self) -> Vec<Address> {
        self.inboxes.known_addresses()
    }

    /// Discard queued replies for `address`
    pub fn drain(&self, address: Address) -> Vec<Reply> {
        self.inboxes
            .get(address)
            .map(|inbox| inbox.drain())
            .unwrap_or_default()
    }

    /// Handle for the device at `address` on this connection
    pub fn device(self: &Arc<Self>, address: Address) -> DeviceHandle {
        DeviceHandle::new(self.clone(), address)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport_id", &self.transport_id)
            .field("baud_rate", &self.baud_rate)
            .field("known_addresses", &self.known_addresses())
            .finish()
    }
}
