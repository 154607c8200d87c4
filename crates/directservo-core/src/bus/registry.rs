//! Connection registry
//!
//! Maps transport identifiers (port names) to their single live
//! `Connection`. Construct one registry at process start and pass it to
//! whatever needs device handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::connection::Connection;
use super::device::DeviceHandle;
use crate::config::BusConfig;
use crate::protocol::{
    clear_buffers, configure_port, open_port, Address, CommunicationChannel, ProtocolError,
    SerialChannel,
};
use crate::safety::{SafetyGovernor, ShutdownReport};

/// Opens the transport for an identifier at a baud rate
pub type TransportOpener = Box<
    dyn Fn(&str, u32) -> Result<Box<dyn CommunicationChannel>, ProtocolError> + Send + Sync,
>;

/// Open and prepare a serial port as a bus transport
pub fn open_serial_channel(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn CommunicationChannel>, ProtocolError> {
    let mut port = open_port(name, Some(baud_rate), Some(read_timeout))?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;
    Ok(Box::new(SerialChannel::new(port)))
}

/// Process-wide set of open bus connections
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    opener: TransportOpener,
    governor: Arc<SafetyGovernor>,
    config: BusConfig,
}

impl ConnectionRegistry {
    /// Registry that opens serial ports
    pub fn new(config: BusConfig) -> Self {
        let read_timeout = config.read_timeout();
        Self::with_opener(config, move |name, baud| {
            open_serial_channel(name, baud, read_timeout)
        })
    }

    /// Registry with a custom transport opener
    pub fn with_opener<F>(config: BusConfig, opener: F) -> Self
    where
        F: Fn(&str, u32) -> Result<Box<dyn CommunicationChannel>, ProtocolError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            connections: Mutex::new(HashMap::new()),
            opener: Box::new(opener),
            governor: Arc::new(SafetyGovernor::new()),
            config,
        }
    }

    /// Configuration new connections are opened with
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Governor shared by every connection of this registry
    pub fn governor(&self) -> &Arc<SafetyGovernor> {
        &self.governor
    }

    /// Get the connection for `transport_id`, opening it on first use
    ///
    /// The registry lock is held across the open, so concurrent first callers
    /// end up sharing one transport and one router. An open failure is
    /// returned to the caller and nothing is registered.
    pub fn acquire(&self, transport_id: &str, baud_rate: u32) -> Result<Arc<Connection>, ProtocolError> {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = connections.get(transport_id) {
            if existing.baud_rate() != baud_rate {
                tracing::warn!(
                    transport = transport_id,
                    "already open at {} baud, ignoring request for {}",
                    existing.baud_rate(),
                    baud_rate
                );
            }
            return Ok(existing.clone());
        }

        let connection = self.open_connection(transport_id, baud_rate).map_err(|e| {
            tracing::error!(transport = transport_id, "failed to open transport: {}", e);
            e
        })?;
        connections.insert(transport_id.to_string(), connection.clone());
        Ok(connection)
    }

    fn open_connection(&self, transport_id: &str, baud_rate: u32) -> Result<Arc<Connection>, ProtocolError> {
        let mut channel = (self.opener)(transport_id, baud_rate)?;
        channel
            .set_read_timeout(self.config.read_timeout())
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", transport_id, e)))?;
        let connection = Connection::open(
            transport_id,
            baud_rate,
            channel,
            self.governor.clone(),
            self.config.timeouts(),
        )?;
        Ok(Arc::new(connection))
    }

    /// Acquire the port named in the configuration
    pub fn acquire_configured(&self) -> Result<Arc<Connection>, ProtocolError> {
        let port = self
            .config
            .port
            .clone()
            .ok_or_else(|| ProtocolError::Config("no serial port configured".to_string()))?;
        self.acquire(&port, self.config.baud_rate)
    }

    /// Handle for the device at `address` on `transport_id`, at the configured baud rate
    pub fn device(&self, transport_id: &str, address: Address) -> Result<DeviceHandle, ProtocolError> {
        let connection = self.acquire(transport_id, self.config.baud_rate)?;
        Ok(DeviceHandle::new(connection, address))
    }

    /// Snapshot of every open connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<Arc<Connection>> = connections.values().cloned().collect();
        snapshot.sort_by(|a, b| a.transport_id().cmp(b.transport_id()));
        snapshot
    }

    /// Force zero torque on every known device of every open connection
    pub async fn trigger_shutdown(&self) -> ShutdownReport {
        let connections = self.connections();
        self.governor.trigger_shutdown(&connections).await
    }

    /// `trigger_shutdown` for synchronous exit paths such as `Drop` impls or
    /// signal handlers.
    ///
    /// The sweep runs on a private runtime. When the calling thread already
    /// drives a tokio runtime, that private runtime lives on a helper thread
    /// and the caller blocks until it finishes.
    pub fn trigger_shutdown_blocking(&self) -> Result<ShutdownReport, ProtocolError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return self.shutdown_on_private_runtime();
        }

        std::thread::scope(|scope| {
            scope
                .spawn(|| self.shutdown_on_private_runtime())
                .join()
                .unwrap_or_else(|_| {
                    Err(ProtocolError::ShutdownFailed(
                        "shutdown thread panicked".to_string(),
                    ))
                })
        })
    }

    fn shutdown_on_private_runtime(&self) -> Result<ShutdownReport, ProtocolError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| ProtocolError::ShutdownFailed(format!("no runtime for shutdown: {}", e)))?;
        Ok(runtime.block_on(self.trigger_shutdown()))
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
