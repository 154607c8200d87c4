//! Device handles
//!
//! A `DeviceHandle` binds one bus address to a shared connection. Sending a
//! command writes the frame and then waits on the inbox the reply will be
//! routed to; nothing is read from the transport directly.

use std::sync::Arc;
use std::time::Duration;

use super::connection::Connection;
use crate::protocol::{encode, Address, Command, FailsafeParams, ProtocolError, Reply};

/// Per-address façade over a shared connection
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    address: Address,
    connection: Arc<Connection>,
}

impl DeviceHandle {
    /// Bind a handle. The address becomes known to the connection, so the
    /// shutdown sweep will include it.
    pub fn new(connection: Arc<Connection>, address: Address) -> Self {
        if !address.is_broadcast() {
            connection.inbox(address);
        }
        Self {
            address,
            connection,
        }
    }

    /// Address this handle talks to
    pub fn address(&self) -> Address {
        self.address
    }

    /// Connection the handle sends through
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Send a command to this handle's address and wait up to `timeout` for the reply
    pub async fn send(&self, command: Command, timeout: Duration) -> Result<Reply, ProtocolError> {
        self.send_to(self.address, command, timeout).await
    }

    /// Send a command to an explicit destination through this handle's connection
    ///
    /// Parameter validation happens before anything is written. A non-zero
    /// torque while the governor is disarmed is answered locally with
    /// `SafetyRejected`. A timeout yields `NoResponse`; a reply arriving after
    /// that stays queued for the next reader.
    pub async fn send_to(
        &self,
        destination: Address,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, ProtocolError> {
        let frame = encode(destination, &command)?;

        if command.is_nonzero_torque() && !self.connection.governor().is_armed() {
            tracing::warn!(
                transport = %self.connection.transport_id(),
                "rejected torque for {} while disarmed",
                destination
            );
            return Ok(Reply::safety_rejected(destination));
        }

        let inbox = self.connection.reply_inbox(destination);
        if destination.is_broadcast() {
            // The mirror holds every earlier reply on the bus
            inbox.drain();
        }
        self.connection.write_frame(&frame)?;

        match inbox.recv_timeout(timeout).await {
            Some(reply) => Ok(reply),
            None => {
                tracing::debug!(
                    transport = %self.connection.transport_id(),
                    "no response from {} within {:?}",
                    destination,
                    timeout
                );
                Ok(Reply::no_response(Address::BROADCAST))
            }
        }
    }

    fn default_timeout(&self, command: &Command) -> Duration {
        self.connection.timeouts().for_command(command)
    }

    async fn send_default(&self, command: Command) -> Result<Reply, ProtocolError> {
        let timeout = self.default_timeout(&command);
        self.send(command, timeout).await
    }

    /// Set torque as a ratio of rated output, clamped to [-1.0, 1.0]
    pub async fn torque(&self, ratio: f64) -> Result<Reply, ProtocolError> {
        self.send_default(Command::Torque { ratio }).await
    }

    /// Assign a new address
    ///
    /// `new_address` defaults to this handle's address and `destination` to
    /// broadcast, which provisions the single controller on a bus.
    pub async fn set_id(
        &self,
        new_address: Option<u16>,
        destination: Option<Address>,
    ) -> Result<Reply, ProtocolError> {
        let command = Command::SetId {
            new_address: new_address.unwrap_or(self.address.value() as u16),
        };
        let timeout = self.default_timeout(&command);
        self.send_to(destination.unwrap_or(Address::BROADCAST), command, timeout)
            .await
    }

    /// Run encoder calibration; the controller answers once the sweep is done
    pub async fn calibrate(&self, timeout: Option<Duration>) -> Result<Reply, ProtocolError> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout(&Command::Calibrate));
        self.send(Command::Calibrate, timeout).await
    }

    /// Current angle in degrees, `None` unless the controller answered OK
    pub async fn get_angle(&self) -> Result<Option<f64>, ProtocolError> {
        Ok(self.get_state().await?.angle_degrees)
    }

    /// Peak acceleration since the previous report
    pub async fn get_accel(&self) -> Result<Option<u8>, ProtocolError> {
        Ok(self.get_state().await?.accel)
    }

    /// Full state reply for the angle query
    pub async fn get_state(&self) -> Result<Reply, ProtocolError> {
        self.send_default(Command::GetAngle).await
    }

    /// Make the current position the zero angle
    pub async fn set_zero_angle(&self) -> Result<Reply, ProtocolError> {
        self.send_default(Command::SetZeroAngle).await
    }

    /// Configure the failsafe and start the limit search
    pub async fn set_failsafe(
        &self,
        params: FailsafeParams,
        timeout: Option<Duration>,
    ) -> Result<Reply, ProtocolError> {
        let command = Command::SetFailsafe(params);
        let timeout = timeout.unwrap_or_else(|| self.default_timeout(&command));
        self.send(command, timeout).await
    }

    /// Reset controller flash to defaults
    pub async fn reset(&self) -> Result<Reply, ProtocolError> {
        self.send_default(Command::Reset).await
    }

    /// Discard replies still queued for this handle (late or unsolicited ones)
    pub fn drain_inbox(&self) -> Vec<Reply> {
        self.connection.reply_inbox(self.address).drain()
    }
}
