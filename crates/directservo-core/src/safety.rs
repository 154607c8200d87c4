//! Safety governor
//!
//! Global kill switch for every controller the process has talked to.
//! While disarmed, non-zero torque is refused locally before reaching the
//! wire. The shutdown sweep disarms, commands zero torque on every known
//! device, then runs an optional user hook.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::bus::{Connection, DeviceHandle};
use crate::protocol::{Address, Command, ReplyStatus};

/// Callback run after the shutdown sweep
pub type ShutdownHook = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// A device on a specific transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    /// Connection the device sits on
    pub transport_id: String,
    /// Bus address of the device
    pub address: Address,
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.address, self.transport_id)
    }
}

/// Outcome of a shutdown sweep
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Devices that acknowledged zero torque
    pub stopped: Vec<DeviceRef>,
    /// Devices that could not be confirmed stopped, with the reason
    pub failed: Vec<(DeviceRef, String)>,
    /// Error returned by the user hook, if any
    pub hook_error: Option<String>,
}

impl ShutdownReport {
    /// True when every device stopped and the hook succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.hook_error.is_none()
    }

    /// Number of zero-torque commands issued
    pub fn attempted(&self) -> usize {
        self.stopped.len() + self.failed.len()
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stopped {} motor(s)", self.stopped.len())?;
        for (device, reason) in &self.failed {
            write!(f, "; {} not confirmed: {}", device, reason)?;
        }
        if let Some(err) = &self.hook_error {
            write!(f, "; shutdown hook failed: {}", err)?;
        }
        Ok(())
    }
}

/// Armed/disarmed flag plus the exit-time sweep
pub struct SafetyGovernor {
    armed: AtomicBool,
    user_hook: RwLock<Option<ShutdownHook>>,
}

impl SafetyGovernor {
    /// New governor, armed
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
            user_hook: RwLock::new(None),
        }
    }

    /// Allow non-zero torque again
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Relaxed);
        tracing::info!("motors armed");
    }

    /// Refuse non-zero torque until re-armed
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Relaxed);
        tracing::info!("motors disarmed");
    }

    /// Whether non-zero torque is currently allowed
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    /// Register a callback to run after every shutdown sweep, replacing any previous one
    pub fn set_user_hook<F>(&self, hook: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut slot = self.user_hook.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Box::new(hook));
    }

    /// Remove the shutdown hook
    pub fn clear_user_hook(&self) {
        let mut slot = self.user_hook.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// Disarm, send one zero-torque command to every known device on each
    /// connection, then run the user hook.
    ///
    /// Devices that fail to acknowledge are reported, not retried. Safe to call
    /// repeatedly; each call sweeps again.
    pub async fn trigger_shutdown(&self, connections: &[Arc<Connection>]) -> ShutdownReport {
        self.disarm();
        let mut report = ShutdownReport::default();

        for connection in connections {
            let timeout = connection.timeouts().response;
            for address in connection.known_addresses() {
                let device = DeviceRef {
                    transport_id: connection.transport_id().to_string(),
                    address,
                };
                let handle = DeviceHandle::new(connection.clone(), address);

                match handle.send(Command::Torque { ratio: 0.0 }, timeout).await {
                    Ok(reply) if reply.status == ReplyStatus::Ok => report.stopped.push(device),
                    Ok(reply) => {
                        tracing::warn!("{} did not confirm zero torque: {:?}", device, reply.status);
                        report.failed.push((device, format!("{:?}", reply.status)));
                    }
                    Err(e) => {
                        tracing::warn!("could not reach {}: {}", device, e);
                        report.failed.push((device, e.to_string()));
                    }
                }
            }
        }

        let hook = self.user_hook.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = hook.as_ref() {
            if let Err(e) = hook() {
                tracing::warn!("shutdown hook failed: {:#}", e);
                report.hook_error = Some(format!("{:#}", e));
            }
        }

        tracing::info!("shutdown sweep complete: {}", report);
        report
    }
}

impl Default for SafetyGovernor {
    fn default() -> Self {
        Self::new()
    }
}
