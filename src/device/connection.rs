//! # Device Connection
//!
//! The physical link is owned by a [`Device`], which the job controller
//! holds and shares with nobody else.
//!
//! ## Locking
//!
//! | What | Primitive | Who waits |
//! |------|-----------|-----------|
//! | exclusive use (job / control op) | `AtomicBool` lease | nobody: a second caller gets `Busy` |
//! | the connection itself | `Mutex` | only the lease holder ever locks it |
//! | status snapshot | `RwLock` | readers never wait behind a burn |
//!
//! Status reads only touch the snapshot, so they proceed while a job is
//! streaming lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{JobError, TransportError};
use crate::transport::Transport;

/// Link state of the device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Port open, handshake not (yet) verified
    Connected,
    /// Handshake acknowledged, firmware version known
    Verified,
    Error,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Verified)
    }
}

/// What currently holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Idle,
    Burning,
    Control,
}

/// The physical link: port identity, state, and the transport.
pub struct DeviceConnection {
    port: String,
    baud: u32,
    state: ConnectionState,
    firmware: Option<String>,
    last_motion: Option<Instant>,
    transport: Box<dyn Transport>,
}

impl DeviceConnection {
    pub fn new(port: impl Into<String>, baud: u32, transport: Box<dyn Transport>) -> Self {
        Self {
            port: port.into(),
            baud,
            state: ConnectionState::Disconnected,
            firmware: None,
            last_motion: None,
            transport,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Last firmware version seen by a verified handshake.
    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// When the last motion command was written. Survives across leases so
    /// the settle delay holds between separate operations.
    pub fn last_motion(&self) -> Option<Instant> {
        self.last_motion
    }

    pub fn note_motion(&mut self, at: Instant) {
        self.last_motion = Some(at);
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Connection {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn mark_verified(&mut self, firmware: String) {
        self.firmware = Some(firmware);
        self.set_state(ConnectionState::Verified);
    }

    /// Open the port unless it already is.
    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.transport.is_open() {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        match self.transport.open(&self.port) {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Close the port and forget the link.
    pub fn close(&mut self) {
        self.transport.close();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close after a link fault; state stays `Error` until the next open.
    pub fn fault(&mut self) {
        self.transport.close();
        self.set_state(ConnectionState::Error);
    }
}

/// Non-exclusive view of the device, cheap to clone and serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub state: ConnectionState,
    pub port: String,
    pub mock: bool,
    pub dry_run: bool,
    pub firmware: Option<String>,
    pub mode: OperationMode,
    pub active_job: Option<Uuid>,
    pub max_width: u32,
    pub max_height: u32,
}

/// # Device
///
/// Owns the connection and arbitrates access to it.
///
/// ```
/// use std::sync::Arc;
/// use wainlux::config::Config;
/// use wainlux::device::{Device, DeviceConnection, OperationMode};
/// use wainlux::transport::MockTransport;
///
/// let config = Config::default();
/// let conn = DeviceConnection::new("mock", 115_200, Box::new(MockTransport::new()));
/// let device = Arc::new(Device::new(conn, &config));
///
/// let lease = device.try_lease(OperationMode::Control, None).unwrap();
/// assert!(device.try_lease(OperationMode::Control, None).is_err());
/// drop(lease);
/// assert!(device.try_lease(OperationMode::Control, None).is_ok());
/// ```
pub struct Device {
    leased: AtomicBool,
    connection: Mutex<DeviceConnection>,
    status: RwLock<StatusSnapshot>,
}

impl Device {
    pub fn new(connection: DeviceConnection, config: &Config) -> Self {
        let status = StatusSnapshot {
            connected: false,
            state: connection.state(),
            port: connection.port().to_string(),
            mock: config.mock,
            dry_run: config.dry_run,
            firmware: None,
            mode: OperationMode::Idle,
            active_job: None,
            max_width: config.spec.max_width,
            max_height: config.spec.max_height,
        };
        Self {
            leased: AtomicBool::new(false),
            connection: Mutex::new(connection),
            status: RwLock::new(status),
        }
    }

    /// Current snapshot. Never blocks behind a job and changes nothing.
    pub fn status(&self) -> StatusSnapshot {
        self.status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_busy(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Take exclusive use of the device, or fail immediately.
    pub fn try_lease(
        self: &Arc<Self>,
        mode: OperationMode,
        job: Option<Uuid>,
    ) -> Result<DeviceLease, JobError> {
        if self
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(JobError::Busy);
        }
        self.update_status(|s| {
            s.mode = mode;
            s.active_job = job;
        });
        Ok(DeviceLease {
            device: Arc::clone(self),
        })
    }

    fn update_status(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        f(&mut status);
    }
}

/// Exclusive access to the device. Released on drop.
pub struct DeviceLease {
    device: Arc<Device>,
}

impl DeviceLease {
    /// Lock the connection. Only lease holders reach the mutex, so this
    /// never contends.
    pub fn connection(&self) -> MutexGuard<'_, DeviceConnection> {
        self.device
            .connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Mirror the connection's state into the status snapshot.
    pub fn sync_status(&self, conn: &DeviceConnection) {
        self.device.update_status(|s| {
            s.state = conn.state();
            s.connected = conn.state().is_connected();
            s.firmware = conn.firmware().map(str::to_string);
        });
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.device.update_status(|s| {
            s.mode = OperationMode::Idle;
            s.active_job = None;
        });
        self.device.leased.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn device(mock: MockTransport) -> Arc<Device> {
        let conn = DeviceConnection::new("mock", 115_200, Box::new(mock));
        Arc::new(Device::new(conn, &Config::default()))
    }

    #[test]
    fn test_initial_status_disconnected() {
        let device = device(MockTransport::new());
        let status = device.status();
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.mode, OperationMode::Idle);
        assert_eq!(status.max_width, 1600);
    }

    #[test]
    fn test_lease_is_exclusive() {
        let device = device(MockTransport::new());
        let id = Uuid::new_v4();
        let lease = device.try_lease(OperationMode::Burning, Some(id)).unwrap();
        assert!(device.is_busy());
        assert!(matches!(
            device.try_lease(OperationMode::Control, None),
            Err(JobError::Busy)
        ));
        assert_eq!(device.status().active_job, Some(id));
        drop(lease);
        assert!(!device.is_busy());
        assert_eq!(device.status().mode, OperationMode::Idle);
    }

    #[test]
    fn test_open_and_sync() {
        let device = device(MockTransport::new());
        let lease = device.try_lease(OperationMode::Control, None).unwrap();
        {
            let mut conn = lease.connection();
            conn.open().unwrap();
            conn.mark_verified("v4.0.0".to_string());
            lease.sync_status(&conn);
        }
        let status = device.status();
        assert!(status.connected);
        assert_eq!(status.firmware.as_deref(), Some("v4.0.0"));
    }

    #[test]
    fn test_failed_open_sets_error() {
        let device = device(MockTransport::new().failing_open());
        let lease = device.try_lease(OperationMode::Control, None).unwrap();
        let mut conn = lease.connection();
        assert!(conn.open().is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
    }
}
