//! Transport seam between the session client and a device control server.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;

use super::error::SessionError;

/// A device reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedDevice {
    /// Server-assigned device index
    pub index: u32,
    pub name: String,
    /// Actuator indices that accept vibrate commands
    pub vibrators: Vec<u32>,
    pub added_at: DateTime<Local>,
}

impl ConnectedDevice {
    pub fn new(index: u32, name: impl Into<String>, vibrators: Vec<u32>) -> Self {
        Self {
            index,
            name: name.into(),
            vibrators,
            added_at: Local::now(),
        }
    }

    pub fn supports_vibration(&self) -> bool {
        !self.vibrators.is_empty()
    }
}

/// Notifications pushed by the transport outside of any request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    DeviceAdded(ConnectedDevice),
    DeviceRemoved(u32),
    ScanningFinished,
    /// Error reported by the server; does not change the connection state
    Error(String),
    /// The server closed the connection or the link dropped
    Disconnected,
}

/// Operations the device session needs from a control server connection.
///
/// Implementations own at most one connection. Every method except `connect`
/// fails with [`SessionError::NotConnected`] when no connection is open, and
/// `disconnect` is idempotent.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Opens a connection and returns the stream of server notifications.
    async fn connect(
        &mut self,
        uri: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SessionError>;

    /// Devices the server already knows about.
    async fn request_devices(&self) -> Result<Vec<ConnectedDevice>, SessionError>;

    async fn start_scanning(&self) -> Result<(), SessionError>;

    async fn stop_scanning(&self) -> Result<(), SessionError>;

    /// Sets every vibrator of `device` to `intensity` in [0, 1].
    async fn vibrate(&self, device: &ConnectedDevice, intensity: f32) -> Result<(), SessionError>;

    async fn stop_all(&self) -> Result<(), SessionError>;

    async fn disconnect(&mut self) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;
}
