//! In-memory transport used by the session tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::SessionError;
use super::transport::{ConnectedDevice, DeviceTransport, TransportEvent};

pub const STALL: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct FakeServer {
    pub connected: bool,
    pub fail_connect: bool,
    pub fail_scanning: bool,
    pub failing_devices: HashSet<u32>,
    /// Devices that sit on a command for [`STALL`] and then time out
    pub stalled_devices: HashSet<u32>,
    pub known_devices: Vec<ConnectedDevice>,
    pub connected_uris: Vec<String>,
    pub sent: Vec<(u32, f32)>,
    pub scanning: bool,
    pub stop_scan_calls: usize,
    pub stop_all_calls: usize,
    pub disconnect_calls: usize,
    pub events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Cloneable fake; clones share one [`FakeServer`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    server: Arc<Mutex<FakeServer>>,
}

impl FakeTransport {
    pub fn server(&self) -> MutexGuard<'_, FakeServer> {
        self.server.lock().unwrap()
    }

    /// Pushes a notification as if the server had sent it.
    pub fn emit(&self, event: TransportEvent) {
        let server = self.server();
        server
            .events
            .as_ref()
            .expect("fake transport is not connected")
            .send(event)
            .expect("event receiver dropped");
    }

    /// Simulates the server dropping the link.
    pub fn drop_link(&self) {
        let mut server = self.server();
        server.connected = false;
        server.events = None;
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn connect(
        &mut self,
        uri: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SessionError> {
        let mut server = self.server();
        server.connected_uris.push(uri.to_string());
        if server.fail_connect {
            return Err(SessionError::ConnectionFailed(format!("{}: refused", uri)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        server.events = Some(tx);
        server.connected = true;
        Ok(rx)
    }

    async fn request_devices(&self) -> Result<Vec<ConnectedDevice>, SessionError> {
        let server = self.server();
        if !server.connected {
            return Err(SessionError::NotConnected);
        }
        Ok(server.known_devices.clone())
    }

    async fn start_scanning(&self) -> Result<(), SessionError> {
        let mut server = self.server();
        if server.fail_scanning {
            return Err(SessionError::Server {
                code: 1,
                message: "no device managers".to_string(),
            });
        }
        server.scanning = true;
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), SessionError> {
        let mut server = self.server();
        server.scanning = false;
        server.stop_scan_calls += 1;
        Ok(())
    }

    async fn vibrate(&self, device: &ConnectedDevice, intensity: f32) -> Result<(), SessionError> {
        let stalled = {
            let mut server = self.server();
            if !server.connected {
                return Err(SessionError::NotConnected);
            }
            if server.failing_devices.contains(&device.index) {
                return Err(SessionError::Device {
                    index: device.index,
                    reason: "write failed".to_string(),
                });
            }
            let stalled = server.stalled_devices.contains(&device.index);
            if !stalled {
                server.sent.push((device.index, intensity));
            }
            stalled
        };
        if stalled {
            tokio::time::sleep(STALL).await;
            return Err(SessionError::Timeout(format!(
                "device {} never answered",
                device.index
            )));
        }
        Ok(())
    }

    async fn stop_all(&self) -> Result<(), SessionError> {
        self.server().stop_all_calls += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let mut server = self.server();
        server.disconnect_calls += 1;
        server.connected = false;
        server.events = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.server().connected
    }
}
