use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::error::SessionError;
use super::transport::{ConnectedDevice, DeviceTransport, TransportEvent};
use crate::intensity::clamp_unit;

/// Lifecycle of the device session.
///
/// ```text
/// Disconnected ──► Connecting ──► Scanning ──► Idle
///       ▲              │             │          │
///       └──────────────┴─────────────┴──────────┘
///    (explicit disconnect, server disconnect, connect failure)
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    /// Connected with device discovery running
    Scanning,
    /// Connected, discovery finished or unavailable
    Idle,
}

impl SessionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, SessionStatus::Scanning | SessionStatus::Idle)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Scanning => "connected (scanning)",
            SessionStatus::Idle => "connected",
        };
        write!(f, "{}", name)
    }
}

/// Devices of the current session, keyed by server index.
///
/// Shared between the session worker, which writes it, and anyone who wants a
/// snapshot. The lock is only held to insert, remove or copy entries, never
/// across device I/O.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<u32, ConnectedDevice>>>,
}

impl DeviceRegistry {
    pub async fn insert(&self, device: ConnectedDevice) -> Option<ConnectedDevice> {
        self.devices.write().await.insert(device.index, device)
    }

    pub async fn remove(&self, index: u32) -> Option<ConnectedDevice> {
        self.devices.write().await.remove(&index)
    }

    pub async fn clear(&self) {
        self.devices.write().await.clear();
    }

    pub async fn snapshot(&self) -> Vec<ConnectedDevice> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn vibration_capable(&self) -> Vec<ConnectedDevice> {
        self.devices
            .read()
            .await
            .values()
            .filter(|device| device.supports_vibration())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

/// Owns the connection to the device control server.
///
/// Not thread-safe by itself; the session worker is its only user. Transport
/// failures are logged here and never escalate beyond the failing operation.
pub struct DeviceSessionClient {
    transport: Box<dyn DeviceTransport>,
    registry: DeviceRegistry,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    status: watch::Sender<SessionStatus>,
    last_uri: Option<String>,
}

impl DeviceSessionClient {
    pub fn new(transport: Box<dyn DeviceTransport>, default_uri: Option<String>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            transport,
            registry: DeviceRegistry::default(),
            events: None,
            status,
            last_uri: default_uri,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn last_uri(&self) -> Option<&str> {
        self.last_uri.as_deref()
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!("Session status: {} -> {}", previous, status);
        }
    }

    /// Replaces any existing session with a new one to `uri`.
    pub async fn connect(&mut self, uri: &str) -> Result<(), SessionError> {
        self.disconnect().await;
        self.last_uri = Some(uri.to_string());
        self.set_status(SessionStatus::Connecting);
        info!("Connecting to device server at {}", uri);

        let events = match self.transport.connect(uri).await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to connect to device server at {}: {}", uri, e);
                // Clears whatever half-open state the transport kept
                if let Err(e) = self.transport.disconnect().await {
                    debug!("Cleanup after failed connect: {}", e);
                }
                self.set_status(SessionStatus::Disconnected);
                return Err(e);
            }
        };
        self.events = Some(events);

        match self.transport.request_devices().await {
            Ok(devices) => {
                for device in devices {
                    self.add_device(device).await;
                }
            }
            Err(e) => warn!("Failed to fetch the current device list: {}", e),
        }

        match self.transport.start_scanning().await {
            Ok(()) => {
                info!("Connected to {}, scanning for devices", uri);
                self.set_status(SessionStatus::Scanning);
            }
            Err(e) => {
                warn!("Connected to {}, but device scanning failed: {}", uri, e);
                self.set_status(SessionStatus::Idle);
            }
        }
        Ok(())
    }

    /// Tears the session down. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        let was = self.status();
        // Unsubscribe first so no stale notification outlives the session
        self.events = None;

        if self.transport.is_connected() {
            if was == SessionStatus::Scanning {
                if let Err(e) = self.transport.stop_scanning().await {
                    warn!("Failed to stop scanning: {}", e);
                }
            }
            if let Err(e) = self.transport.stop_all().await {
                warn!("Failed to stop devices: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to close device server connection: {}", e);
        }

        self.registry.clear().await;
        self.set_status(SessionStatus::Disconnected);
        if was != SessionStatus::Disconnected {
            info!("Disconnected from device server");
        }
    }

    /// Disconnects, then connects again to the last used address.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        let uri = self.last_uri.clone().ok_or(SessionError::NoServerAddress)?;
        info!("Reconnecting to {}", uri);
        self.disconnect().await;
        self.connect(&uri).await
    }

    /// Sends `intensity` to every device that can vibrate; returns how many
    /// accepted it. Devices are driven concurrently, so a failing or
    /// unresponsive device neither stops nor delays the others.
    pub async fn vibrate_all(&self, intensity: f32) -> usize {
        let intensity = clamp_unit(intensity);
        let targets = self.registry.vibration_capable().await;
        let results = join_all(
            targets
                .iter()
                .map(|device| self.transport.vibrate(device, intensity)),
        )
        .await;

        let mut delivered = 0;
        for (device, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Failed to send intensity {:.3} to device {} ({}): {}",
                    intensity, device.index, device.name, e
                ),
            }
        }
        if !targets.is_empty() {
            debug!(
                "Intensity {:.3} delivered to {}/{} devices",
                intensity,
                delivered,
                targets.len()
            );
        }
        delivered
    }

    /// Next transport notification. Pends forever while disconnected, so it
    /// can sit in a `select!` next to other sources.
    pub async fn next_event(&mut self) -> TransportEvent {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        match events.recv().await {
            Some(event) => event,
            None => {
                // The transport dropped its sender: the link is gone
                self.events = None;
                TransportEvent::Disconnected
            }
        }
    }

    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceAdded(device) => self.add_device(device).await,
            TransportEvent::DeviceRemoved(index) => match self.registry.remove(index).await {
                Some(device) => info!("Device removed: {} ({})", device.name, index),
                None => warn!("Server removed unknown device {}", index),
            },
            TransportEvent::ScanningFinished => {
                info!("Device scanning finished");
                if self.status() == SessionStatus::Scanning {
                    self.set_status(SessionStatus::Idle);
                }
            }
            TransportEvent::Error(message) => {
                error!("Device server reported an error: {}", message);
            }
            TransportEvent::Disconnected => {
                warn!("Device server closed the connection");
                self.disconnect().await;
            }
        }
    }

    /// Final teardown before exit.
    pub async fn shutdown(&mut self) {
        info!("Shutting down device session");
        self.disconnect().await;
    }

    async fn add_device(&self, device: ConnectedDevice) {
        info!(
            "Device added: {} ({}), vibration: {}",
            device.name,
            device.index,
            if device.supports_vibration() {
                "yes"
            } else {
                "no"
            }
        );
        if let Some(previous) = self.registry.insert(device).await {
            debug!("Replaced existing entry for device {}", previous.index);
        }
    }
}
