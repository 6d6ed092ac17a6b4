//! Session Handle - background owner of the device session
//!
//! The [`DeviceSessionClient`] suspends on network I/O, so it lives on its own
//! tokio task. Everything else talks to it through a [`SessionHandle`]:
//!
//! ```text
//! SessionHandle ─[SessionCommand]─────► SessionWorker ──► DeviceSessionClient ──► server
//! IntensityDispatcher ─[watch<f32>]───►      ▲
//!                                            └── TransportEvent (device added/removed, ...)
//! ```
//!
//! Intensities travel over a `watch` channel: the worker always sends the most
//! recent value and a slow transport skips stale ones instead of queueing them.
//! The tick loop therefore never waits on the session.

use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{DeviceRegistry, DeviceSessionClient, SessionStatus};
use super::error::SessionError;
use super::transport::DeviceTransport;
use crate::vibration::IntensitySink;

type Reply = Option<oneshot::Sender<Result<(), SessionError>>>;

/// Requests handled by the session worker
#[derive(Debug)]
pub enum SessionCommand {
    Connect { uri: String, reply: Reply },
    Reconnect { reply: Reply },
    Disconnect { reply: Reply },
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Address used for the first connect and for reconnects before any
    /// explicit connect
    pub server_address: Option<String>,
    /// Connect as soon as the worker starts
    pub connect_on_start: bool,
    pub command_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            server_address: None,
            connect_on_start: false,
            command_buffer: 16,
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Starting,
    Running,
}

#[machine]
pub struct SessionWorker<S: WorkerState> {
    client: DeviceSessionClient,
    commands: mpsc::Receiver<SessionCommand>,
    intensity: watch::Receiver<f32>,
    cancel: CancellationToken,
    connect_on_start: bool,
}

impl SessionWorker<Starting> {
    pub fn create(
        client: DeviceSessionClient,
        commands: mpsc::Receiver<SessionCommand>,
        intensity: watch::Receiver<f32>,
        cancel: CancellationToken,
        connect_on_start: bool,
    ) -> Self {
        Self::new(client, commands, intensity, cancel, connect_on_start)
    }

    /// Performs the startup connect, if configured, and moves to `Running`.
    pub async fn initialize(mut self) -> SessionWorker<Running> {
        if self.connect_on_start {
            match self.client.last_uri().map(str::to_string) {
                Some(uri) => {
                    if let Err(e) = self.client.connect(&uri).await {
                        warn!("Startup connect failed, waiting for an explicit reconnect: {}", e);
                    }
                }
                None => warn!("connect_on_start is set but no server address is configured"),
            }
        }
        debug!("Session worker initialized, transitioning to Running state");
        self.transition()
    }
}

impl SessionWorker<Running> {
    pub async fn run(mut self) {
        info!("Session worker running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Session worker cancelled");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        break;
                    }
                },
                event = self.client.next_event() => self.client.handle_event(event).await,
                changed = self.intensity.changed() => {
                    if changed.is_err() {
                        debug!("Intensity channel closed");
                        break;
                    }
                    let intensity = *self.intensity.borrow_and_update();
                    self.client.vibrate_all(intensity).await;
                }
            }
        }

        self.client.shutdown().await;
        info!("Session worker stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        debug!("Session command: {:?}", command);
        match command {
            SessionCommand::Connect { uri, reply } => {
                let result = self.client.connect(&uri).await;
                respond(reply, result);
            }
            SessionCommand::Reconnect { reply } => {
                let result = self.client.reconnect().await;
                if let Err(e) = &result {
                    error!("Reconnect failed: {}", e);
                }
                respond(reply, result);
            }
            SessionCommand::Disconnect { reply } => {
                self.client.disconnect().await;
                respond(reply, Ok(()));
            }
        }
    }
}

fn respond(reply: Reply, result: Result<(), SessionError>) {
    if let Some(reply) = reply {
        if reply.send(result).is_err() {
            debug!("Session command caller stopped waiting");
        }
    }
}

/// [`IntensitySink`] feeding the session worker. Never blocks.
#[derive(Clone, Debug)]
pub struct IntensityDispatcher {
    sender: Arc<watch::Sender<f32>>,
}

impl IntensitySink for IntensityDispatcher {
    fn dispatch(&self, intensity: f32) {
        // send_replace marks the value changed even if it is equal, so a
        // periodic resend still reaches the devices.
        self.sender.send_replace(intensity);
    }
}

/// Public handle to the background device session.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    intensity: Arc<watch::Sender<f32>>,
    status: watch::Receiver<SessionStatus>,
    devices: DeviceRegistry,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawns the session worker on the current tokio runtime.
    pub fn spawn(transport: Box<dyn DeviceTransport>, settings: SessionSettings) -> Self {
        info!("Spawning session worker with settings: {:?}", settings);

        let client = DeviceSessionClient::new(transport, settings.server_address.clone());
        let status = client.subscribe_status();
        let devices = client.registry().clone();

        let (commands_tx, commands_rx) = mpsc::channel(settings.command_buffer.max(1));
        let (intensity_tx, intensity_rx) = watch::channel(0.0_f32);
        let cancel = CancellationToken::new();

        let worker = SessionWorker::create(
            client,
            commands_rx,
            intensity_rx,
            cancel.clone(),
            settings.connect_on_start,
        );
        let worker = tokio::spawn(async move {
            let worker = worker.initialize().await;
            worker.run().await;
        });

        Self {
            commands: commands_tx,
            intensity: Arc::new(intensity_tx),
            status,
            devices,
            cancel,
            worker,
        }
    }

    pub fn dispatcher(&self) -> IntensityDispatcher {
        IntensityDispatcher {
            sender: self.intensity.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub async fn connect(&self, uri: impl Into<String>) -> Result<(), SessionError> {
        let uri = uri.into();
        self.call(|reply| SessionCommand::Connect { uri, reply }).await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::Reconnect { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::Disconnect { reply }).await
    }

    /// Queues a reconnect without waiting for it; for callers on the tick thread.
    pub fn request_reconnect(&self) {
        self.post(SessionCommand::Reconnect { reply: None });
    }

    pub fn request_disconnect(&self) {
        self.post(SessionCommand::Disconnect { reply: None });
    }

    /// Stops the worker and waits until the session is torn down.
    pub async fn shutdown(self) {
        info!("Shutting down session worker");
        self.cancel.cancel();
        if let Err(e) = self.worker.await {
            error!("Session worker terminated abnormally: {}", e);
        }
    }

    async fn call<F>(&self, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(Reply) -> SessionCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(Some(reply_tx)))
            .await
            .map_err(|e| SessionError::ChannelError(format!("session worker gone: {}", e)))?;
        reply_rx
            .await
            .map_err(|e| SessionError::ChannelError(format!("no reply from session worker: {}", e)))?
    }

    fn post(&self, command: SessionCommand) {
        if let Err(e) = self.commands.try_send(command) {
            warn!("Dropping session command: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeTransport;
    use crate::session::transport::ConnectedDevice;
    use std::time::Duration;

    const URI: &str = "ws://127.0.0.1:12345";

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn settings(connect_on_start: bool) -> SessionSettings {
        SessionSettings {
            server_address: Some(URI.to_string()),
            connect_on_start,
            ..SessionSettings::default()
        }
    }

    #[tokio::test]
    async fn connects_on_start_and_forwards_intensity() {
        let fake = FakeTransport::default();
        fake.server().known_devices = vec![ConnectedDevice::new(2, "Edge", vec![0])];
        let handle = SessionHandle::spawn(Box::new(fake.clone()), settings(true));

        let mut status = handle.subscribe_status();
        status
            .wait_for(|s| s.is_connected())
            .await
            .expect("worker gone");

        handle.dispatcher().dispatch(0.4);
        wait_for(|| fake.server().sent.contains(&(2, 0.4))).await;

        handle.shutdown().await;
        let server = fake.server();
        assert!(!server.connected);
        assert_eq!(server.stop_all_calls, 1);
    }

    #[tokio::test]
    async fn awaited_commands_report_results() {
        let fake = FakeTransport::default();
        let handle = SessionHandle::spawn(Box::new(fake.clone()), settings(false));
        assert_eq!(handle.status(), SessionStatus::Disconnected);

        handle.connect(URI).await.unwrap();
        assert!(handle.status().is_connected());

        handle.disconnect().await.unwrap();
        handle.disconnect().await.unwrap();
        assert_eq!(handle.status(), SessionStatus::Disconnected);

        fake.server().fail_connect = true;
        assert!(handle.reconnect().await.is_err());
        assert_eq!(handle.status(), SessionStatus::Disconnected);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn fire_and_forget_reconnect() {
        let fake = FakeTransport::default();
        let handle = SessionHandle::spawn(Box::new(fake.clone()), settings(false));

        handle.request_reconnect();
        let mut status = handle.subscribe_status();
        status
            .wait_for(|s| s.is_connected())
            .await
            .expect("worker gone");
        assert_eq!(fake.server().connected_uris, vec![URI]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn device_notifications_reach_the_shared_registry() {
        let fake = FakeTransport::default();
        let handle = SessionHandle::spawn(Box::new(fake.clone()), settings(false));
        handle.connect(URI).await.unwrap();

        fake.emit(crate::session::TransportEvent::DeviceAdded(
            ConnectedDevice::new(5, "Lush", vec![0]),
        ));
        let devices = handle.devices().clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while devices.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device never registered");

        fake.drop_link();
        let mut status = handle.subscribe_status();
        status
            .wait_for(|s| *s == SessionStatus::Disconnected)
            .await
            .expect("worker gone");
        assert!(devices.is_empty().await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_startup_connect_keeps_worker_alive() {
        let fake = FakeTransport::default();
        fake.server().fail_connect = true;
        let handle = SessionHandle::spawn(Box::new(fake.clone()), settings(true));

        wait_for(|| !fake.server().connected_uris.is_empty()).await;
        assert_eq!(handle.status(), SessionStatus::Disconnected);

        fake.server().fail_connect = false;
        handle.reconnect().await.unwrap();
        assert!(handle.status().is_connected());

        handle.shutdown().await;
    }
}
