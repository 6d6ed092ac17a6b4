//! [`DeviceTransport`] over a websocket speaking the Buttplug v3 JSON protocol.
//!
//! A reader task owns the receiving half of the socket. Replies are routed to
//! the waiting request by id; id 0 messages become [`TransportEvent`]s. When
//! the server asks for pings, a keepalive task sends one at half the allowed
//! interval.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::error::SessionError;
use super::protocol::{
    decode_server_batch, encode_batch, ClientMessage, MessageId, RequestServerInfo, ScalarCmd,
    ServerMessage, MESSAGE_VERSION, SYSTEM_ID,
};
use super::transport::{ConnectedDevice, DeviceTransport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReplies = Mutex<HashMap<u32, oneshot::Sender<ServerMessage>>>;

#[derive(Clone, Debug)]
pub struct WebSocketSettings {
    /// Name announced in the handshake
    pub client_name: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            client_name: "hapticlink".to_string(),
            request_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared by the transport, the reader and the keepalive task
struct LinkShared {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: PendingReplies,
    next_id: AtomicU32,
    alive: AtomicBool,
    request_timeout: Duration,
}

impl LinkShared {
    async fn request<F>(&self, build: F) -> Result<ServerMessage, SessionError>
    where
        F: FnOnce(u32) -> ClientMessage,
    {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SessionError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = build(id);
        let text = encode_batch(&[message])?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        let sent = self.sink.lock().await.send(Message::Text(text)).await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(ServerMessage::Error(err))) => Err(SessionError::Server {
                code: err.error_code,
                message: err.error_message,
            }),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::Timeout(format!("no reply to message {}", id)))
            }
        }
    }

    /// Request whose only valid reply is `Ok`.
    async fn expect_ok<F>(&self, what: &str, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(u32) -> ClientMessage,
    {
        match self.request(build).await? {
            ServerMessage::Ok(_) => Ok(()),
            other => Err(SessionError::Protocol(format!(
                "unexpected reply to {}: {:?}",
                what, other
            ))),
        }
    }
}

struct Link {
    shared: Arc<LinkShared>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(keepalive) = &self.keepalive {
            keepalive.abort();
        }
    }
}

pub struct WebSocketTransport {
    settings: WebSocketSettings,
    link: Option<Link>,
}

impl WebSocketTransport {
    pub fn new(settings: WebSocketSettings) -> Self {
        Self {
            settings,
            link: None,
        }
    }

    fn shared(&self) -> Result<&Arc<LinkShared>, SessionError> {
        self.link
            .as_ref()
            .map(|link| &link.shared)
            .ok_or(SessionError::NotConnected)
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(WebSocketSettings::default())
    }
}

#[async_trait]
impl DeviceTransport for WebSocketTransport {
    async fn connect(
        &mut self,
        uri: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SessionError> {
        // Drop any previous link first; Link::drop stops its tasks.
        self.disconnect().await?;

        let (stream, _response) =
            match tokio::time::timeout(self.settings.connect_timeout, connect_async(uri)).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    return Err(SessionError::ConnectionFailed(format!("{}: {}", uri, e)));
                }
                Err(_) => {
                    return Err(SessionError::ConnectionFailed(format!(
                        "{}: timed out after {:?}",
                        uri, self.settings.connect_timeout
                    )));
                }
            };
        debug!("Websocket to {} open", uri);

        let (sink, source) = stream.split();
        let shared = Arc::new(LinkShared {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            request_timeout: self.settings.request_timeout,
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(source, shared.clone(), event_tx));

        let mut link = Link {
            shared: shared.clone(),
            reader,
            keepalive: None,
        };

        let client_name = self.settings.client_name.clone();
        let info = match shared
            .request(|id| {
                ClientMessage::RequestServerInfo(RequestServerInfo {
                    id,
                    client_name,
                    message_version: MESSAGE_VERSION,
                })
            })
            .await
        {
            Ok(ServerMessage::ServerInfo(info)) => info,
            Ok(other) => {
                return Err(SessionError::ConnectionFailed(format!(
                    "handshake answered with {:?}",
                    other
                )));
            }
            Err(e) => return Err(SessionError::ConnectionFailed(format!("handshake: {}", e))),
        };
        info!(
            "Connected to {} (message version {}, max ping {}ms)",
            if info.server_name.is_empty() {
                uri
            } else {
                info.server_name.as_str()
            },
            info.message_version,
            info.max_ping_time
        );

        if info.max_ping_time > 0 {
            let period = Duration::from_millis(u64::from((info.max_ping_time / 2).max(1)));
            link.keepalive = Some(tokio::spawn(keepalive_loop(shared, period)));
        }

        self.link = Some(link);
        Ok(event_rx)
    }

    async fn request_devices(&self) -> Result<Vec<ConnectedDevice>, SessionError> {
        let reply = self
            .shared()?
            .request(|id| ClientMessage::RequestDeviceList(MessageId { id }))
            .await?;
        match reply {
            ServerMessage::DeviceList(list) => Ok(list
                .devices
                .into_iter()
                .map(|info| info.into_device())
                .collect()),
            other => Err(SessionError::Protocol(format!(
                "unexpected reply to RequestDeviceList: {:?}",
                other
            ))),
        }
    }

    async fn start_scanning(&self) -> Result<(), SessionError> {
        self.shared()?
            .expect_ok("StartScanning", |id| {
                ClientMessage::StartScanning(MessageId { id })
            })
            .await
    }

    async fn stop_scanning(&self) -> Result<(), SessionError> {
        self.shared()?
            .expect_ok("StopScanning", |id| {
                ClientMessage::StopScanning(MessageId { id })
            })
            .await
    }

    async fn vibrate(&self, device: &ConnectedDevice, intensity: f32) -> Result<(), SessionError> {
        self.shared()?
            .expect_ok("ScalarCmd", |id| {
                ClientMessage::ScalarCmd(ScalarCmd::vibrate(id, device, intensity))
            })
            .await
            .map_err(|e| SessionError::Device {
                index: device.index,
                reason: e.to_string(),
            })
    }

    async fn stop_all(&self) -> Result<(), SessionError> {
        self.shared()?
            .expect_ok("StopAllDevices", |id| {
                ClientMessage::StopAllDevices(MessageId { id })
            })
            .await
    }

    async fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.shared.alive.store(false, Ordering::Release);
        if let Some(keepalive) = &link.keepalive {
            keepalive.abort();
        }
        let closed = link.shared.sink.lock().await.close().await;
        if let Err(e) = closed {
            // Already gone from the other side
            debug!("Websocket close failed: {}", e);
        }
        info!("Websocket connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.shared.alive.load(Ordering::Acquire))
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    shared: Arc<LinkShared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode_server_batch(&text) {
                Ok(messages) => {
                    for message in messages {
                        route_message(message, &shared, &events).await;
                    }
                }
                Err(e) => warn!("Discarding malformed frame: {}", e),
            },
            Ok(Message::Close(frame)) => {
                info!("Server closed the websocket: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Websocket read failed: {}", e);
                break;
            }
        }
    }

    shared.alive.store(false, Ordering::Release);
    // Dropping the senders fails every outstanding request.
    shared.pending.lock().await.clear();
    if events.send(TransportEvent::Disconnected).is_err() {
        debug!("Event receiver already dropped");
    }
}

async fn route_message(
    message: ServerMessage,
    shared: &LinkShared,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let id = message.id();
    if id != SYSTEM_ID {
        let waiter = shared.pending.lock().await.remove(&id);
        match (waiter, message) {
            (Some(waiter), message) => {
                if waiter.send(message).is_err() {
                    debug!("Reply to message {} arrived after its request gave up", id);
                }
            }
            (None, ServerMessage::Error(err)) => {
                forward(events, TransportEvent::Error(err.error_message));
            }
            (None, message) => warn!("Unsolicited reply {:?}", message),
        }
        return;
    }

    let event = match message {
        ServerMessage::DeviceAdded(info) => TransportEvent::DeviceAdded(info.into_device()),
        ServerMessage::DeviceRemoved(removed) => TransportEvent::DeviceRemoved(removed.device_index),
        ServerMessage::ScanningFinished(_) => TransportEvent::ScanningFinished,
        ServerMessage::Error(err) => TransportEvent::Error(err.error_message),
        other => {
            debug!("Ignoring server message {:?}", other);
            return;
        }
    };
    forward(events, event);
}

fn forward(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
    if let Err(e) = events.send(event) {
        debug!("Dropping transport event, receiver gone: {:?}", e.0);
    }
}

async fn keepalive_loop(shared: Arc<LinkShared>, period: Duration) {
    debug!("Keepalive ping every {:?}", period);
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = shared
            .expect_ok("Ping", |id| ClientMessage::Ping(MessageId { id }))
            .await
        {
            warn!("Keepalive ping failed: {}", e);
            break;
        }
    }
}
