//! Drives the websocket transport against an in-process Buttplug server.

use futures_util::{SinkExt, StreamExt};
use hapticlink::session::protocol::{
    ClientMessage, DeviceInfo, DeviceList, DeviceMessages, ErrorMessage, MessageId,
    ScalarAttribute, ServerInfo, ServerMessage,
};
use hapticlink::session::{
    DeviceSessionClient, SessionError, SessionHandle, SessionSettings, SessionStatus,
    TransportEvent, WebSocketSettings, WebSocketTransport,
};
use hapticlink::vibration::IntensitySink;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(3);

struct FakeServer {
    uri: String,
    seen: mpsc::UnboundedReceiver<ClientMessage>,
    /// `None` closes the connection
    push: mpsc::UnboundedSender<Option<ServerMessage>>,
}

impl FakeServer {
    async fn start(devices: Vec<DeviceInfo>, fail_scanning: bool) -> Self {
        Self::start_with(devices, fail_scanning, None).await
    }

    /// `silent_device` gets no reply to its `ScalarCmd`s.
    async fn start_with(
        devices: Vec<DeviceInfo>,
        fail_scanning: bool,
        silent_device: Option<u32>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let (push, push_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(
            listener,
            devices,
            fail_scanning,
            silent_device,
            seen_tx,
            push_rx,
        ));
        Self { uri, seen, push }
    }

    /// Everything the client sent so far.
    fn drain(&mut self) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.seen.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn next_scalar_cmd(&mut self) -> (u32, Vec<(u32, f64)>) {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.seen.recv().await.expect("server gone") {
                    ClientMessage::ScalarCmd(cmd) => {
                        let scalars = cmd.scalars.iter().map(|s| (s.index, s.scalar)).collect();
                        return (cmd.device_index, scalars);
                    }
                    _ => continue,
                }
            }
        })
        .await
        .expect("no ScalarCmd received")
    }
}

async fn serve(
    listener: TcpListener,
    devices: Vec<DeviceInfo>,
    fail_scanning: bool,
    silent_device: Option<u32>,
    seen: mpsc::UnboundedSender<ClientMessage>,
    mut push: mpsc::UnboundedReceiver<Option<ServerMessage>>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            frame = source.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                let requests: Vec<ClientMessage> = serde_json::from_str(&text).unwrap();
                let mut replies = Vec::new();
                for request in requests {
                    let silent = matches!(
                        &request,
                        ClientMessage::ScalarCmd(cmd) if Some(cmd.device_index) == silent_device
                    );
                    if !silent {
                        replies.push(reply_to(&request, &devices, fail_scanning));
                    }
                    let _ = seen.send(request);
                }
                if replies.is_empty() {
                    continue;
                }
                let text = serde_json::to_string(&replies).unwrap();
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = push.recv() => match message {
                Some(Some(message)) => {
                    let text = serde_json::to_string(&[message]).unwrap();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}

fn reply_to(request: &ClientMessage, devices: &[DeviceInfo], fail_scanning: bool) -> ServerMessage {
    match request {
        ClientMessage::RequestServerInfo(req) => ServerMessage::ServerInfo(ServerInfo {
            id: req.id,
            server_name: "Fake Intiface".to_string(),
            message_version: 3,
            max_ping_time: 0,
        }),
        ClientMessage::RequestDeviceList(req) => ServerMessage::DeviceList(DeviceList {
            id: req.id,
            devices: devices.to_vec(),
        }),
        ClientMessage::StartScanning(req) if fail_scanning => ServerMessage::Error(ErrorMessage {
            id: req.id,
            error_message: "No device communication managers available".to_string(),
            error_code: 1,
        }),
        other => ServerMessage::Ok(MessageId { id: other.id() }),
    }
}

fn device(index: u32, name: &str, actuators: &[&str]) -> DeviceInfo {
    DeviceInfo {
        id: 0,
        device_index: index,
        device_name: name.to_string(),
        device_display_name: None,
        device_messages: DeviceMessages {
            scalar_cmd: actuators
                .iter()
                .map(|actuator| ScalarAttribute {
                    actuator_type: actuator.to_string(),
                    ..ScalarAttribute::default()
                })
                .collect(),
        },
    }
}

fn client(uri: &str) -> DeviceSessionClient {
    DeviceSessionClient::new(
        Box::new(WebSocketTransport::default()),
        Some(uri.to_string()),
    )
}

async fn next_event(client: &mut DeviceSessionClient) -> TransportEvent {
    tokio::time::timeout(WAIT, client.next_event())
        .await
        .expect("no transport event")
}

#[tokio::test]
async fn connect_lists_devices_and_vibrates_them() {
    let mut server = FakeServer::start(
        vec![device(0, "Dual Vibe", &["Vibrate", "Rotate", "Vibrate"])],
        false,
    )
    .await;
    let mut client = client(&server.uri);

    client.connect(&server.uri).await.unwrap();
    assert_eq!(client.status(), SessionStatus::Scanning);

    let handshake = server.drain();
    assert_eq!(handshake.len(), 3);
    assert!(matches!(handshake[0], ClientMessage::RequestServerInfo(_)));
    assert!(matches!(handshake[1], ClientMessage::RequestDeviceList(_)));
    assert!(matches!(handshake[2], ClientMessage::StartScanning(_)));

    let devices = client.registry().snapshot().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "Dual Vibe");
    assert_eq!(devices[0].vibrators, vec![0, 2]);

    assert_eq!(client.vibrate_all(0.5).await, 1);
    assert_eq!(server.next_scalar_cmd().await, (0, vec![(0, 0.5), (2, 0.5)]));

    client.disconnect().await;
    let teardown = server.drain();
    assert!(teardown
        .iter()
        .any(|m| matches!(m, ClientMessage::StopScanning(_))));
    assert!(teardown
        .iter()
        .any(|m| matches!(m, ClientMessage::StopAllDevices(_))));
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert!(client.registry().is_empty().await);
}

#[tokio::test]
async fn server_notifications_update_the_registry() {
    let server = FakeServer::start(vec![], false).await;
    let mut client = client(&server.uri);
    client.connect(&server.uri).await.unwrap();
    assert!(client.registry().is_empty().await);

    server
        .push
        .send(Some(ServerMessage::DeviceAdded(device(3, "Lush", &["Vibrate"]))))
        .unwrap();
    server
        .push
        .send(Some(ServerMessage::DeviceAdded(device(4, "Rotator", &["Rotate"]))))
        .unwrap();
    for _ in 0..2 {
        let event = next_event(&mut client).await;
        client.handle_event(event).await;
    }
    assert_eq!(client.registry().len().await, 2);
    assert_eq!(client.registry().vibration_capable().await.len(), 1);

    server
        .push
        .send(Some(ServerMessage::ScanningFinished(MessageId { id: 0 })))
        .unwrap();
    let event = next_event(&mut client).await;
    assert_eq!(event, TransportEvent::ScanningFinished);
    client.handle_event(event).await;
    assert_eq!(client.status(), SessionStatus::Idle);

    // Server goes away
    server.push.send(None).unwrap();
    let event = next_event(&mut client).await;
    assert_eq!(event, TransportEvent::Disconnected);
    client.handle_event(event).await;
    assert_eq!(client.status(), SessionStatus::Disconnected);
    assert!(client.registry().is_empty().await);
    assert_eq!(client.vibrate_all(1.0).await, 0);
}

#[tokio::test]
async fn scanning_failure_still_connects() {
    let server = FakeServer::start(vec![device(0, "Edge", &["Vibrate"])], true).await;
    let mut client = client(&server.uri);

    client.connect(&server.uri).await.unwrap();
    assert_eq!(client.status(), SessionStatus::Idle);
    assert_eq!(client.registry().len().await, 1);
}

#[tokio::test]
async fn unreachable_server_reports_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mut client = client(&uri);
    let err = client.connect(&uri).await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionFailed(_)));
    assert_eq!(client.status(), SessionStatus::Disconnected);

    // Disconnecting an unconnected session is a no-op
    client.disconnect().await;
    assert_eq!(client.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn session_handle_forwards_dispatches_over_the_wire() {
    let mut server = FakeServer::start(vec![device(1, "Hush", &["Vibrate"])], false).await;
    let handle = SessionHandle::spawn(
        Box::new(WebSocketTransport::default()),
        SessionSettings {
            server_address: Some(server.uri.clone()),
            connect_on_start: true,
            ..SessionSettings::default()
        },
    );
    let mut status = handle.subscribe_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.is_connected()))
        .await
        .expect("never connected")
        .expect("worker gone");

    handle.dispatcher().dispatch(0.25);
    assert_eq!(server.next_scalar_cmd().await, (1, vec![(0, 0.25)]));

    handle.shutdown().await;
}

#[tokio::test]
async fn silent_device_does_not_hold_back_the_others() {
    let mut server = FakeServer::start_with(
        vec![device(0, "Silent", &["Vibrate"]), device(1, "Edge", &["Vibrate"])],
        false,
        Some(0),
    )
    .await;
    let request_timeout = Duration::from_millis(800);
    let mut client = DeviceSessionClient::new(
        Box::new(WebSocketTransport::new(WebSocketSettings {
            request_timeout,
            ..WebSocketSettings::default()
        })),
        Some(server.uri.clone()),
    );
    client.connect(&server.uri).await.unwrap();
    server.drain();

    let started = Instant::now();
    let (delivered, healthy_arrival) = tokio::join!(client.vibrate_all(0.5), async {
        loop {
            if server.next_scalar_cmd().await.0 == 1 {
                return started.elapsed();
            }
        }
    });

    assert_eq!(delivered, 1);
    assert!(
        healthy_arrival < request_timeout / 2,
        "healthy device waited {:?}",
        healthy_arrival
    );
    assert!(started.elapsed() < request_timeout * 2);
}
