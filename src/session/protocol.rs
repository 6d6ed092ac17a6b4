//! Buttplug v3 JSON message subset.
//!
//! Every websocket frame carries a JSON array of messages, each an object with
//! a single key naming the message type:
//!
//! ```text
//! [{"StartScanning":{"Id":2}}]
//! [{"Ok":{"Id":2}},{"DeviceAdded":{"Id":0,"DeviceIndex":0,"DeviceName":"..."}}]
//! ```
//!
//! Requests carry a non-zero `Id` that the reply echoes. Messages with `Id` 0
//! are server-initiated notifications.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::SessionError;
use super::transport::ConnectedDevice;

pub const MESSAGE_VERSION: u32 = 3;
pub const VIBRATE_ACTUATOR: &str = "Vibrate";
/// Id used by server-initiated messages
pub const SYSTEM_ID: u32 = 0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MessageId {
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RequestServerInfo {
    pub id: u32,
    pub client_name: String,
    pub message_version: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarSubcommand {
    pub index: u32,
    pub scalar: f64,
    pub actuator_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarCmd {
    pub id: u32,
    pub device_index: u32,
    pub scalars: Vec<ScalarSubcommand>,
}

impl ScalarCmd {
    /// Drives every vibrator of `device` at `intensity`.
    pub fn vibrate(id: u32, device: &ConnectedDevice, intensity: f32) -> Self {
        Self {
            id,
            device_index: device.index,
            scalars: device
                .vibrators
                .iter()
                .map(|&index| ScalarSubcommand {
                    index,
                    scalar: f64::from(intensity),
                    actuator_type: VIBRATE_ACTUATOR.to_string(),
                })
                .collect(),
        }
    }
}

/// Messages sent to the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    RequestServerInfo(RequestServerInfo),
    Ping(MessageId),
    StartScanning(MessageId),
    StopScanning(MessageId),
    RequestDeviceList(MessageId),
    StopAllDevices(MessageId),
    ScalarCmd(ScalarCmd),
}

impl ClientMessage {
    pub fn id(&self) -> u32 {
        match self {
            ClientMessage::RequestServerInfo(msg) => msg.id,
            ClientMessage::ScalarCmd(msg) => msg.id,
            ClientMessage::Ping(msg)
            | ClientMessage::StartScanning(msg)
            | ClientMessage::StopScanning(msg)
            | ClientMessage::RequestDeviceList(msg)
            | ClientMessage::StopAllDevices(msg) => msg.id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorMessage {
    pub id: u32,
    pub error_message: String,
    #[serde(default)]
    pub error_code: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub id: u32,
    #[serde(default)]
    pub server_name: String,
    pub message_version: u32,
    /// Milliseconds; 0 disables the ping requirement
    #[serde(default)]
    pub max_ping_time: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarAttribute {
    #[serde(default)]
    pub feature_descriptor: String,
    #[serde(default)]
    pub step_count: u32,
    pub actuator_type: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMessages {
    #[serde(default)]
    pub scalar_cmd: Vec<ScalarAttribute>,
}

/// Device description used by both `DeviceList` entries and `DeviceAdded`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: u32,
    pub device_index: u32,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
    #[serde(default)]
    pub device_messages: DeviceMessages,
}

impl DeviceInfo {
    pub fn vibrator_indices(&self) -> Vec<u32> {
        self.device_messages
            .scalar_cmd
            .iter()
            .enumerate()
            .filter(|(_, attr)| attr.actuator_type == VIBRATE_ACTUATOR)
            .map(|(index, _)| index as u32)
            .collect()
    }

    pub fn into_device(self) -> ConnectedDevice {
        let vibrators = self.vibrator_indices();
        let name = self.device_display_name.unwrap_or(self.device_name);
        ConnectedDevice::new(self.device_index, name, vibrators)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    pub id: u32,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRemoved {
    #[serde(default)]
    pub id: u32,
    pub device_index: u32,
}

/// Messages received from the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Ok(MessageId),
    Error(ErrorMessage),
    ServerInfo(ServerInfo),
    DeviceList(DeviceList),
    DeviceAdded(DeviceInfo),
    DeviceRemoved(DeviceRemoved),
    ScanningFinished(MessageId),
}

impl ServerMessage {
    pub fn id(&self) -> u32 {
        match self {
            ServerMessage::Ok(msg) | ServerMessage::ScanningFinished(msg) => msg.id,
            ServerMessage::Error(msg) => msg.id,
            ServerMessage::ServerInfo(msg) => msg.id,
            ServerMessage::DeviceList(msg) => msg.id,
            ServerMessage::DeviceAdded(msg) => msg.id,
            ServerMessage::DeviceRemoved(msg) => msg.id,
        }
    }
}

pub fn encode_batch<T: Serialize>(messages: &[T]) -> Result<String, SessionError> {
    Ok(serde_json::to_string(messages)?)
}

/// Decodes one frame. Unknown message types are logged and skipped so newer
/// servers do not break the session.
pub fn decode_server_batch(text: &str) -> Result<Vec<ServerMessage>, SessionError> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let mut messages = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<ServerMessage>(value.clone()) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping unsupported server message {}: {}", value, e),
        }
    }
    Ok(messages)
}
