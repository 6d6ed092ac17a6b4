//! # Device Session
//!
//! Everything between the vibration controller and the external haptic control
//! server (Intiface Central or any other Buttplug server).
//!
//! ```text
//! session/
//! ├── transport.rs       - DeviceTransport trait, devices and notifications
//! ├── protocol.rs        - Buttplug v3 JSON messages
//! ├── websocket.rs       - DeviceTransport over tokio-tungstenite
//! ├── client.rs          - session lifecycle, device registry, vibrate_all
//! ├── session_handle.rs  - background worker and its handle
//! └── error.rs           - SessionError
//! ```
//!
//! ## Failure Policy
//! A failed connect leaves the session disconnected until someone asks for a
//! reconnect; there is no automatic retry. A failing device is skipped for that
//! dispatch only. A server-side disconnect is a normal lifecycle event and just
//! clears the session.

pub mod client;
pub mod error;
pub mod protocol;
pub mod session_handle;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{DeviceRegistry, DeviceSessionClient, SessionStatus};
pub use error::SessionError;
pub use session_handle::{IntensityDispatcher, SessionCommand, SessionHandle, SessionSettings};
pub use transport::{ConnectedDevice, DeviceTransport, TransportEvent};
pub use websocket::{WebSocketSettings, WebSocketTransport};
