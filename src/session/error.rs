use thiserror::Error;

/// Errors raised by the device session and its transports.
///
/// None of these ever reach the tick loop; the session worker logs them where
/// they occur and, for awaited commands, hands them back to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening the connection or the protocol handshake failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to a device server")]
    NotConnected,

    /// No server address was configured or remembered for a reconnect
    #[error("No server address available")]
    NoServerAddress,

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The server answered with something the request did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    /// A command to a single device failed
    #[error("Device {index} failed: {reason}")]
    Device { index: u32, reason: String },

    /// The session worker is gone or its queue is full
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
