//! # Stand-in Host
//!
//! The controller is meant to be embedded in a game that calls it once per
//! frame. The binary ships a minimal host instead: a fixed-rate tick loop plus
//! line commands read from stdin.
//!
//! ```text
//! stdin ──► HostCommand ─[mpsc]──► HostLoop ──tick──► VibrationController ──► SessionHandle
//! ```

pub mod command;
pub mod tick_loop;

pub use command::{CommandError, HostCommand};
pub use tick_loop::HostLoop;
