//! Vibration subsystem
//!
//! Turns the shared intensity state into rate-limited device commands:
//!
//! ```text
//! Event hooks ──► SharedIntensityState ──► VibrationController::tick ──► IntensitySink
//!  (any number)      (highest wins)          (clamp, decay, 100ms gate)    (session worker)
//! ```
//!
//! The controller runs on the tick thread and never blocks; the sink hands the
//! value off to the device session in the background.

pub mod controller;

pub use controller::{DispatchStats, IntensitySink, VibrationController, DISPATCH_INTERVAL_SECS};
