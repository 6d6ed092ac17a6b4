pub mod config;
pub mod host;
pub mod intensity;
pub mod session;
pub mod vibration;
