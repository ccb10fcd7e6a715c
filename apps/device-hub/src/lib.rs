pub mod config;
pub mod device;
pub mod error;
pub mod platform;
pub mod ports;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod stream;
pub mod telemetry;
