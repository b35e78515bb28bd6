//! ProxyHub relay
//!
//! Accepts tunnel clients over WebSocket and forwards public HTTP traffic
//! to them by stable id.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod headers;
pub mod registry;
pub mod server;
pub mod session;

pub use config::RelayConfig;
pub use server::{router, serve, RelayState};
