//! ProxyHub Shared Library
//!
//! Frame protocol, identifiers and errors shared by the relay and the client.

pub mod error;
pub mod identity;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::Frame;
