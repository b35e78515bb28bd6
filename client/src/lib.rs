//! ProxyHub client
//!
//! Registers a stable id with a relay and answers tunneled requests from
//! mock rules or a local HTTP service.

pub mod config;
pub mod emitter;
pub mod handler;
pub mod identity;
pub mod mock;
pub mod request_log;
pub mod session;
pub mod tunnel;

pub use config::ClientConfig;
pub use mock::{MockRule, MockStore, StaticMockStore};
pub use request_log::{MemoryRequestLog, NoopRequestLog, RequestLog};
