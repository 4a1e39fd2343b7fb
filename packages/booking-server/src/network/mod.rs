//! Networking: configuration, HTTP layers, probes, lifecycle and shutdown.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::ProbeState;
pub use module::{NetworkModule, ServiceHandle};
pub use shutdown::*;
