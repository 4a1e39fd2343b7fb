//! Probe handlers mounted on every service by the network module.

pub mod health;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;

/// State shared by the probe handlers.
///
/// Holds `Arc`s so cloning per request is cheap.
#[derive(Clone)]
pub struct ProbeState {
    /// Health state and in-flight counter.
    pub shutdown: Arc<ShutdownController>,
    /// Name of the service answering the probe.
    pub service_name: Arc<str>,
    /// Process start time, used for uptime.
    pub start_time: Instant,
}
