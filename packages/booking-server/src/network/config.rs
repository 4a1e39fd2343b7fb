//! Network configuration shared by every service in the stack.

use std::time::Duration;

/// Listener and HTTP-layer configuration for one service.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Name reported by `/health` and attached to spans.
    pub service_name: String,
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// How long `serve()` waits for in-flight requests after shutdown.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_name: "booking-relay".to_string(),
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Default configuration for the named service.
    #[must_use]
    pub fn for_service(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            ..Self::default()
        }
    }
}
