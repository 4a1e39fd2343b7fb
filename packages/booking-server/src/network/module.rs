//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until shutdown. Splitting bind from serve
//! lets callers learn the OS-assigned port (port 0) and hand the address to
//! other services before any request is accepted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, readiness_handler, ProbeState};
use super::middleware::build_http_layers;
use super::shutdown::{track_in_flight, ShutdownController};

/// Owns the listener and lifecycle of one HTTP service.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Shared shutdown controller, also used by background loops.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Wraps the service routes with the probe routes and all middleware.
    ///
    /// Probe routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    pub fn build_router(&self, routes: Router) -> Router {
        let probes = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .with_state(ProbeState {
                shutdown: Arc::clone(&self.shutdown),
                service_name: Arc::from(self.config.service_name.as_str()),
                start_time: self.start_time,
            });

        probes
            .merge(routes)
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.shutdown),
                track_in_flight,
            ))
            .layer(build_http_layers(&self.config))
    }

    /// Binds the listener to the configured host and port.
    ///
    /// Returns the bound address, whose port differs from the configured one
    /// when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        info!(service = %self.config.service_name, %local, "TCP listener bound");

        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves `routes` until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits
    /// a fatal I/O error.
    pub async fn serve(
        self,
        routes: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router(routes);
        let Self {
            config,
            listener,
            shutdown: shutdown_ctrl,
            ..
        } = self;
        let listener =
            listener.ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;

        shutdown_ctrl.set_ready();
        info!(service = %config.service_name, "serving HTTP");

        let signal_ctrl = Arc::clone(&shutdown_ctrl);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                signal_ctrl.trigger_shutdown();
            })
            .await?;

        // Covers the case where serve ended without the signal firing.
        shutdown_ctrl.trigger_shutdown();
        if shutdown_ctrl.wait_for_drain(config.drain_timeout).await {
            info!(service = %config.service_name, "all requests drained");
        } else {
            warn!(
                service = %config.service_name,
                in_flight = shutdown_ctrl.in_flight_count(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }

    /// Binds, then serves on a background task until the returned handle is
    /// stopped or the controller is triggered elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn spawn(mut self, routes: Router) -> anyhow::Result<ServiceHandle> {
        let addr = self.start().await?;
        let shutdown = self.shutdown_controller();
        let signal = Arc::clone(&shutdown);
        let join = tokio::spawn(self.serve(routes, async move { signal.signalled().await }));

        Ok(ServiceHandle {
            addr,
            shutdown,
            join,
        })
    }
}

/// A service running on a background task.
pub struct ServiceHandle {
    addr: SocketAddr,
    shutdown: Arc<ShutdownController>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ServiceHandle {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for clients, e.g. `http://127.0.0.1:41234`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Triggers shutdown and waits for the server task to finish.
    ///
    /// # Errors
    ///
    /// Returns the server's own error, or an error if the task panicked.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.trigger_shutdown();
        self.join.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HealthState;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::for_service("test")
        }
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.listener.is_none());
    }

    #[test]
    fn shutdown_controller_returns_shared_arc() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(local_config());
        let addr = module.start().await.expect("start should succeed");
        assert!(addr.port() > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(local_config());
        let result = module.serve(Router::new(), std::future::ready(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawned_service_answers_probes_and_stops() {
        let handle = NetworkModule::new(local_config())
            .spawn(Router::new())
            .await
            .unwrap();
        let ctrl = handle.shutdown_controller();

        let resp = reqwest::get(format!("{}/health/ready", handle.url()))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let body: serde_json::Value = reqwest::get(format!("{}/health", handle.url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["service"], "test");

        handle.stop().await.unwrap();
        assert_eq!(ctrl.health_state(), HealthState::Stopped);
    }
}
