//! Graceful shutdown controller with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free health state transitions and an atomic
//! counter with RAII guards for in-flight request tracking. `ServiceHandle`
//! waits on [`ShutdownController::signalled`] to stop its server task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::watch;

/// Service health state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Initializing, not yet accepting requests.
    Starting,
    /// Accepting requests.
    Ready,
    /// Finishing in-flight requests; no new work should start.
    Draining,
    /// All in-flight requests completed.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates shutdown across the HTTP server and background loops.
///
/// 1. Health probes read `health_state()`
/// 2. The in-flight middleware holds an [`InFlightGuard`] per request
/// 3. `trigger_shutdown()` moves to Draining and wakes every receiver
/// 4. `wait_for_drain()` waits until in-flight requests complete
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health_state: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver flipped to `true` when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Resolves once shutdown has been triggered (immediately if it already was).
    pub async fn signalled(&self) {
        let mut rx = self.shutdown_receiver();
        // A closed channel cannot happen while `self` is alive.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Transitions to `Draining` and notifies all shutdown receivers.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
        // send_replace never fails, even with no live receivers.
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Tracks one in-flight request until the guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight requests to reach zero, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on success; returns `false` and
    /// stays in `Draining` if the timeout expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Axum middleware holding an [`InFlightGuard`] for the lifetime of each request.
pub async fn track_in_flight(
    State(shutdown): State<Arc<ShutdownController>>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = shutdown.in_flight_guard();
    next.run(request).await
}
