//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::ProbeState;
use crate::network::HealthState;

/// Detailed health JSON. Always 200; the `state` field tells draining apart
/// from ready.
pub async fn health_handler(State(state): State<ProbeState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": &*state.service_name,
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe -- 200 while the process responds at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe -- 200 only in the `Ready` state, 503 otherwise.
pub async fn readiness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::network::ShutdownController;

    fn test_state() -> ProbeState {
        ProbeState {
            shutdown: Arc::new(ShutdownController::new()),
            service_name: Arc::from("account"),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_handler_reports_all_fields() {
        let state = test_state();
        state.shutdown.set_ready();
        let _guard = state.shutdown.in_flight_guard();

        let json = health_handler(State(state)).await.0;

        assert_eq!(json["service"], "account");
        assert_eq!(json["state"], "ready");
        assert_eq!(json["in_flight"], 1);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_draining() {
        let state = test_state();
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();

        assert_eq!(health_handler(State(state)).await.0["state"], "draining");
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_health_state() {
        let state = test_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
