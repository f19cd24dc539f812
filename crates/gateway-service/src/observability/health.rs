//! Probe endpoints for the gateway.
//!
//! - `GET /health` - liveness; OK while the process can answer at all
//! - `GET /ready` - readiness; OK only while the websocket listener is bound
//!   and the gateway is not draining
//!
//! Readiness moves one way: `starting -> accepting -> draining`. Once
//! shutdown begins the gateway closes every connection with
//! `ServerShutdown`, so a load balancer must stop routing new sockets here
//! before that happens and must never route them back.
//!
//! `/metrics` is mounted alongside these in `main.rs`.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const STARTING: u8 = 0;
const ACCEPTING: u8 = 1;
const DRAINING: u8 = 2;

/// Where the gateway is in its serving lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Process is up, listener not bound yet.
    Starting,
    /// Listener bound; new connections are welcome.
    Accepting,
    /// Shutdown started; live connections are being closed.
    Draining,
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    status: Readiness,
}

/// Shared lifecycle flag read by the probes.
#[derive(Debug, Default)]
pub struct HealthState {
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The websocket listener is bound. Ignored once draining.
    pub fn mark_accepting(&self) {
        let _ = self
            .phase
            .compare_exchange(STARTING, ACCEPTING, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Shutdown started. Irreversible.
    pub fn begin_drain(&self) {
        self.phase.store(DRAINING, Ordering::SeqCst);
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        match self.phase.load(Ordering::SeqCst) {
            STARTING => Readiness::Starting,
            ACCEPTING => Readiness::Accepting,
            _ => Readiness::Draining,
        }
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let status = state.readiness();
    let code = if status == Readiness::Accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadinessBody { status }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn probe(router: &Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_drain_is_one_way() {
        let state = HealthState::new();
        assert_eq!(state.readiness(), Readiness::Starting);

        state.mark_accepting();
        assert_eq!(state.readiness(), Readiness::Accepting);

        state.begin_drain();
        state.mark_accepting();
        assert_eq!(state.readiness(), Readiness::Draining);
    }

    #[tokio::test]
    async fn test_ready_follows_gateway_lifecycle() {
        let state = Arc::new(HealthState::new());
        let router = health_router(Arc::clone(&state));

        let (status, body) = probe(&router, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"starting"}"#);

        state.mark_accepting();
        let (status, body) = probe(&router, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"accepting"}"#);

        state.begin_drain();
        let (status, body) = probe(&router, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"draining"}"#);
    }

    #[tokio::test]
    async fn test_liveness_stays_ok_while_draining() {
        let state = Arc::new(HealthState::new());
        state.begin_drain();
        let (status, _) = probe(&health_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
