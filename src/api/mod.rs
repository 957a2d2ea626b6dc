pub mod error;
pub mod health;
pub mod optimize;
pub mod response;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    config::Config,
    optimizer::{LpSolver, MinilpSolver},
};

/// Shared, read-only state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub solver: Arc<dyn LpSolver>,
}

impl AppState {
    pub fn new(cfg: Config) -> Self {
        Self::with_solver(cfg, Arc::new(MinilpSolver::new()))
    }

    pub fn with_solver(cfg: Config, solver: Arc<dyn LpSolver>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            solver,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cfg = state.cfg.clone();
    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/api/v1/optimize", post(optimize::optimize))
        .route(
            "/api/v1/optimize/moving-horizon",
            post(optimize::optimize_moving_horizon),
        )
        .with_state(state);

    if cfg.server.enable_cors {
        use tower_http::cors::Any;
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]);
        router = router.layer(cors);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(8 * 1024 * 1024))
                .layer(timeout_layer(cfg.server.request_timeout_secs)),
        )
        .layer(TraceLayer::new_for_http())
}

/// Requests running past the limit are answered with 408.
fn timeout_layer(secs: u64) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_slow_request_times_out() {
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "done"
                }),
            )
            .layer(timeout_layer(1));

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
