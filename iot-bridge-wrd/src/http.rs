//! HTTP surface: metrics scrape endpoint plus health, readiness and status.

use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tracing::info;

use crate::collector::SharedGauges;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct AppState {
    gauges: SharedGauges,
    /// Number of configured sensors, for `/ready` and `/status`.
    sensors: usize,
}

fn create_router(gauges: SharedGauges, sensors: usize, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(|| async { "ok\n" }))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(AppState { gauges, sensors })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        state.gauges.render(),
    )
        .into_response()
}

/// Ready once at least one reading has been published since start.
async fn ready_handler(State(state): State<AppState>) -> Response {
    let reporting = state.gauges.series_count();
    let status = if state.gauges.stats().updates > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        format!("{}/{} sensors reporting\n", reporting, state.sensors),
    )
        .into_response()
}

async fn status_handler(State(state): State<AppState>) -> Response {
    axum::Json(serde_json::json!({
        "bridge": "wrd",
        "version": env!("CARGO_PKG_VERSION"),
        "sensors": state.sensors,
        "series": state.gauges.series_count(),
        "stats": state.gauges.stats(),
        "readings": state.gauges.snapshot(),
    }))
    .into_response()
}

/// Serves the registry over HTTP until told to stop.
pub struct HttpServer {
    gauges: SharedGauges,
    sensors: usize,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(
        gauges: SharedGauges,
        sensors: usize,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            gauges,
            sensors,
            listen_addr,
            metrics_path,
        }
    }

    /// Bind and serve. Returns once `shutdown` flips to `true` (or its
    /// sender is dropped) and in-flight requests have finished.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.gauges, self.sensors, &self.metrics_path);
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.listen_addr))?;

        info!(addr = %self.listen_addr, path = %self.metrics_path, "Serving metrics");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("HTTP server error")?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SensorGauges;
    use crate::metrics::{MetricsSink, SensorLabels};
    use crate::reader::Reading;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn publish(gauges: &SensorGauges) {
        gauges.set(
            &SensorLabels::new("10.0.0.21", "north", "B1", "101"),
            &Reading {
                temperature: 22.82,
                humidity: 36.73,
                raw: Vec::new(),
            },
        );
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let gauges = Arc::new(SensorGauges::new());
        publish(&gauges);
        let router = create_router(gauges, 1, "/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let body = body_string(response).await;
        assert!(body.contains("temperature_metric_celsius{"));
        assert!(body.contains("36.73"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = create_router(Arc::new(SensorGauges::new()), 1, "/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_endpoint_not_ready() {
        let router = create_router(Arc::new(SensorGauges::new()), 1, "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_string(response).await, "0/1 sensors reporting\n");
    }

    #[tokio::test]
    async fn test_ready_endpoint_ready() {
        let gauges = Arc::new(SensorGauges::new());
        publish(&gauges);
        let router = create_router(gauges, 1, "/metrics");

        let response = router
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let gauges = Arc::new(SensorGauges::new());
        publish(&gauges);
        let router = create_router(gauges, 3, "/metrics");

        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let status: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(status["bridge"], "wrd");
        assert_eq!(status["sensors"], 3);
        assert_eq!(status["series"], 1);
        assert_eq!(status["stats"]["updates"], 1);

        let readings = status["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["node"], "10.0.0.21");
        assert_eq!(readings[0]["room"], "101");
        assert_eq!(readings[0]["temperature"], 22.82);
        assert_eq!(readings[0]["humidity"], 36.73);
        assert!(readings[0]["updated_at"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_status_drops_deleted_sensor() {
        let gauges = Arc::new(SensorGauges::new());
        publish(&gauges);
        gauges.delete(&SensorLabels::new("10.0.0.21", "north", "B1", "101"));
        let router = create_router(gauges, 1, "/metrics");

        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(status["readings"], serde_json::json!([]));
        assert_eq!(status["stats"]["deletes"], 1);
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let router = create_router(Arc::new(SensorGauges::new()), 1, "/wrd/metrics");

        let response = router
            .clone()
            .oneshot(Request::get("/wrd/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
