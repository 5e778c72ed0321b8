mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use common::harness;
use tower::ServiceExt;

#[tokio::test]
async fn metrics_returns_ok_next_to_billing_routes() {
    let h = harness();
    let (layer, handle) = PrometheusMetricLayer::pair();
    let router = h
        .router()
        .route("/metrics", get(move || async move { handle.render() }))
        .layer(layer);
    let response = router
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
