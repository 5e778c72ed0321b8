pub mod billing;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use crate::billing::consumer::QueueIngress;
use crate::billing::BillingEngine;
use crate::routes::api_routes;

async fn root() -> &'static str {
    "Billing API"
}

/// Router without the metrics layer; `main` adds prometheus on top.
pub fn app(engine: Arc<BillingEngine>, queues: QueueIngress) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(queues))
        .layer(Extension(engine))
}
