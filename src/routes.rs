use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/billing/currencies",
            get(api::list_currencies)
                .post(api::create_currency)
                .patch(api::update_currency),
        )
        .route(
            "/api/billing/rates",
            get(api::list_rates)
                .post(api::create_rate)
                .patch(api::update_rate),
        )
        .route(
            "/api/billing/rates/:from/:to",
            get(api::get_rate).delete(api::delete_rate),
        )
        .route(
            "/api/billing/exchange/:from/:to",
            get(api::get_exchange_rate),
        )
        .route("/api/billing/convert", post(api::convert))
        .route(
            "/api/billing/invoices",
            get(api::list_invoices).post(api::create_invoice),
        )
        .route("/api/billing/invoices/:id", get(api::get_invoice))
        .route(
            "/api/billing/invoices/:id/status",
            post(api::update_invoice_status),
        )
        .route("/api/billing/invoices/:id/pay", post(api::pay_invoice))
        .route("/api/billing/records", post(api::ingest_record))
        .route("/api/billing/routines", get(api::list_routines))
        .route("/api/billing/queues/:queue", post(api::publish_message))
}
