use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::extractor::AuthUser;
use crate::store::InvoiceFilter;
use crate::telemetry::RoutineState;

use super::consumer::{Ack, Queue, QueueIngress};
use super::invoices::{NewInvoice, TransitionParams};
use super::ledger::IngestOutcome;
use super::models::{Currency, ExchangeQuote, ExchangeRate, Invoice, InvoiceStatus, Record};
use super::service::BillingEngine;

fn require_root(user: &AuthUser, engine: &BillingEngine) -> BillingResult<()> {
    if engine.is_root(user.account) {
        Ok(())
    } else {
        Err(BillingError::PermissionDenied)
    }
}

/// key: billing-api -> rest endpoints
pub async fn list_currencies(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
) -> BillingResult<Json<Vec<Currency>>> {
    let include_private = engine.is_root(user.account);
    Ok(Json(engine.currencies.list_currencies(include_private).await?))
}

pub async fn create_currency(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(currency): Json<Currency>,
) -> BillingResult<(StatusCode, Json<Currency>)> {
    require_root(&user, &engine)?;
    let created = engine.currencies.create_currency(currency).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_currency(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(currency): Json<Currency>,
) -> BillingResult<Json<Currency>> {
    require_root(&user, &engine)?;
    Ok(Json(engine.currencies.update_currency(currency).await?))
}

pub async fn list_rates(
    Extension(engine): Extension<Arc<BillingEngine>>,
    _user: AuthUser,
) -> BillingResult<Json<Vec<ExchangeRate>>> {
    Ok(Json(engine.currencies.list_rates().await?))
}

pub async fn get_rate(
    Extension(engine): Extension<Arc<BillingEngine>>,
    _user: AuthUser,
    Path((from, to)): Path<(i32, i32)>,
) -> BillingResult<Json<ExchangeRate>> {
    Ok(Json(engine.currencies.get_direct_rate(from, to).await?))
}

pub async fn create_rate(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(rate): Json<ExchangeRate>,
) -> BillingResult<(StatusCode, Json<ExchangeRate>)> {
    require_root(&user, &engine)?;
    let created = engine.currencies.create_rate(rate).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_rate(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(rate): Json<ExchangeRate>,
) -> BillingResult<Json<ExchangeRate>> {
    require_root(&user, &engine)?;
    Ok(Json(engine.currencies.update_rate(rate).await?))
}

pub async fn delete_rate(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Path((from, to)): Path<(i32, i32)>,
) -> BillingResult<StatusCode> {
    require_root(&user, &engine)?;
    engine.currencies.delete_rate(from, to).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_exchange_rate(
    Extension(engine): Extension<Arc<BillingEngine>>,
    _user: AuthUser,
    Path((from, to)): Path<(i32, i32)>,
) -> BillingResult<Json<ExchangeQuote>> {
    Ok(Json(engine.currencies.get_exchange_rate(from, to).await?))
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub from: i32,
    pub to: i32,
    pub amount: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConvertResponse {
    pub amount: f64,
}

pub async fn convert(
    Extension(engine): Extension<Arc<BillingEngine>>,
    _user: AuthUser,
    Json(payload): Json<ConvertRequest>,
) -> BillingResult<Json<ConvertResponse>> {
    let amount = engine
        .currencies
        .convert(payload.from, payload.to, payload.amount)
        .await?;
    Ok(Json(ConvertResponse { amount }))
}

pub async fn create_invoice(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(payload): Json<NewInvoice>,
) -> BillingResult<(StatusCode, Json<Invoice>)> {
    let invoice = engine
        .invoices
        .create_invoice(&user.context(), payload, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListInvoicesQuery {
    #[serde(default)]
    pub account: Option<Uuid>,
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
}

pub async fn list_invoices(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Query(query): Query<ListInvoicesQuery>,
) -> BillingResult<Json<Vec<Invoice>>> {
    let filter = InvoiceFilter {
        account: query.account,
        status: query.status,
    };
    Ok(Json(
        engine.invoices.list_invoices(&user.context(), filter).await?,
    ))
}

pub async fn get_invoice(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> BillingResult<Json<Invoice>> {
    Ok(Json(engine.invoices.get_invoice(&user.context(), id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: InvoiceStatus,
    #[serde(flatten)]
    pub params: TransitionParams,
}

pub async fn update_invoice_status(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> BillingResult<Json<Invoice>> {
    let invoice = engine
        .invoices
        .update_status(
            &user.context(),
            id,
            payload.status,
            payload.params,
            Utc::now(),
        )
        .await?;
    Ok(Json(invoice))
}

pub async fn pay_invoice(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> BillingResult<Json<Invoice>> {
    let invoice = engine
        .invoices
        .pay_with_balance(&user.context(), id, Utc::now())
        .await?;
    Ok(Json(invoice))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    pub record: Uuid,
    pub outcome: String,
}

pub async fn ingest_record(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
    Json(record): Json<Record>,
) -> BillingResult<(StatusCode, Json<RecordResponse>)> {
    require_root(&user, &engine)?;
    let uuid = record.uuid;
    let (status, outcome) = match engine.ledger.ingest_record(record, Utc::now()).await? {
        IngestOutcome::Skipped(reason) => (StatusCode::OK, format!("skipped: {reason}")),
        IngestOutcome::Stored => (StatusCode::ACCEPTED, "stored".to_string()),
        IngestOutcome::Settled => (StatusCode::CREATED, "settled".to_string()),
    };
    Ok((status, Json(RecordResponse { record: uuid, outcome })))
}

pub async fn list_routines(
    Extension(engine): Extension<Arc<BillingEngine>>,
    user: AuthUser,
) -> BillingResult<Json<Vec<RoutineState>>> {
    require_root(&user, &engine)?;
    Ok(Json(engine.routines.snapshot()))
}

#[derive(Debug, Serialize)]
pub struct QueueReceipt {
    pub queue: Queue,
    pub ack: Ack,
}

/// Nacked messages answer 503 so the sender redelivers them.
pub async fn publish_message(
    Extension(engine): Extension<Arc<BillingEngine>>,
    Extension(queues): Extension<QueueIngress>,
    user: AuthUser,
    Path(queue): Path<Queue>,
    body: Bytes,
) -> BillingResult<(StatusCode, Json<QueueReceipt>)> {
    require_root(&user, &engine)?;
    let ack = queues.publish(queue, body.to_vec()).await?;
    let status = match ack {
        Ack::Ack => StatusCode::ACCEPTED,
        Ack::Nack => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(QueueReceipt { queue, ack })))
}
