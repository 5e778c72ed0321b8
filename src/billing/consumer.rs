use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::Stores;

use super::currency::CurrencyGraph;
use super::service::BillingEngine;
use super::invoices::{InvoiceStateMachine, NewInvoice};
use super::ledger::{IngestOutcome, UsageLedgerPipeline};
use super::models::{ActionType, Invoice, InvoiceStatus, Item, PromoEntry, Record};
use super::promo::{estimate_price, PromoDiscountResolver};
use super::settings::{fetch_or_default, CurrencyConf, SettingsSource};

const START_INVOICE_DEADLINE_DAYS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ack {
    Ack,
    /// Negative acknowledgement; the broker redelivers the message.
    Nack,
}

/// key: billing-consumer-delivery -> message with an acknowledgement handle
pub struct Delivery<T> {
    pub payload: T,
    acker: oneshot::Sender<Ack>,
}

impl<T> Delivery<T> {
    pub fn new(payload: T) -> (Self, oneshot::Receiver<Ack>) {
        let (acker, receipt) = oneshot::channel();
        (Self { payload, acker }, receipt)
    }

    fn settle(self, ack: Ack) {
        if self.acker.send(ack).is_err() {
            warn!("delivery receipt dropped before acknowledgement");
        }
    }
}

/// Errors caused by the message itself are acknowledged; infrastructure failures are retried.
fn ack_for(err: &BillingError) -> Ack {
    match err {
        BillingError::Store(_) | BillingError::Upstream(_) => Ack::Nack,
        BillingError::InvalidArgument(_)
        | BillingError::NotFound(_)
        | BillingError::PermissionDenied
        | BillingError::FailedPrecondition(_) => Ack::Ack,
    }
}

/// key: billing-consumer-records -> usage record queue consumer
pub fn spawn_records_consumer(
    ledger: UsageLedgerPipeline,
    mut deliveries: mpsc::Receiver<Delivery<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let ack = handle_record(&ledger, &delivery.payload).await;
            delivery.settle(ack);
        }
        info!("records consumer stopped, channel closed");
    })
}

pub async fn handle_record(ledger: &UsageLedgerPipeline, body: &[u8]) -> Ack {
    let record: Record = match serde_json::from_slice(body) {
        Ok(record) => record,
        Err(err) => {
            error!(?err, "undecodable record delivery, skipping");
            return Ack::Ack;
        }
    };
    let uuid = record.uuid;
    match ledger.ingest_record(record, Utc::now()).await {
        Ok(IngestOutcome::Skipped(reason)) => {
            debug!(record = %uuid, reason, "record skipped");
            Ack::Ack
        }
        Ok(IngestOutcome::Stored | IngestOutcome::Settled) => Ack::Ack,
        Err(err) => {
            let ack = ack_for(&err);
            warn!(?err, record = %uuid, ?ack, "record rejected");
            ack
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceCreated {
    pub instance: Uuid,
    #[serde(default)]
    pub promocode: Option<Uuid>,
}

/// key: billing-consumer-instances -> start invoices for new instances
#[derive(Clone)]
pub struct InstanceStartInvoicer {
    stores: Stores,
    currencies: CurrencyGraph,
    promo: PromoDiscountResolver,
    invoices: InvoiceStateMachine,
    settings: Arc<dyn SettingsSource>,
}

impl InstanceStartInvoicer {
    pub fn new(
        stores: Stores,
        currencies: CurrencyGraph,
        promo: PromoDiscountResolver,
        invoices: InvoiceStateMachine,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            stores,
            currencies,
            promo,
            invoices,
            settings,
        }
    }

    pub async fn handle(&self, event: &InstanceCreated) -> BillingResult<Invoice> {
        let now = Utc::now();
        let instance = self
            .stores
            .instances
            .get_instance(event.instance)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("instance {}", event.instance)))?;

        if let Some(promocode) = event.promocode {
            let linked = self
                .stores
                .promocodes
                .add_promocode_use(promocode, &PromoEntry::for_instance(instance.uuid, now))
                .await?;
            if !linked {
                debug!(%promocode, instance = %instance.uuid, "promocode already linked");
            }
        }

        let service = self
            .stores
            .instances
            .get_service(instance.service)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("service {}", instance.service)))?;
        let account = self
            .stores
            .accounts
            .get_account(service.account)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("account {}", service.account)))?;

        let platform: CurrencyConf = fetch_or_default(self.settings.as_ref()).await;
        let currency = account.currency_or(platform.currency.id);
        let estimate = estimate_price(&instance, true);
        let discounted = self.promo.discounted_price(&instance, true, now).await?;
        let cost = self
            .currencies
            .convert_rounded(platform.currency.id, currency, discounted)
            .await?;

        let prefix = instance
            .billing_plan
            .meta
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let title = instance
            .product()
            .map(|product| product.title.as_str())
            .unwrap_or_default();
        if instance.product().is_none() {
            warn!(instance = %instance.uuid, "product not found in billing plan");
        }

        let mut meta = Map::new();
        meta.insert("creator".into(), json!("system"));
        meta.insert(
            "no_discount_price".into(),
            json!(format!("{estimate:.2} {}", platform.currency.title)),
        );

        let ctx = self.invoices.system_context();
        let invoice = self
            .invoices
            .create_invoice(
                &ctx,
                NewInvoice {
                    account: account.uuid,
                    currency: Some(currency),
                    total: cost,
                    status: Some(InvoiceStatus::Unpaid),
                    action: ActionType::InstanceStart,
                    items: vec![Item {
                        description: format!("{prefix} {title}").trim().to_string(),
                        unit: "Pcs".into(),
                        price: cost,
                        amount: 1.0,
                        instance: Some(instance.uuid),
                    }],
                    deadline: Some(now + Duration::days(START_INVOICE_DEADLINE_DAYS)),
                    meta,
                },
                now,
            )
            .await?;

        let fixing = self
            .promo
            .fixing_transaction(
                account.uuid,
                estimate,
                discounted,
                platform.currency.id,
                currency,
                now,
            )
            .await?;
        let invoice = match fixing {
            Some(transaction) => {
                self.invoices
                    .attach_transaction(invoice.uuid, &transaction)
                    .await?
            }
            None => invoice,
        };

        info!(
            invoice = %invoice.uuid,
            instance = %instance.uuid,
            total = invoice.total,
            "start invoice created for new instance"
        );
        Ok(invoice)
    }
}

pub fn spawn_instances_consumer(
    invoicer: InstanceStartInvoicer,
    mut deliveries: mpsc::Receiver<Delivery<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let ack = match serde_json::from_slice::<InstanceCreated>(&delivery.payload) {
                Ok(event) => match invoicer.handle(&event).await {
                    Ok(_) => Ack::Ack,
                    Err(err) => {
                        let ack = ack_for(&err);
                        error!(
                            ?err,
                            instance = %event.instance,
                            ?ack,
                            "failed to process instance creation"
                        );
                        ack
                    }
                },
                Err(err) => {
                    error!(?err, "undecodable instance event, skipping");
                    Ack::Ack
                }
            };
            delivery.settle(ack);
        }
        info!("instances consumer stopped, channel closed");
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    Records,
    Instances,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Records => "records",
            Queue::Instances => "instances",
        }
    }
}

/// key: billing-consumer-ingress -> hands raw messages to the running consumers
#[derive(Clone)]
pub struct QueueIngress {
    records: mpsc::Sender<Delivery<Vec<u8>>>,
    instances: mpsc::Sender<Delivery<Vec<u8>>>,
}

impl QueueIngress {
    /// Spawns both consumers; they stop once every clone of the ingress is dropped.
    pub fn start(engine: &BillingEngine, buffer: usize) -> (Self, Vec<JoinHandle<()>>) {
        let (records, records_rx) = mpsc::channel(buffer);
        let (instances, instances_rx) = mpsc::channel(buffer);
        let workers = vec![
            spawn_records_consumer(engine.ledger.clone(), records_rx),
            spawn_instances_consumer(engine.start_invoicer.clone(), instances_rx),
        ];
        (Self { records, instances }, workers)
    }

    /// Delivers `body` and waits for the consumer's acknowledgement.
    pub async fn publish(&self, queue: Queue, body: Vec<u8>) -> BillingResult<Ack> {
        let sender = match queue {
            Queue::Records => &self.records,
            Queue::Instances => &self.instances,
        };
        let (delivery, receipt) = Delivery::new(body);
        sender.send(delivery).await.map_err(|_| {
            BillingError::Upstream(format!("{} consumer is not running", queue.as_str()))
        })?;
        receipt.await.map_err(|_| {
            BillingError::Upstream(format!("{} consumer dropped the delivery", queue.as_str()))
        })
    }
}
