use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;
use uuid::Uuid;

use crate::store::AccountStore;

use super::models::{Instance, Invoice, InvoiceStatus};

/// key: billing-adapter-accounts -> account suspend/unsuspend lifecycle
#[async_trait]
pub trait AccountLifecycle: Send + Sync {
    async fn suspend(&self, account: Uuid) -> Result<()>;
    async fn unsuspend(&self, account: Uuid) -> Result<()>;
}

/// Flips the suspended flag in the account store.
pub struct StoreAccountLifecycle {
    accounts: Arc<dyn AccountStore>,
}

impl StoreAccountLifecycle {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AccountLifecycle for StoreAccountLifecycle {
    async fn suspend(&self, account: Uuid) -> Result<()> {
        self.accounts.set_suspended(account, true).await?;
        info!(%account, "account suspended");
        Ok(())
    }

    async fn unsuspend(&self, account: Uuid) -> Result<()> {
        self.accounts.set_suspended(account, false).await?;
        info!(%account, "account unsuspended");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverMethod {
    Suspend,
    FreeRenew,
    CancelRenew,
}

impl DriverMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverMethod::Suspend => "suspend",
            DriverMethod::FreeRenew => "free_renew",
            DriverMethod::CancelRenew => "cancel_renew",
        }
    }
}

/// key: billing-adapter-driver -> service-provider driver actions
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    async fn invoke(&self, instance: &Instance, method: DriverMethod) -> Result<()>;
}

pub struct HttpDriverClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDriverClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ServiceDriver for HttpDriverClient {
    async fn invoke(&self, instance: &Instance, method: DriverMethod) -> Result<()> {
        let url = format!("{}/drivers/{}/invoke", self.base_url, instance.driver);
        self.client
            .post(&url)
            .json(&json!({
                "instance": instance.uuid,
                "method": method.as_str(),
            }))
            .send()
            .await
            .with_context(|| format!("failed to reach driver at {url}"))?
            .error_for_status()
            .with_context(|| format!("driver rejected {}", method.as_str()))?;
        Ok(())
    }
}

/// Driver used when no driver gateway is configured.
pub struct LoggingDriver;

#[async_trait]
impl ServiceDriver for LoggingDriver {
    async fn invoke(&self, instance: &Instance, method: DriverMethod) -> Result<()> {
        info!(
            instance = %instance.uuid,
            driver = instance.driver,
            method = method.as_str(),
            "driver action requested without a driver gateway"
        );
        Ok(())
    }
}

/// key: billing-adapter-gateway -> payment gateway invoice hooks
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(&self, invoice: &Invoice) -> Result<()>;
    async fn update_invoice(&self, invoice: &Invoice, previous: InvoiceStatus) -> Result<()>;
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_invoice(&self, invoice: &Invoice) -> Result<()> {
        let url = format!("{}/invoices", self.base_url);
        self.client
            .post(&url)
            .json(invoice)
            .send()
            .await
            .with_context(|| format!("failed to reach payment gateway at {url}"))?
            .error_for_status()?;
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice, previous: InvoiceStatus) -> Result<()> {
        let url = format!("{}/invoices/{}", self.base_url, invoice.uuid);
        self.client
            .put(&url)
            .json(&json!({
                "invoice": invoice,
                "previous_status": previous.as_str(),
            }))
            .send()
            .await
            .with_context(|| format!("failed to reach payment gateway at {url}"))?
            .error_for_status()?;
        Ok(())
    }
}

pub struct NoopPaymentGateway;

#[async_trait]
impl PaymentGateway for NoopPaymentGateway {
    async fn create_invoice(&self, _invoice: &Invoice) -> Result<()> {
        Ok(())
    }

    async fn update_invoice(&self, _invoice: &Invoice, _previous: InvoiceStatus) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum BillingEvent {
    InvoiceCreated { invoice: Uuid, account: Uuid, total: f64 },
    InvoicePaid { invoice: Uuid, account: Uuid, total: f64 },
    InvoiceReturned { invoice: Uuid, account: Uuid, total: f64 },
}

impl BillingEvent {
    pub fn key(&self) -> &'static str {
        match self {
            BillingEvent::InvoiceCreated { .. } => "invoice_created",
            BillingEvent::InvoicePaid { .. } => "invoice_paid",
            BillingEvent::InvoiceReturned { .. } => "invoice_returned",
        }
    }
}

/// key: billing-adapter-events -> fire-and-forget notifications
pub trait EventNotifier: Send + Sync {
    fn publish(&self, event: BillingEvent);
}

pub struct TracingNotifier;

impl EventNotifier for TracingNotifier {
    fn publish(&self, event: BillingEvent) {
        info!(event = event.key(), ?event, "billing event");
    }
}

/// Forwards events to an in-process channel; a closed receiver drops them.
pub struct ChannelNotifier {
    sender: UnboundedSender<BillingEvent>,
}

impl ChannelNotifier {
    pub fn new(sender: UnboundedSender<BillingEvent>) -> Self {
        Self { sender }
    }
}

impl EventNotifier for ChannelNotifier {
    fn publish(&self, event: BillingEvent) {
        let _ = self.sender.send(event);
    }
}
