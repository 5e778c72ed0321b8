use std::sync::Arc;

use uuid::Uuid;

use crate::config;
use crate::store::Stores;
use crate::telemetry::RoutineRegistry;

use super::adapters::{
    AccountLifecycle, EventNotifier, HttpDriverClient, HttpPaymentGateway, LoggingDriver,
    NoopPaymentGateway, PaymentGateway, ServiceDriver, StoreAccountLifecycle, TracingNotifier,
};
use super::consumer::InstanceStartInvoicer;
use super::currency::CurrencyGraph;
use super::gate::TransactionGate;
use super::invoices::InvoiceStateMachine;
use super::ledger::UsageLedgerPipeline;
use super::promo::PromoDiscountResolver;
use super::renewal::RenewalInvoiceIssuer;
use super::settings::{HttpSettingsClient, SettingsSource, StaticSettings};
use super::suspension::SuspensionEngine;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub settings: Arc<dyn SettingsSource>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub driver: Arc<dyn ServiceDriver>,
    pub notifier: Arc<dyn EventNotifier>,
    pub lifecycle: Arc<dyn AccountLifecycle>,
}

impl Collaborators {
    /// In-process defaults: static settings, no gateway, logging driver.
    pub fn local(stores: &Stores) -> Self {
        Self {
            settings: Arc::new(StaticSettings::new()),
            gateway: Arc::new(NoopPaymentGateway),
            driver: Arc::new(LoggingDriver),
            notifier: Arc::new(TracingNotifier),
            lifecycle: Arc::new(StoreAccountLifecycle::new(stores.accounts.clone())),
        }
    }

    /// HTTP clients for every collaborator whose base url is configured.
    pub fn from_env(stores: &Stores) -> Self {
        let mut collaborators = Self::local(stores);
        if let Some(url) = config::BILLING_SETTINGS_URL.as_deref() {
            collaborators.settings = Arc::new(HttpSettingsClient::new(url));
        }
        if let Some(url) = config::BILLING_PAYMENT_GATEWAY_URL.as_deref() {
            collaborators.gateway = Arc::new(HttpPaymentGateway::new(url));
        }
        if let Some(url) = config::BILLING_DRIVER_URL.as_deref() {
            collaborators.driver = Arc::new(HttpDriverClient::new(url));
        }
        collaborators
    }
}

/// key: billing-service -> settlement engine wiring
#[derive(Clone)]
pub struct BillingEngine {
    pub stores: Stores,
    pub settings: Arc<dyn SettingsSource>,
    pub currencies: CurrencyGraph,
    pub gate: TransactionGate,
    pub ledger: UsageLedgerPipeline,
    pub promo: PromoDiscountResolver,
    pub invoices: InvoiceStateMachine,
    pub suspension: SuspensionEngine,
    pub renewal: RenewalInvoiceIssuer,
    pub start_invoicer: InstanceStartInvoicer,
    pub routines: RoutineRegistry,
}

impl BillingEngine {
    pub fn new(stores: Stores, collaborators: Collaborators, root: Uuid) -> Self {
        let Collaborators {
            settings,
            gateway,
            driver,
            notifier,
            lifecycle,
        } = collaborators;

        let currencies = CurrencyGraph::new(stores.currencies.clone());
        let gate = TransactionGate::new();
        let ledger = UsageLedgerPipeline::new(stores.clone(), currencies.clone(), settings.clone());
        let promo = PromoDiscountResolver::new(stores.clone(), currencies.clone());
        let invoices = InvoiceStateMachine::new(
            stores.clone(),
            currencies.clone(),
            ledger.clone(),
            gate.clone(),
            settings.clone(),
            gateway,
            driver,
            notifier,
            root,
        );
        let suspension = SuspensionEngine::new(stores.accounts.clone(), lifecycle);
        let renewal = RenewalInvoiceIssuer::new(
            stores.clone(),
            currencies.clone(),
            promo.clone(),
            invoices.clone(),
            settings.clone(),
        );
        let start_invoicer = InstanceStartInvoicer::new(
            stores.clone(),
            currencies.clone(),
            promo.clone(),
            invoices.clone(),
            settings.clone(),
        );

        Self {
            stores,
            settings,
            currencies,
            gate,
            ledger,
            promo,
            invoices,
            suspension,
            renewal,
            start_invoicer,
            routines: RoutineRegistry::new(),
        }
    }

    pub fn is_root(&self, account: Uuid) -> bool {
        self.invoices.is_root(account)
    }
}
