use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::billing::models::{
    Account, Currency, ExchangeRate, Instance, Invoice, InvoiceStatus, PromoEntry, Promocode,
    Record, Service, Transaction,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// key: billing-store-currency -> currency vertices and exchange edges
#[async_trait]
pub trait CurrencyStore: Send + Sync {
    async fn list_currencies(&self) -> Result<Vec<Currency>>;
    async fn get_currency(&self, id: i32) -> Result<Option<Currency>>;
    async fn upsert_currency(&self, currency: &Currency) -> Result<()>;
    async fn list_rates(&self) -> Result<Vec<ExchangeRate>>;
    async fn get_rate(&self, from: i32, to: i32) -> Result<Option<ExchangeRate>>;
    /// Inserts or replaces the edge keyed by `(from, to)`.
    async fn upsert_rate(&self, rate: &ExchangeRate) -> Result<()>;
    /// Returns `false` when no such edge exists.
    async fn update_rate(&self, rate: &ExchangeRate) -> Result<bool>;
    async fn delete_rate(&self, from: i32, to: i32) -> Result<bool>;
}

/// key: billing-store-account -> balances and suspension flags
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, uuid: Uuid) -> Result<Option<Account>>;
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn upsert_account(&self, account: &Account) -> Result<()>;
    /// Single atomic `balance = balance + delta` update.
    async fn adjust_balance(&self, uuid: Uuid, delta: f64) -> Result<()>;
    async fn set_suspended(&self, uuid: Uuid, suspended: bool) -> Result<()>;
}

/// key: billing-store-instance -> services, instances and their plans
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn get_service(&self, uuid: Uuid) -> Result<Option<Service>>;
    async fn upsert_service(&self, service: &Service) -> Result<()>;
    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>>;
    async fn upsert_instance(&self, instance: &Instance) -> Result<()>;
    async fn list_instances(&self, service: Uuid) -> Result<Vec<Instance>>;
    async fn set_instance_config(&self, uuid: Uuid, key: &str, value: Value) -> Result<()>;
}

/// key: billing-store-ledger -> records and transactions
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_record(&self, record: &Record) -> Result<()>;
    async fn overlapping_records(&self, record: &Record) -> Result<Vec<Record>>;
    async fn pending_records(&self, instances: &[Uuid], now: DateTime<Utc>)
        -> Result<Vec<Record>>;
    /// Marks the record processed with its converted total, only if it is not yet processed.
    async fn claim_record(&self, uuid: Uuid, total: f64, currency: i32) -> Result<bool>;
    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()>;
    async fn get_transaction(&self, uuid: Uuid) -> Result<Option<Transaction>>;
    async fn due_transactions(
        &self,
        account: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;
    async fn schedule_transaction(&self, uuid: Uuid, exec: DateTime<Utc>) -> Result<()>;
    /// Claims an unprocessed transaction and debits the account by `total` in one step.
    /// Returns `false` when another pipeline already settled it.
    async fn settle_transaction(
        &self,
        transaction: &Transaction,
        total: f64,
        currency: i32,
        proc: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Invoice subset scanned when allocating a numeric number.
#[derive(Debug, Clone, Copy)]
pub struct NumberScope {
    pub status: InvoiceStatus,
    /// Payment window `[start, end)`; `None` scans all invoices in `status`.
    pub payment_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub account: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

/// key: billing-store-invoice -> invoice documents
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()>;
    async fn get_invoice(&self, uuid: Uuid) -> Result<Option<Invoice>>;
    async fn replace_invoice(&self, invoice: &Invoice) -> Result<()>;
    /// Replaces the stored invoice only while its status is still `expected`.
    async fn replace_invoice_if_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<bool>;
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>>;
    async fn max_numeric_number(&self, scope: NumberScope) -> Result<i64>;
}

/// key: billing-store-promocode -> promocodes and their uses
#[async_trait]
pub trait PromocodeStore: Send + Sync {
    async fn get_promocode(&self, uuid: Uuid) -> Result<Option<Promocode>>;
    async fn upsert_promocode(&self, promocode: &Promocode) -> Result<()>;
    async fn promocodes_for_instance(&self, instance: Uuid) -> Result<Vec<Promocode>>;
    /// Returns `false` when an entry for the same target already exists.
    async fn add_promocode_use(&self, uuid: Uuid, entry: &PromoEntry) -> Result<bool>;
}

/// key: billing-store-routine -> last completed run of scheduled routines
#[async_trait]
pub trait RoutineStore: Send + Sync {
    async fn last_run(&self, routine: &str) -> Result<Option<DateTime<Utc>>>;
    async fn record_run(&self, routine: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Handles to every store the engine reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub currencies: Arc<dyn CurrencyStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub promocodes: Arc<dyn PromocodeStore>,
    pub routines: Arc<dyn RoutineStore>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: CurrencyStore
            + AccountStore
            + InstanceStore
            + LedgerStore
            + InvoiceStore
            + PromocodeStore
            + RoutineStore
            + 'static,
    {
        Self {
            currencies: backend.clone(),
            accounts: backend.clone(),
            instances: backend.clone(),
            ledger: backend.clone(),
            invoices: backend.clone(),
            promocodes: backend.clone(),
            routines: backend,
        }
    }

    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::default());
        (Self::from_backend(backend.clone()), backend)
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self::from_backend(Arc::new(PostgresStore::new(pool)))
    }
}
