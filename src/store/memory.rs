use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::billing::models::{
    Account, Currency, ExchangeRate, Instance, Invoice, InvoiceStatus, PromoEntry, Promocode,
    Record, Service, Transaction,
};

use super::{
    AccountStore, CurrencyStore, InstanceStore, InvoiceFilter, InvoiceStore, LedgerStore,
    NumberScope, PromocodeStore, RoutineStore,
};

#[derive(Default)]
struct State {
    currencies: HashMap<i32, Currency>,
    rates: HashMap<(i32, i32), ExchangeRate>,
    accounts: HashMap<Uuid, Account>,
    services: HashMap<Uuid, Service>,
    instances: HashMap<Uuid, Instance>,
    records: HashMap<Uuid, Record>,
    transactions: HashMap<Uuid, Transaction>,
    invoices: HashMap<Uuid, Invoice>,
    promocodes: HashMap<Uuid, Promocode>,
    routine_runs: HashMap<String, DateTime<Utc>>,
}

/// key: billing-store-memory -> process-local store for tests and single-node runs
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.state.read().await.records.values().cloned().collect()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<_> = self
            .state
            .read()
            .await
            .transactions
            .values()
            .cloned()
            .collect();
        transactions.sort_by_key(|tx| tx.created);
        transactions
    }
}

#[async_trait]
impl CurrencyStore for MemoryStore {
    async fn list_currencies(&self) -> Result<Vec<Currency>> {
        let mut currencies: Vec<_> = self.state.read().await.currencies.values().cloned().collect();
        currencies.sort_by_key(|currency| currency.id);
        Ok(currencies)
    }

    async fn get_currency(&self, id: i32) -> Result<Option<Currency>> {
        Ok(self.state.read().await.currencies.get(&id).cloned())
    }

    async fn upsert_currency(&self, currency: &Currency) -> Result<()> {
        self.state
            .write()
            .await
            .currencies
            .insert(currency.id, currency.clone());
        Ok(())
    }

    async fn list_rates(&self) -> Result<Vec<ExchangeRate>> {
        let mut rates: Vec<_> = self.state.read().await.rates.values().cloned().collect();
        rates.sort_by_key(|rate| (rate.from, rate.to));
        Ok(rates)
    }

    async fn get_rate(&self, from: i32, to: i32) -> Result<Option<ExchangeRate>> {
        Ok(self.state.read().await.rates.get(&(from, to)).cloned())
    }

    async fn upsert_rate(&self, rate: &ExchangeRate) -> Result<()> {
        self.state
            .write()
            .await
            .rates
            .insert((rate.from, rate.to), rate.clone());
        Ok(())
    }

    async fn update_rate(&self, rate: &ExchangeRate) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.rates.get_mut(&(rate.from, rate.to)) {
            Some(existing) => {
                *existing = rate.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rate(&self, from: i32, to: i32) -> Result<bool> {
        Ok(self.state.write().await.rates.remove(&(from, to)).is_some())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, uuid: Uuid) -> Result<Option<Account>> {
        Ok(self.state.read().await.accounts.get(&uuid).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.state
            .write()
            .await
            .accounts
            .insert(account.uuid, account.clone());
        Ok(())
    }

    async fn adjust_balance(&self, uuid: Uuid, delta: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&uuid)
            .ok_or_else(|| anyhow!("account {uuid} not found"))?;
        account.balance += delta;
        Ok(())
    }

    async fn set_suspended(&self, uuid: Uuid, suspended: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&uuid)
            .ok_or_else(|| anyhow!("account {uuid} not found"))?;
        account.suspended = suspended;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.state.read().await.services.values().cloned().collect())
    }

    async fn get_service(&self, uuid: Uuid) -> Result<Option<Service>> {
        Ok(self.state.read().await.services.get(&uuid).cloned())
    }

    async fn upsert_service(&self, service: &Service) -> Result<()> {
        self.state
            .write()
            .await
            .services
            .insert(service.uuid, service.clone());
        Ok(())
    }

    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>> {
        Ok(self.state.read().await.instances.get(&uuid).cloned())
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<()> {
        self.state
            .write()
            .await
            .instances
            .insert(instance.uuid, instance.clone());
        Ok(())
    }

    async fn list_instances(&self, service: Uuid) -> Result<Vec<Instance>> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|instance| instance.service == service)
            .cloned()
            .collect())
    }

    async fn set_instance_config(&self, uuid: Uuid, key: &str, value: Value) -> Result<()> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(&uuid)
            .ok_or_else(|| anyhow!("instance {uuid} not found"))?;
        instance.config.insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_record(&self, record: &Record) -> Result<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.uuid, record.clone());
        Ok(())
    }

    async fn overlapping_records(&self, record: &Record) -> Result<Vec<Record>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|existing| existing.uuid != record.uuid && existing.overlaps(record))
            .cloned()
            .collect())
    }

    async fn pending_records(
        &self,
        instances: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        let mut records: Vec<_> = self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|record| {
                !record.processed && record.exec <= now && instances.contains(&record.instance)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.exec);
        Ok(records)
    }

    async fn claim_record(&self, uuid: Uuid, total: f64, currency: i32) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.records.get_mut(&uuid) {
            Some(record) if !record.processed => {
                record.processed = true;
                record.total = total;
                record.currency = Some(currency);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.state
            .write()
            .await
            .transactions
            .insert(transaction.uuid, transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, uuid: Uuid) -> Result<Option<Transaction>> {
        Ok(self.state.read().await.transactions.get(&uuid).cloned())
    }

    async fn due_transactions(
        &self,
        account: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let mut due: Vec<_> = self
            .state
            .read()
            .await
            .transactions
            .values()
            .filter(|tx| tx.is_due(now) && account.map_or(true, |account| tx.account == account))
            .cloned()
            .collect();
        due.sort_by_key(|tx| tx.created);
        Ok(due)
    }

    async fn schedule_transaction(&self, uuid: Uuid, exec: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let transaction = state
            .transactions
            .get_mut(&uuid)
            .ok_or_else(|| anyhow!("transaction {uuid} not found"))?;
        transaction.exec = Some(exec);
        Ok(())
    }

    async fn settle_transaction(
        &self,
        transaction: &Transaction,
        total: f64,
        currency: i32,
        proc: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(&transaction.account) {
            return Err(anyhow!("account {} not found", transaction.account));
        }
        match state.transactions.get_mut(&transaction.uuid) {
            Some(stored) if !stored.processed => {
                stored.processed = true;
                stored.proc = Some(proc);
                stored.total = total;
                stored.currency = currency;
            }
            _ => return Ok(false),
        }
        if let Some(account) = state.accounts.get_mut(&transaction.account) {
            account.balance -= total;
        }
        Ok(true)
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        self.state
            .write()
            .await
            .invoices
            .insert(invoice.uuid, invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, uuid: Uuid) -> Result<Option<Invoice>> {
        Ok(self.state.read().await.invoices.get(&uuid).cloned())
    }

    async fn replace_invoice(&self, invoice: &Invoice) -> Result<()> {
        let mut state = self.state.write().await;
        match state.invoices.get_mut(&invoice.uuid) {
            Some(existing) => {
                *existing = invoice.clone();
                Ok(())
            }
            None => Err(anyhow!("invoice {} not found", invoice.uuid)),
        }
    }

    async fn replace_invoice_if_status(
        &self,
        invoice: &Invoice,
        expected: InvoiceStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.invoices.get_mut(&invoice.uuid) {
            Some(existing) if existing.status == expected => {
                *existing = invoice.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(anyhow!("invoice {} not found", invoice.uuid)),
        }
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let mut invoices: Vec<_> = self
            .state
            .read()
            .await
            .invoices
            .values()
            .filter(|invoice| filter.account.map_or(true, |account| invoice.account == account))
            .filter(|invoice| filter.status.map_or(true, |status| invoice.status == status))
            .cloned()
            .collect();
        invoices.sort_by_key(|invoice| invoice.created);
        Ok(invoices)
    }

    async fn max_numeric_number(&self, scope: NumberScope) -> Result<i64> {
        Ok(self
            .state
            .read()
            .await
            .invoices
            .values()
            .filter(|invoice| invoice.status == scope.status)
            .filter(|invoice| match (scope.payment_window, invoice.payment) {
                (None, _) => true,
                (Some((start, end)), Some(payment)) => payment >= start && payment < end,
                (Some(_), None) => false,
            })
            .map(|invoice| invoice.numeric_number)
            .max()
            .unwrap_or(0))
    }
}

#[async_trait]
impl PromocodeStore for MemoryStore {
    async fn get_promocode(&self, uuid: Uuid) -> Result<Option<Promocode>> {
        Ok(self.state.read().await.promocodes.get(&uuid).cloned())
    }

    async fn upsert_promocode(&self, promocode: &Promocode) -> Result<()> {
        self.state
            .write()
            .await
            .promocodes
            .insert(promocode.uuid, promocode.clone());
        Ok(())
    }

    async fn promocodes_for_instance(&self, instance: Uuid) -> Result<Vec<Promocode>> {
        Ok(self
            .state
            .read()
            .await
            .promocodes
            .values()
            .filter(|promo| promo.entry_for_instance(instance).is_some())
            .cloned()
            .collect())
    }

    async fn add_promocode_use(&self, uuid: Uuid, entry: &PromoEntry) -> Result<bool> {
        let mut state = self.state.write().await;
        let promocode = state
            .promocodes
            .get_mut(&uuid)
            .ok_or_else(|| anyhow!("promocode {uuid} not found"))?;
        if promocode.uses.iter().any(|existing| existing.same_target(entry)) {
            return Ok(false);
        }
        promocode.uses.push(entry.clone());
        Ok(true)
    }
}

#[async_trait]
impl RoutineStore for MemoryStore {
    async fn last_run(&self, routine: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.read().await.routine_runs.get(routine).copied())
    }

    async fn record_run(&self, routine: &str, at: DateTime<Utc>) -> Result<()> {
        self.state
            .write()
            .await
            .routine_runs
            .insert(routine.to_string(), at);
        Ok(())
    }
}
