use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::Stores;

use super::currency::CurrencyGraph;
use super::models::{Account, Currency, Instance, Priority, Record, Rounding, Service, Transaction};
use super::settings::{fetch_or_default, CurrencyConf, RoundingConf, SettingsSource};

/// Settings a single pipeline pass works with.
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub platform: Currency,
    pub rounding: Rounding,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Skipped(&'static str),
    Stored,
    /// Urgent record already settled against the balance.
    Settled,
}

/// key: billing-ledger -> records to transactions to balances
#[derive(Clone)]
pub struct UsageLedgerPipeline {
    stores: Stores,
    currencies: CurrencyGraph,
    settings: Arc<dyn SettingsSource>,
}

impl UsageLedgerPipeline {
    pub fn new(
        stores: Stores,
        currencies: CurrencyGraph,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            stores,
            currencies,
            settings,
        }
    }

    pub async fn policy(&self) -> LedgerPolicy {
        let platform: CurrencyConf = fetch_or_default(self.settings.as_ref()).await;
        let rounding: RoundingConf = fetch_or_default(self.settings.as_ref()).await;
        LedgerPolicy {
            platform: platform.currency,
            rounding: rounding.rounding,
        }
    }

    /// Aggregates every due record into one transaction per service.
    pub async fn generate(&self, now: DateTime<Utc>) -> BillingResult<PassSummary> {
        let policy = self.policy().await;
        let services = self.stores.instances.list_services().await?;
        let mut summary = PassSummary::default();
        for service in services {
            match self.generate_for_service(&service, &policy, now).await {
                Ok(Some(transaction)) => {
                    summary.succeeded += 1;
                    debug!(
                        service = %service.uuid,
                        transaction = %transaction.uuid,
                        total = transaction.total,
                        "transaction generated"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        ?err,
                        service = %service.uuid,
                        "failed to generate transactions for service"
                    );
                }
            }
        }
        Ok(summary)
    }

    pub async fn generate_for_service(
        &self,
        service: &Service,
        policy: &LedgerPolicy,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Transaction>> {
        let account = self.account(service.account).await?;
        let instances: Vec<Uuid> = self
            .stores
            .instances
            .list_instances(service.uuid)
            .await?
            .into_iter()
            .map(|instance| instance.uuid)
            .collect();
        if instances.is_empty() {
            return Ok(None);
        }

        let records = self.stores.ledger.pending_records(&instances, now).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let target = account.currency_or(policy.platform.id);
        let precision = self.precision_of(target, policy).await?;

        let mut claimed = Vec::with_capacity(records.len());
        let mut total = 0.0;
        let mut priority = Priority::Normal;
        for record in records {
            let from = record.currency.unwrap_or(policy.platform.id);
            let converted = match self.currencies.convert(from, target, record.total).await {
                Ok(amount) => policy.rounding.apply(amount, precision),
                Err(err) => {
                    warn!(?err, record = %record.uuid, from, to = target, "cannot convert record");
                    continue;
                }
            };
            if !self
                .stores
                .ledger
                .claim_record(record.uuid, converted, target)
                .await?
            {
                debug!(record = %record.uuid, "record already claimed by another pass");
                continue;
            }
            if record.priority != Priority::Normal {
                priority = Priority::Urgent;
            }
            total += converted;
            claimed.push(record.uuid);
        }

        if claimed.is_empty() {
            return Ok(None);
        }

        let mut transaction = Transaction::new(account.uuid, target, total, now);
        transaction.service = Some(service.uuid);
        transaction.records = claimed;
        transaction.exec = Some(now);
        transaction.priority = priority;
        self.stores.ledger.insert_transaction(&transaction).await?;
        Ok(Some(transaction))
    }

    /// Settles every due transaction against its account balance.
    pub async fn process(&self, now: DateTime<Utc>) -> BillingResult<PassSummary> {
        self.process_scoped(None, now).await
    }

    pub async fn process_for_account(
        &self,
        account: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<PassSummary> {
        self.process_scoped(Some(account), now).await
    }

    async fn process_scoped(
        &self,
        account: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<PassSummary> {
        let policy = self.policy().await;
        let due = self.stores.ledger.due_transactions(account, now).await?;
        let mut summary = PassSummary::default();
        for transaction in due {
            match self.settle(&transaction, &policy, now).await {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => debug!(transaction = %transaction.uuid, "transaction already settled"),
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        ?err,
                        transaction = %transaction.uuid,
                        account = %transaction.account,
                        "failed to process transaction"
                    );
                }
            }
        }
        Ok(summary)
    }

    async fn settle(
        &self,
        transaction: &Transaction,
        policy: &LedgerPolicy,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let account = self.account(transaction.account).await?;
        let target = account.currency_or(policy.platform.id);
        let total = if transaction.currency == target {
            transaction.total
        } else {
            let converted = self
                .currencies
                .convert(transaction.currency, target, transaction.total)
                .await?;
            policy
                .rounding
                .apply(converted, self.precision_of(target, policy).await?)
        };
        Ok(self
            .stores
            .ledger
            .settle_transaction(transaction, total, target, now)
            .await?)
    }

    /// Stores a usage record, settling it inline when it is not a normal-priority record.
    pub async fn ingest_record(
        &self,
        record: Record,
        now: DateTime<Utc>,
    ) -> BillingResult<IngestOutcome> {
        if record.total == 0.0 {
            return Ok(IngestOutcome::Skipped("zero total"));
        }
        if record.end < record.start {
            return Err(BillingError::invalid("record ends before it starts"));
        }

        let instance = self
            .stores
            .instances
            .get_instance(record.instance)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("instance {}", record.instance)))?;
        let service = self
            .stores
            .instances
            .get_service(instance.service)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("service {}", instance.service)))?;
        let account = self.account(service.account).await?;

        if !check_record(&record, &instance, &account) {
            info!(
                record = %record.uuid,
                account = %account.uuid,
                "prepaid record dropped for suspended account"
            );
            return Ok(IngestOutcome::Skipped("prepaid record for suspended account"));
        }

        if record.priority != Priority::Additional {
            let overlapping = self.stores.ledger.overlapping_records(&record).await?;
            if !overlapping.is_empty() {
                return Err(BillingError::invalid(format!(
                    "record overlaps {} existing record(s) for {}/{}",
                    overlapping.len(),
                    record.instance,
                    record.resource
                )));
            }
        }

        self.stores.ledger.insert_record(&record).await?;
        if record.priority == Priority::Normal {
            return Ok(IngestOutcome::Stored);
        }

        let policy = self.policy().await;
        self.generate_for_service(&service, &policy, now).await?;
        self.process_for_account(account.uuid, now).await?;
        Ok(IngestOutcome::Settled)
    }

    async fn account(&self, uuid: Uuid) -> BillingResult<Account> {
        self.stores
            .accounts
            .get_account(uuid)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("account {uuid}")))
    }

    async fn precision_of(&self, currency: i32, policy: &LedgerPolicy) -> BillingResult<i32> {
        if currency == policy.platform.id {
            return Ok(policy.platform.precision);
        }
        Ok(self
            .currencies
            .get_currency(currency)
            .await?
            .map(|currency| currency.precision)
            .unwrap_or(policy.platform.precision))
    }
}

/// Records for prepaid products or resources are dropped while the account is suspended.
pub fn check_record(record: &Record, instance: &Instance, account: &Account) -> bool {
    if !account.suspended {
        return true;
    }
    let plan = &instance.billing_plan;
    let prepaid = match &record.product {
        Some(product) => plan
            .products
            .get(product)
            .map(|product| product.prepaid)
            .unwrap_or(false),
        None => plan
            .resources
            .iter()
            .find(|resource| resource.key == record.resource)
            .map(|resource| resource.prepaid)
            .unwrap_or(false),
    };
    !prepaid
}
